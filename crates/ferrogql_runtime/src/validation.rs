//! Document validation against a schema.
//!
//! Every rule runs and every violation is kept, in the order it was found.

use crate::schema::{ObjectDef, Schema, TypeDef};
use ferrogql_core::{ErrorCode, FormattedError, Span};
use ferrogql_syntax::{
    Definition, Directive, Document, FragmentDefinition, Name, OperationDefinition, Selection,
    SelectionSet, DEFAULT_MAX_DEPTH,
};
use rustc_hash::{FxHashMap, FxHashSet};

/// Directives the executor understands.
const KNOWN_DIRECTIVES: [&str; 2] = ["skip", "include"];

/// The outcome of validating a document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationOutcome {
    pub errors: Vec<FormattedError>,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validates `document` against `schema`.
pub fn validate(schema: &Schema, document: &Document) -> ValidationOutcome {
    validate_with_max_depth(schema, document, DEFAULT_MAX_DEPTH)
}

/// Validates `document`, rejecting selections nested deeper than
/// `max_depth` once fragment spreads are followed.
///
/// A document over the limit gets only that error; the other rules are
/// skipped.
pub fn validate_with_max_depth(
    schema: &Schema,
    document: &Document,
    max_depth: usize,
) -> ValidationOutcome {
    let mut validator = Validator {
        schema,
        document,
        errors: Vec::new(),
    };

    validator.max_depth(max_depth);
    if !validator.errors.is_empty() {
        return ValidationOutcome {
            errors: validator.errors,
        };
    }

    validator.unique_operation_names();
    validator.lone_anonymous_operation();
    validator.known_root_types();
    validator.single_field_subscriptions();
    validator.no_fragment_cycles();
    validator.selections();
    validator.no_undefined_variables();

    ValidationOutcome {
        errors: validator.errors,
    }
}

struct Validator<'a> {
    schema: &'a Schema,
    document: &'a Document,
    errors: Vec<FormattedError>,
}

impl<'a> Validator<'a> {
    fn report(&mut self, message: String, spans: &[Span]) {
        let mut error = FormattedError::new(message).with_code(ErrorCode::GraphqlValidationFailed);
        for span in spans {
            error = error.with_location(self.document.location(*span));
        }
        self.errors.push(error);
    }

    fn max_depth(&mut self, limit: usize) {
        let document = self.document;
        let mut depth = DepthCheck::new(document);
        let too_deep = document.definitions.iter().find_map(|definition| {
            let (set, span) = match definition {
                Definition::Operation(op) => (&op.selection_set, op.span),
                Definition::Fragment(fragment) => (&fragment.selection_set, fragment.span),
            };
            depth.selection_set(set, limit).is_none().then_some(span)
        });

        if let Some(span) = too_deep {
            self.report(
                format!("Selections are nested deeper than {limit} levels."),
                &[span],
            );
        }
    }

    fn unique_operation_names(&mut self) {
        let mut seen: Vec<&Name> = Vec::new();
        for op in self.document.operations() {
            let Some(name) = &op.name else { continue };
            match seen.iter().find(|prev| prev.value == name.value) {
                Some(prev) => {
                    let spans = [prev.span, name.span];
                    self.report(
                        format!("There can be only one operation named \"{}\".", name.value),
                        &spans,
                    );
                }
                None => seen.push(name),
            }
        }
    }

    fn lone_anonymous_operation(&mut self) {
        let count = self.document.operations().count();
        if count <= 1 {
            return;
        }
        let anonymous: Vec<Span> = self
            .document
            .operations()
            .filter(|op| op.name.is_none())
            .map(|op| op.span)
            .collect();
        for span in anonymous {
            self.report(
                "This anonymous operation must be the only defined operation.".to_string(),
                &[span],
            );
        }
    }

    fn known_root_types(&mut self) {
        let missing: Vec<(String, Span)> = self
            .document
            .operations()
            .filter(|op| self.schema.root_type(op.operation).is_none())
            .map(|op| (op.operation.to_string(), op.span))
            .collect();
        for (kind, span) in missing {
            self.report(
                format!("Schema is not configured to execute {kind} operation."),
                &[span],
            );
        }
    }

    fn single_field_subscriptions(&mut self) {
        let document = self.document;
        for op in document.operations() {
            if op.operation != ferrogql_syntax::OperationType::Subscription {
                continue;
            }
            let mut keys: Vec<(&str, Span)> = Vec::new();
            let mut visited = FxHashSet::default();
            root_fields(document, &op.selection_set, &mut visited, &mut keys);

            let mut distinct: Vec<&str> = Vec::new();
            let mut extra = Vec::new();
            for (key, span) in keys {
                if distinct.contains(&key) {
                    continue;
                }
                if !distinct.is_empty() {
                    extra.push(span);
                }
                distinct.push(key);
            }

            if !extra.is_empty() {
                let message = match &op.name {
                    Some(name) => format!(
                        "Subscription \"{}\" must select only one top level field.",
                        name.value
                    ),
                    None => "Anonymous Subscription must select only one top level field."
                        .to_string(),
                };
                self.report(message, &extra);
            }
        }
    }

    fn no_fragment_cycles(&mut self) {
        let document = self.document;
        let mut done: FxHashSet<&str> = FxHashSet::default();
        let mut found = Vec::new();

        for fragment in document.fragments() {
            if done.contains(fragment.name.value.as_str()) {
                continue;
            }
            let mut stack = vec![fragment];
            detect_cycles(document, fragment, &mut stack, &mut done, &mut found);
        }

        for (message, spans) in found {
            self.report(message, &spans);
        }
    }

    fn selections(&mut self) {
        let document = self.document;
        for definition in &document.definitions {
            match definition {
                ferrogql_syntax::Definition::Operation(op) => self.operation(op),
                ferrogql_syntax::Definition::Fragment(fragment) => self.fragment(fragment),
            }
        }
    }

    fn operation(&mut self, op: &'a OperationDefinition) {
        self.directives(&op.directives);
        if let Some(root) = self.schema.root_type(op.operation) {
            self.selection_set(root, &op.selection_set);
        }
    }

    fn fragment(&mut self, fragment: &'a FragmentDefinition) {
        self.directives(&fragment.directives);
        let condition = &fragment.type_condition;
        match self.schema.get_type(&condition.value) {
            None => self.report(format!("Unknown type \"{}\".", condition.value), &[condition.span]),
            Some(TypeDef::Object(object)) => self.selection_set(object, &fragment.selection_set),
            Some(_) => self.report(
                format!(
                    "Fragment \"{}\" cannot condition on non composite type \"{}\".",
                    fragment.name.value, condition.value
                ),
                &[condition.span],
            ),
        }
    }

    fn selection_set(&mut self, parent: &'a ObjectDef, set: &'a SelectionSet) {
        for selection in &set.selections {
            self.directives(selection.directives());
            match selection {
                Selection::Field(field) => {
                    if field.name.value == "__typename" {
                        continue;
                    }
                    let Some(def) = parent.fields.get(&field.name.value) else {
                        self.report(
                            format!(
                                "Cannot query field \"{}\" on type \"{}\".",
                                field.name.value, parent.name
                            ),
                            &[field.span],
                        );
                        continue;
                    };

                    for arg in &field.arguments {
                        if !def.arguments.contains_key(&arg.name.value) {
                            self.report(
                                format!(
                                    "Unknown argument \"{}\" on field \"{}.{}\".",
                                    arg.name.value, parent.name, def.name
                                ),
                                &[arg.span],
                            );
                        }
                    }

                    let field_type = self.schema.get_type(def.ty.base_name());
                    match (field_type, &field.selection_set) {
                        (Some(TypeDef::Object(object)), Some(sub)) => self.selection_set(object, sub),
                        (Some(TypeDef::Object(_)), None) => self.report(
                            format!(
                                "Field \"{}\" of type \"{}\" must have a selection of subfields. Did you mean \"{} {{ ... }}\"?",
                                field.name.value, def.ty, field.name.value
                            ),
                            &[field.span],
                        ),
                        (Some(_), Some(sub)) => self.report(
                            format!(
                                "Field \"{}\" must not have a selection since type \"{}\" has no subfields.",
                                field.name.value, def.ty
                            ),
                            &[sub.span],
                        ),
                        _ => {}
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let Some(fragment) = self.document.fragment(&spread.name.value) else {
                        self.report(
                            format!("Unknown fragment \"{}\".", spread.name.value),
                            &[spread.name.span],
                        );
                        continue;
                    };
                    let condition = &fragment.type_condition.value;
                    if matches!(self.schema.get_type(condition), Some(TypeDef::Object(_)))
                        && *condition != parent.name
                    {
                        self.report(
                            format!(
                                "Fragment \"{}\" cannot be spread here as objects of type \"{}\" can never be of type \"{}\".",
                                spread.name.value, parent.name, condition
                            ),
                            &[spread.span],
                        );
                    }
                }
                Selection::InlineFragment(inline) => {
                    let Some(condition) = &inline.type_condition else {
                        self.selection_set(parent, &inline.selection_set);
                        continue;
                    };
                    match self.schema.get_type(&condition.value) {
                        None => self.report(
                            format!("Unknown type \"{}\".", condition.value),
                            &[condition.span],
                        ),
                        Some(TypeDef::Object(object)) => {
                            if object.name != parent.name {
                                self.report(
                                    format!(
                                        "Fragment cannot be spread here as objects of type \"{}\" can never be of type \"{}\".",
                                        parent.name, object.name
                                    ),
                                    &[inline.span],
                                );
                            }
                            self.selection_set(object, &inline.selection_set);
                        }
                        Some(_) => self.report(
                            format!(
                                "Fragment cannot condition on non composite type \"{}\".",
                                condition.value
                            ),
                            &[condition.span],
                        ),
                    }
                }
            }
        }
    }

    fn directives(&mut self, directives: &[Directive]) {
        for directive in directives {
            if !KNOWN_DIRECTIVES.contains(&directive.name.value.as_str()) {
                self.report(
                    format!("Unknown directive \"@{}\".", directive.name.value),
                    &[directive.span],
                );
            }
        }
    }

    fn no_undefined_variables(&mut self) {
        let document = self.document;
        for op in document.operations() {
            let mut used: Vec<&Name> = Vec::new();
            let mut visited = FxHashSet::default();
            variable_usages(document, &op.selection_set, &mut visited, &mut used);
            for directive in &op.directives {
                for arg in &directive.arguments {
                    arg.value.for_each_variable(&mut |name| used.push(name));
                }
            }

            for name in used {
                let defined = op
                    .variables
                    .iter()
                    .any(|var| var.name.value == name.value);
                if defined {
                    continue;
                }
                let message = match &op.name {
                    Some(op_name) => format!(
                        "Variable \"${}\" is not defined by operation \"{}\".",
                        name.value, op_name.value
                    ),
                    None => format!("Variable \"${}\" is not defined.", name.value),
                };
                self.report(message, &[name.span, op.span]);
            }
        }
    }
}

/// Measures selection nesting, following fragment spreads.
struct DepthCheck<'d> {
    fragments: FxHashMap<&'d str, &'d FragmentDefinition>,
    measured: FxHashMap<&'d str, usize>,
    active: FxHashSet<&'d str>,
}

impl<'d> DepthCheck<'d> {
    fn new(document: &'d Document) -> Self {
        Self {
            fragments: document
                .fragments()
                .map(|fragment| (fragment.name.value.as_str(), fragment))
                .collect(),
            measured: FxHashMap::default(),
            active: FxHashSet::default(),
        }
    }

    /// Nesting of `set`, or `None` once it exceeds `budget`.
    fn selection_set(&mut self, set: &'d SelectionSet, budget: usize) -> Option<usize> {
        let budget = budget.checked_sub(1)?;
        let mut deepest = 0;
        for selection in &set.selections {
            let depth = match selection {
                Selection::Field(field) => match &field.selection_set {
                    Some(sub) => self.selection_set(sub, budget)?,
                    None => 0,
                },
                Selection::InlineFragment(inline) => {
                    self.selection_set(&inline.selection_set, budget)?
                }
                Selection::FragmentSpread(spread) => self.spread(&spread.name.value, budget)?,
            };
            deepest = deepest.max(depth);
        }
        Some(deepest + 1)
    }

    fn spread(&mut self, name: &'d str, budget: usize) -> Option<usize> {
        if let Some(&depth) = self.measured.get(name) {
            return (depth <= budget).then_some(depth);
        }
        let Some(fragment) = self.fragments.get(name).copied() else {
            return Some(0);
        };
        // Cycles are reported by their own rule.
        if !self.active.insert(name) {
            return Some(0);
        }
        let depth = self.selection_set(&fragment.selection_set, budget);
        self.active.remove(name);
        if let Some(depth) = depth {
            self.measured.insert(name, depth);
        }
        depth
    }
}

/// Collects the response keys of a root selection set, following fragments.
fn root_fields<'d>(
    document: &'d Document,
    set: &'d SelectionSet,
    visited: &mut FxHashSet<&'d str>,
    out: &mut Vec<(&'d str, Span)>,
) {
    for selection in &set.selections {
        match selection {
            Selection::Field(field) => out.push((field.response_key(), field.span)),
            Selection::InlineFragment(inline) => {
                root_fields(document, &inline.selection_set, visited, out)
            }
            Selection::FragmentSpread(spread) => {
                if !visited.insert(spread.name.value.as_str()) {
                    continue;
                }
                if let Some(fragment) = document.fragment(&spread.name.value) {
                    root_fields(document, &fragment.selection_set, visited, out);
                }
            }
        }
    }
}

fn detect_cycles<'d>(
    document: &'d Document,
    fragment: &'d FragmentDefinition,
    stack: &mut Vec<&'d FragmentDefinition>,
    done: &mut FxHashSet<&'d str>,
    found: &mut Vec<(String, Vec<Span>)>,
) {
    done.insert(fragment.name.value.as_str());

    let mut spreads = Vec::new();
    spreads_in(&fragment.selection_set, &mut spreads);

    for spread in spreads {
        let Some(target) = document.fragment(&spread.value) else {
            continue;
        };
        if let Some(pos) = stack.iter().position(|f| f.name.value == target.name.value) {
            let via: Vec<&str> = stack[pos + 1..]
                .iter()
                .map(|f| f.name.value.as_str())
                .collect();
            let message = if via.is_empty() {
                format!("Cannot spread fragment \"{}\" within itself.", target.name.value)
            } else {
                format!(
                    "Cannot spread fragment \"{}\" within itself via {}.",
                    target.name.value,
                    via.join(", ")
                )
            };
            found.push((message, vec![spread.span]));
            continue;
        }
        if done.contains(target.name.value.as_str()) {
            continue;
        }
        stack.push(target);
        detect_cycles(document, target, stack, done, found);
        stack.pop();
    }
}

fn spreads_in<'d>(set: &'d SelectionSet, out: &mut Vec<&'d Name>) {
    for selection in &set.selections {
        match selection {
            Selection::Field(field) => {
                if let Some(sub) = &field.selection_set {
                    spreads_in(sub, out);
                }
            }
            Selection::FragmentSpread(spread) => out.push(&spread.name),
            Selection::InlineFragment(inline) => spreads_in(&inline.selection_set, out),
        }
    }
}

fn variable_usages<'d>(
    document: &'d Document,
    set: &'d SelectionSet,
    visited: &mut FxHashSet<&'d str>,
    out: &mut Vec<&'d Name>,
) {
    for selection in &set.selections {
        for directive in selection.directives() {
            for arg in &directive.arguments {
                arg.value.for_each_variable(&mut |name| out.push(name));
            }
        }
        match selection {
            Selection::Field(field) => {
                for arg in &field.arguments {
                    arg.value.for_each_variable(&mut |name| out.push(name));
                }
                if let Some(sub) = &field.selection_set {
                    variable_usages(document, sub, visited, out);
                }
            }
            Selection::InlineFragment(inline) => {
                variable_usages(document, &inline.selection_set, visited, out)
            }
            Selection::FragmentSpread(spread) => {
                if !visited.insert(spread.name.value.as_str()) {
                    continue;
                }
                if let Some(fragment) = document.fragment(&spread.name.value) {
                    variable_usages(document, &fragment.selection_set, visited, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EnumDef, FieldDef, InputValueDef, SchemaBuilder, TypeRef};

    fn schema() -> Schema {
        SchemaBuilder::new()
            .query_type("Query")
            .subscription_type("Subscription")
            .object(
                ObjectDef::new("Query")
                    .field(FieldDef::new("hello", TypeRef::named("String")))
                    .field(
                        FieldDef::new("user", TypeRef::named("User"))
                            .argument(InputValueDef::new("id", TypeRef::named_non_null("ID"))),
                    ),
            )
            .object(
                ObjectDef::new("User")
                    .field(FieldDef::new("name", TypeRef::named_non_null("String")))
                    .field(FieldDef::new("color", TypeRef::named("Color"))),
            )
            .object(
                ObjectDef::new("Subscription")
                    .field(FieldDef::new("counter", TypeRef::named_non_null("Int")))
                    .field(FieldDef::new("other", TypeRef::named("Int"))),
            )
            .add_type(TypeDef::Enum(EnumDef::new("Color", ["RED"])))
            .build()
    }

    fn messages(query: &str) -> Vec<String> {
        let document = ferrogql_syntax::parse(query).unwrap();
        validate(&schema(), &document)
            .errors
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    #[test]
    fn test_valid_documents() {
        assert!(messages("{ hello }").is_empty());
        assert!(messages("query Q($id: ID!) { user(id: $id) { name ...F } } fragment F on User { color }").is_empty());
        assert!(messages("subscription { counter }").is_empty());
        assert!(messages("{ __typename hello @skip(if: true) }").is_empty());
    }

    #[test]
    fn test_unknown_field_and_argument() {
        assert_eq!(
            messages("{ nope user(id: 1, extra: 2) { name } }"),
            vec![
                "Cannot query field \"nope\" on type \"Query\".",
                "Unknown argument \"extra\" on field \"Query.user\".",
            ]
        );
    }

    #[test]
    fn test_leaf_and_composite_selections() {
        assert_eq!(
            messages("{ hello { x } user(id: 1) }"),
            vec![
                "Field \"hello\" must not have a selection since type \"String\" has no subfields.",
                "Field \"user\" of type \"User\" must have a selection of subfields. Did you mean \"user { ... }\"?",
            ]
        );
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(
            messages("query A { hello } query A { hello } { hello }"),
            vec![
                "There can be only one operation named \"A\".",
                "This anonymous operation must be the only defined operation.",
            ]
        );
    }

    #[test]
    fn test_missing_root_type() {
        assert_eq!(
            messages("mutation { hello }"),
            vec!["Schema is not configured to execute mutation operation."]
        );
    }

    #[test]
    fn test_subscription_single_root_field() {
        assert_eq!(
            messages("subscription S { counter other }"),
            vec!["Subscription \"S\" must select only one top level field."]
        );
        assert_eq!(
            messages("subscription { counter ...F } fragment F on Subscription { other }"),
            vec!["Anonymous Subscription must select only one top level field."]
        );
    }

    #[test]
    fn test_fragments() {
        assert_eq!(
            messages("{ ...Missing user(id: 1) { ... on Nope { name } ...Q } } fragment Q on Query { hello }"),
            vec![
                "Unknown fragment \"Missing\".",
                "Unknown type \"Nope\".",
                "Fragment \"Q\" cannot be spread here as objects of type \"User\" can never be of type \"Query\".",
            ]
        );
        assert_eq!(
            messages("{ hello } fragment S on String { length }"),
            vec!["Fragment \"S\" cannot condition on non composite type \"String\"."]
        );
    }

    #[test]
    fn test_fragment_cycles() {
        assert_eq!(
            messages("{ user(id: 1) { ...A } } fragment A on User { ...B } fragment B on User { ...A }"),
            vec!["Cannot spread fragment \"A\" within itself via B."]
        );
    }

    #[test]
    fn test_undefined_variables() {
        assert_eq!(
            messages("query Q { user(id: $id) { name } }"),
            vec!["Variable \"$id\" is not defined by operation \"Q\"."]
        );
        assert_eq!(
            messages("{ hello @include(if: $flag) }"),
            vec!["Variable \"$flag\" is not defined."]
        );
    }

    #[test]
    fn test_unknown_directive() {
        assert_eq!(
            messages("{ hello @deprecated }"),
            vec!["Unknown directive \"@deprecated\"."]
        );
    }

    fn fragment_chain(len: usize) -> String {
        let mut query = String::from("{ user(id: 1) { ...F0 } }");
        for n in 0..len {
            query.push_str(&format!(" fragment F{n} on User {{ ...F{} }}", n + 1));
        }
        query.push_str(&format!(" fragment F{len} on User {{ name }}"));
        query
    }

    #[test]
    fn test_fragment_chains_are_depth_limited() {
        assert!(messages(&fragment_chain(10)).is_empty());

        let errors = messages(&fragment_chain(5_000));
        assert_eq!(errors, vec!["Selections are nested deeper than 128 levels."]);
    }

    #[test]
    fn test_custom_max_depth() {
        let document = ferrogql_syntax::parse("{ user(id: 1) { ...F } } fragment F on User { name }").unwrap();
        assert!(validate_with_max_depth(&schema(), &document, 3).is_valid());

        let outcome = validate_with_max_depth(&schema(), &document, 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].locations, vec![ferrogql_core::Location::new(1, 1)]);
    }

    #[test]
    fn test_errors_carry_locations_and_code() {
        let document = ferrogql_syntax::parse("{\n  nope\n}").unwrap();
        let outcome = validate(&schema(), &document);

        assert!(!outcome.is_valid());
        let error = &outcome.errors[0];
        assert_eq!(error.locations, vec![ferrogql_core::Location::new(2, 3)]);
        assert_eq!(error.code(), Some("GRAPHQL_VALIDATION_FAILED"));
    }
}

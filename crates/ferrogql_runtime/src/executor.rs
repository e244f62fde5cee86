//! Operation execution.
//!
//! [`Executor::execute_once`] produces the single result of an operation.
//! [`Executor::execute_streaming`] runs a subscription, turning every source
//! event into one result on a [`ResultStream`].
//!
//! Query root fields resolve concurrently, mutation root fields one after
//! another. Results and errors always come back in selection order.

use crate::context::Context;
use crate::request::{Request, Response};
use crate::resolver::{EventStream, ResolverArgs, ResolverError, ResolverInfo};
use crate::schema::{FieldDef, ObjectDef, Schema, TypeDef, TypeRef};
use crate::stream::{ResultSender, ResultStream, DEFAULT_BUFFER};
use ferrogql_core::{ErrorCode, FormattedError, PathSegment, Span};
use ferrogql_syntax::{
    Directive, Document, Field, OperationDefinition, OperationType, Selection, SelectionSet,
    Value as AstValue, DEFAULT_MAX_DEPTH,
};
use futures::future::{join_all, BoxFuture};
use futures::StreamExt;
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Results buffered per subscription before the pump waits.
    pub buffer: usize,
    /// Deepest document nesting accepted by parsing and validation.
    pub max_depth: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_BUFFER,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Executes validated documents against a schema.
#[derive(Debug, Clone)]
pub struct Executor {
    schema: Arc<Schema>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self::with_config(schema, ExecutorConfig::default())
    }

    pub fn with_config(schema: Arc<Schema>, config: ExecutorConfig) -> Self {
        Self { schema, config }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes the selected operation once.
    ///
    /// A subscription yields the result of its first source event, or
    /// `{"data": null}` when the source ends without one.
    pub async fn execute_once(&self, document: &Document, request: &Request) -> Response {
        let operation = match Operation::prepare(&self.schema, document, request) {
            Ok(operation) => operation,
            Err(errors) => return Response::from_errors(errors),
        };

        match operation.definition.operation {
            OperationType::Subscription => operation.first_event().await,
            _ => operation.execute_root().await,
        }
    }

    /// Starts the selected operation and returns its result stream.
    ///
    /// The stream is governed by the request context's token. Operations
    /// other than subscriptions yield their single result and end.
    pub fn execute_streaming(&self, document: Arc<Document>, request: Request) -> ResultStream {
        let token = request.context.cancellation_token().clone();
        let (sender, stream) = ResultStream::channel(self.config.buffer, token);
        let schema = Arc::clone(&self.schema);

        tokio::spawn(async move {
            pump(&schema, &document, &request, sender).await;
        });

        stream
    }
}

async fn pump(schema: &Schema, document: &Document, request: &Request, sender: ResultSender) {
    let operation = match Operation::prepare(schema, document, request) {
        Ok(operation) => operation,
        Err(errors) => {
            sender.send(Response::from_errors(errors)).await;
            return;
        }
    };

    if operation.definition.operation != OperationType::Subscription {
        let response = operation.execute_root().await;
        sender.send(response).await;
        return;
    }

    let (root, mut source) = match operation.subscribe().await {
        Ok(subscribed) => subscribed,
        Err(response) => {
            sender.send(response).await;
            return;
        }
    };
    tracing::debug!(field = root.key, "subscription source started");

    loop {
        let event = tokio::select! {
            biased;
            () = sender.closed() => break,
            event = source.next() => event,
        };
        let Some(event) = event else { break };

        let response = match event {
            Ok(value) => operation.complete_event(&root, value).await,
            Err(error) => operation.event_error(&root, error),
        };
        if !sender.send(response).await {
            break;
        }
    }

    tracing::debug!(field = root.key, "subscription source ended");
}

/// The result of completing one field or value.
///
/// `value` is `None` when a null must propagate to the nearest nullable
/// parent.
#[derive(Debug, Default)]
struct Completed {
    value: Option<Value>,
    errors: Vec<FormattedError>,
}

impl Completed {
    fn value(value: Value) -> Self {
        Self {
            value: Some(value),
            errors: Vec::new(),
        }
    }

    fn null(error: FormattedError) -> Self {
        Self {
            value: Some(Value::Null),
            errors: vec![error],
        }
    }
}

/// The field whose value is being completed.
#[derive(Clone, Copy)]
struct Target<'a> {
    parent_type: &'a str,
    fields: &'a [&'a Field],
}

impl Target<'_> {
    fn field(&self) -> &Field {
        self.fields[0]
    }
}

/// The root field of a running subscription.
struct RootField<'a> {
    key: &'a str,
    fields: Vec<&'a Field>,
    def: &'a FieldDef,
    path: Vec<PathSegment>,
}

/// One operation ready to run.
struct Operation<'a> {
    schema: &'a Schema,
    document: &'a Document,
    definition: &'a OperationDefinition,
    root_type: &'a ObjectDef,
    variables: Arc<Map<String, Value>>,
    context: &'a Context,
    root_value: Value,
}

impl<'a> Operation<'a> {
    fn prepare(
        schema: &'a Schema,
        document: &'a Document,
        request: &'a Request,
    ) -> Result<Self, Vec<FormattedError>> {
        let Some(definition) = document.select_operation(request.operation_name.as_deref()) else {
            let message = match &request.operation_name {
                Some(name) => format!("Unknown operation named \"{name}\"."),
                None if document.operations().next().is_none() => {
                    "Must provide an operation.".to_string()
                }
                None => {
                    "Must provide operation name if query contains multiple operations."
                        .to_string()
                }
            };
            return Err(vec![FormattedError::new(message)]);
        };

        let Some(root_type) = schema.root_type(definition.operation) else {
            let error = FormattedError::new(format!(
                "Schema is not configured to execute {} operation.",
                definition.operation
            ))
            .with_location(document.location(definition.span));
            return Err(vec![error]);
        };

        let variables = coerce_variables(document, definition, &request.variables)?;

        Ok(Self {
            schema,
            document,
            definition,
            root_type,
            variables: Arc::new(variables),
            context: &request.context,
            root_value: Value::Object(request.root_value.clone()),
        })
    }

    async fn execute_root(&self) -> Response {
        let grouped = self.collect_fields(self.root_type, [&self.definition.selection_set]);
        let serial = self.definition.operation == OperationType::Mutation;
        let completed = self
            .execute_fields(self.root_type, &self.root_value, grouped, &[], serial)
            .await;

        Response {
            data: Some(completed.value.unwrap_or(Value::Null)),
            errors: completed.errors,
            extensions: None,
        }
    }

    /// Creates the source stream of the subscription's root field.
    async fn subscribe(&self) -> Result<(RootField<'a>, EventStream), Response> {
        let grouped = self.collect_fields(self.root_type, [&self.definition.selection_set]);
        let Some((key, fields)) = grouped.into_iter().next() else {
            return Err(Response::new(Value::Object(Map::new())));
        };
        let field = fields[0];
        let path = vec![PathSegment::from(key)];

        let Some(def) = self.root_type.fields.get(&field.name.value) else {
            let message = format!("The subscription field \"{}\" is not defined.", field.name.value);
            return Err(Response::from_errors(vec![self.error(message, field.span, path)]));
        };

        let Some(resolver) = self
            .schema
            .resolvers
            .get_subscription(&self.root_type.name, &field.name.value)
        else {
            let message = format!(
                "Subscription field \"{}.{}\" has no source stream resolver.",
                self.root_type.name, field.name.value
            );
            return Err(Response::from_errors(vec![self.error(message, field.span, path)]));
        };

        let args = match self.arguments(def, field) {
            Ok(args) => args,
            Err(message) => {
                return Err(Response::from_errors(vec![self.error(message, field.span, path)]))
            }
        };
        let info = self.info(self.root_type, def, &path);

        match resolver
            .subscribe(&self.root_value, &args, self.context, &info)
            .await
        {
            Ok(source) => Ok((
                RootField {
                    key,
                    fields,
                    def,
                    path,
                },
                source,
            )),
            Err(error) => Err(Response::from_errors(vec![
                self.resolver_error(error, field, path)
            ])),
        }
    }

    async fn first_event(&self) -> Response {
        let (root, mut source) = match self.subscribe().await {
            Ok(subscribed) => subscribed,
            Err(response) => return response,
        };
        let first = source.next().await;
        drop(source);

        match first {
            Some(Ok(value)) => self.complete_event(&root, value).await,
            Some(Err(error)) => self.event_error(&root, error),
            None => Response::new(Value::Null),
        }
    }

    /// Executes the subscription's selection with `event` as the root field value.
    async fn complete_event(&self, root: &RootField<'_>, event: Value) -> Response {
        let target = Target {
            parent_type: &self.root_type.name,
            fields: &root.fields,
        };
        let completed = self
            .complete_value(&root.def.ty, target, event, root.path.clone())
            .await;

        let data = match completed.value {
            Some(value) => {
                let mut map = Map::new();
                map.insert(root.key.to_string(), value);
                Value::Object(map)
            }
            None => Value::Null,
        };
        Response {
            data: Some(data),
            errors: completed.errors,
            extensions: None,
        }
    }

    fn event_error(&self, root: &RootField<'_>, error: ResolverError) -> Response {
        Response::new(Value::Null).with_errors([self.resolver_error(
            error,
            root.fields[0],
            root.path.clone(),
        )])
    }

    fn execute_fields<'b>(
        &'b self,
        object: &'b ObjectDef,
        parent: &'b Value,
        grouped: IndexMap<&'b str, Vec<&'b Field>>,
        path: &'b [PathSegment],
        serial: bool,
    ) -> BoxFuture<'b, Completed> {
        Box::pin(async move {
            let results = if serial {
                let mut results = Vec::with_capacity(grouped.len());
                for (key, fields) in &grouped {
                    results.push(self.execute_field(object, parent, key, fields, path).await);
                }
                results
            } else {
                join_all(
                    grouped
                        .iter()
                        .map(|(key, fields)| self.execute_field(object, parent, key, fields, path)),
                )
                .await
            };

            let mut map = Map::new();
            let mut errors = Vec::new();
            let mut propagate = false;
            for ((key, _), completed) in grouped.iter().zip(results) {
                errors.extend(completed.errors);
                match completed.value {
                    Some(value) => {
                        map.insert((*key).to_string(), value);
                    }
                    None => propagate = true,
                }
            }

            Completed {
                value: (!propagate).then_some(Value::Object(map)),
                errors,
            }
        })
    }

    fn execute_field<'b>(
        &'b self,
        object: &'b ObjectDef,
        parent: &'b Value,
        key: &'b str,
        fields: &'b [&'b Field],
        path: &'b [PathSegment],
    ) -> BoxFuture<'b, Completed> {
        Box::pin(async move {
            let field = fields[0];
            if field.name.value == "__typename" {
                return Completed::value(Value::String(object.name.clone()));
            }

            let mut field_path = path.to_vec();
            field_path.push(PathSegment::from(key));

            let Some(def) = object.fields.get(&field.name.value) else {
                let message = format!(
                    "Cannot query field \"{}\" on type \"{}\".",
                    field.name.value, object.name
                );
                return Completed::null(self.error(message, field.span, field_path));
            };
            let nullable = |error: FormattedError| Completed {
                value: (!def.ty.is_non_null()).then_some(Value::Null),
                errors: vec![error],
            };

            let args = match self.arguments(def, field) {
                Ok(args) => args,
                Err(message) => return nullable(self.error(message, field.span, field_path)),
            };
            let info = self.info(object, def, &field_path);
            let resolver = self.schema.resolvers.get(&object.name, &field.name.value);

            match resolver.resolve(parent, &args, self.context, &info).await {
                Ok(value) => {
                    let target = Target {
                        parent_type: &object.name,
                        fields,
                    };
                    self.complete_value(&def.ty, target, value, field_path).await
                }
                Err(error) => nullable(self.resolver_error(error, field, field_path)),
            }
        })
    }

    fn complete_value<'b>(
        &'b self,
        ty: &'b TypeRef,
        target: Target<'b>,
        value: Value,
        path: Vec<PathSegment>,
    ) -> BoxFuture<'b, Completed> {
        Box::pin(async move {
            if let TypeRef::NonNull(inner) = ty {
                let mut completed = self.complete_value(inner, target, value, path.clone()).await;
                if completed.value == Some(Value::Null) {
                    if completed.errors.is_empty() {
                        let message = format!(
                            "Cannot return null for non-nullable field {}.{}.",
                            target.parent_type,
                            target.field().name.value
                        );
                        completed
                            .errors
                            .push(self.error(message, target.field().span, path));
                    }
                    completed.value = None;
                }
                return completed;
            }

            let mut completed = self.complete_nullable(ty, target, value, path).await;
            if completed.value.is_none() {
                completed.value = Some(Value::Null);
            }
            completed
        })
    }

    async fn complete_nullable<'b>(
        &'b self,
        ty: &'b TypeRef,
        target: Target<'b>,
        value: Value,
        path: Vec<PathSegment>,
    ) -> Completed {
        if value.is_null() {
            return Completed::value(Value::Null);
        }

        match ty {
            TypeRef::NonNull(inner) => self.complete_value(inner, target, value, path).await,
            TypeRef::List(inner) => {
                let Value::Array(items) = value else {
                    let message = format!(
                        "Expected Iterable, but did not find one for field \"{}.{}\".",
                        target.parent_type,
                        target.field().name.value
                    );
                    return Completed::null(self.error(message, target.field().span, path));
                };

                let results = join_all(items.into_iter().enumerate().map(|(index, item)| {
                    let mut item_path = path.clone();
                    item_path.push(PathSegment::Index(index));
                    self.complete_value(inner, target, item, item_path)
                }))
                .await;

                let mut list = Vec::with_capacity(results.len());
                let mut errors = Vec::new();
                let mut propagate = false;
                for completed in results {
                    errors.extend(completed.errors);
                    match completed.value {
                        Some(value) => list.push(value),
                        None => propagate = true,
                    }
                }
                Completed {
                    value: (!propagate).then_some(Value::Array(list)),
                    errors,
                }
            }
            TypeRef::Named(name) => match self.schema.get_type(name) {
                Some(TypeDef::Object(object)) => {
                    let grouped = self.collect_fields(
                        object,
                        target.fields.iter().filter_map(|f| f.selection_set.as_ref()),
                    );
                    self.execute_fields(object, &value, grouped, &path, false)
                        .await
                }
                Some(TypeDef::Enum(def)) => {
                    let known = value
                        .as_str()
                        .is_some_and(|v| def.values.iter().any(|known| known == v));
                    if known {
                        Completed::value(value)
                    } else {
                        let message =
                            format!("Enum \"{}\" cannot represent value: {value}", def.name);
                        Completed::null(self.error(message, target.field().span, path))
                    }
                }
                Some(TypeDef::Scalar(_)) | None => match serialize_scalar(name, value) {
                    Ok(value) => Completed::value(value),
                    Err(message) => Completed::null(self.error(message, target.field().span, path)),
                },
            },
        }
    }

    /// Groups the fields of `sets` by response key for `object`.
    fn collect_fields<'b>(
        &self,
        object: &ObjectDef,
        sets: impl IntoIterator<Item = &'b SelectionSet>,
    ) -> IndexMap<&'b str, Vec<&'b Field>>
    where
        'a: 'b,
    {
        let mut grouped = IndexMap::new();
        let mut visited = FxHashSet::default();
        for set in sets {
            self.collect_into(object, set, &mut visited, &mut grouped);
        }
        grouped
    }

    fn collect_into<'b>(
        &self,
        object: &ObjectDef,
        set: &'b SelectionSet,
        visited: &mut FxHashSet<&'b str>,
        grouped: &mut IndexMap<&'b str, Vec<&'b Field>>,
    ) where
        'a: 'b,
    {
        for selection in &set.selections {
            if !self.should_include(selection.directives()) {
                continue;
            }
            match selection {
                Selection::Field(field) => {
                    grouped.entry(field.response_key()).or_default().push(field);
                }
                Selection::InlineFragment(inline) => {
                    let applies = inline
                        .type_condition
                        .as_ref()
                        .map_or(true, |condition| condition.value == object.name);
                    if applies {
                        self.collect_into(object, &inline.selection_set, visited, grouped);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    if !visited.insert(spread.name.value.as_str()) {
                        continue;
                    }
                    let Some(fragment) = self.document.fragment(&spread.name.value) else {
                        continue;
                    };
                    if fragment.type_condition.value == object.name {
                        self.collect_into(object, &fragment.selection_set, visited, grouped);
                    }
                }
            }
        }
    }

    fn should_include(&self, directives: &[Directive]) -> bool {
        let condition = |directive: &Directive| {
            directive
                .argument("if")
                .map(|value| value_from_ast(value, &self.variables))
                .and_then(|value| value.as_bool())
                .unwrap_or(false)
        };
        directives.iter().all(|directive| match directive.name.value.as_str() {
            "skip" => !condition(directive),
            "include" => condition(directive),
            _ => true,
        })
    }

    fn arguments(&self, def: &FieldDef, field: &Field) -> Result<ResolverArgs, String> {
        let mut args = ResolverArgs::new();
        for (name, arg_def) in &def.arguments {
            let value = match field.argument(name).map(|arg| &arg.value) {
                Some(AstValue::Variable(var)) if !self.variables.contains_key(&var.value) => {
                    arg_def.default_value.clone()
                }
                Some(value) => Some(value_from_ast(value, &self.variables)),
                None => arg_def.default_value.clone(),
            };

            match value {
                None if arg_def.ty.is_non_null() => {
                    return Err(format!(
                        "Argument \"{name}\" of required type \"{}\" was not provided.",
                        arg_def.ty
                    ));
                }
                Some(Value::Null) if arg_def.ty.is_non_null() => {
                    return Err(format!(
                        "Argument \"{name}\" of non-null type \"{}\" must not be null.",
                        arg_def.ty
                    ));
                }
                Some(value) => args.set(name.clone(), value),
                None => {}
            }
        }
        Ok(args)
    }

    fn info(&self, object: &ObjectDef, def: &FieldDef, path: &[PathSegment]) -> ResolverInfo {
        ResolverInfo::new(def.name.clone(), object.name.clone())
            .with_return_type(def.ty.to_string())
            .with_path(path.to_vec())
            .with_variables(Arc::clone(&self.variables))
    }

    fn error(&self, message: String, span: Span, path: Vec<PathSegment>) -> FormattedError {
        FormattedError::new(message)
            .with_location(self.document.location(span))
            .with_path(path)
            .with_code(ErrorCode::ExecutionError)
    }

    fn resolver_error(
        &self,
        error: ResolverError,
        field: &Field,
        path: Vec<PathSegment>,
    ) -> FormattedError {
        FormattedError::from_error(error)
            .with_location(self.document.location(field.span))
            .with_path(path)
            .with_code(ErrorCode::ExecutionError)
    }
}

fn coerce_variables(
    document: &Document,
    definition: &OperationDefinition,
    provided: &Map<String, Value>,
) -> Result<Map<String, Value>, Vec<FormattedError>> {
    let mut coerced = Map::new();
    let mut errors = Vec::new();

    for var in &definition.variables {
        let name = &var.name.value;
        match provided.get(name) {
            Some(Value::Null) if var.ty.is_non_null() => errors.push(
                FormattedError::new(format!(
                    "Variable \"${name}\" of non-null type \"{}\" must not be null.",
                    var.ty
                ))
                .with_location(document.location(var.span)),
            ),
            Some(value) => {
                coerced.insert(name.clone(), value.clone());
            }
            None => match &var.default_value {
                Some(default) => {
                    coerced.insert(name.clone(), value_from_ast(default, &Map::new()));
                }
                None if var.ty.is_non_null() => errors.push(
                    FormattedError::new(format!(
                        "Variable \"${name}\" of required type \"{}\" was not provided.",
                        var.ty
                    ))
                    .with_location(document.location(var.span)),
                ),
                None => {}
            },
        }
    }

    if errors.is_empty() {
        Ok(coerced)
    } else {
        Err(errors)
    }
}

/// Converts a literal into JSON, substituting variables.
fn value_from_ast(value: &AstValue, variables: &Map<String, Value>) -> Value {
    match value {
        AstValue::Variable(name) => variables.get(&name.value).cloned().unwrap_or(Value::Null),
        AstValue::Int(n, _) => Value::from(*n),
        AstValue::Float(f, _) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        AstValue::String(s, _) => Value::String(s.clone()),
        AstValue::Boolean(b, _) => Value::Bool(*b),
        AstValue::Null(_) => Value::Null,
        AstValue::Enum(name) => Value::String(name.value.clone()),
        AstValue::List(items, _) => Value::Array(
            items
                .iter()
                .map(|item| value_from_ast(item, variables))
                .collect(),
        ),
        AstValue::Object(fields, _) => Value::Object(
            fields
                .iter()
                .map(|(name, value)| (name.value.clone(), value_from_ast(value, variables)))
                .collect(),
        ),
    }
}

/// Serializes a resolved value as the named scalar.
///
/// Scalars without a built-in rule pass through unchanged.
fn serialize_scalar(name: &str, value: Value) -> Result<Value, String> {
    match name {
        "Int" => {
            let int = match &value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
                Value::Bool(b) => Some(i64::from(*b)),
                Value::String(s) => s.parse::<i64>().ok(),
                _ => None,
            };
            match int {
                Some(n) if i32::try_from(n).is_ok() => Ok(Value::from(n)),
                Some(_) => Err(format!(
                    "Int cannot represent non 32-bit signed integer value: {value}"
                )),
                None => Err(format!("Int cannot represent non-integer value: {value}")),
            }
        }
        "Float" => {
            let float = match &value {
                Value::Number(n) => n.as_f64(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                Value::String(s) => s.parse::<f64>().ok(),
                _ => None,
            };
            float
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("Float cannot represent non numeric value: {value}"))
        }
        "String" => match value {
            Value::String(_) => Ok(value),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(format!("String cannot represent value: {other}")),
        },
        "Boolean" => match value {
            Value::Bool(_) => Ok(value),
            Value::Number(ref n) if n.as_f64().is_some() => {
                Ok(Value::Bool(n.as_f64() != Some(0.0)))
            }
            other => Err(format!("Boolean cannot represent a non boolean value: {other}")),
        },
        "ID" => match value {
            Value::String(_) => Ok(value),
            Value::Number(ref n) if n.is_i64() || n.is_u64() => Ok(Value::String(n.to_string())),
            other => Err(format!("ID cannot represent value: {other}")),
        },
        _ => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EnumDef, InputValueDef, SchemaBuilder};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn schema() -> Schema {
        SchemaBuilder::new()
            .query_type("Query")
            .subscription_type("Subscription")
            .object(
                ObjectDef::new("Query")
                    .field(FieldDef::new("hello", TypeRef::named("String")))
                    .field(
                        FieldDef::new("greet", TypeRef::named_non_null("String")).argument(
                            InputValueDef::new("name", TypeRef::named("String"))
                                .default_value(json!("world")),
                        ),
                    )
                    .field(
                        FieldDef::new("user", TypeRef::named("User"))
                            .argument(InputValueDef::new("id", TypeRef::named_non_null("ID"))),
                    )
                    .field(FieldDef::new(
                        "users",
                        TypeRef::list(TypeRef::named_non_null("User")),
                    ))
                    .field(FieldDef::new("broken", TypeRef::named("String")))
                    .field(FieldDef::new("slow", TypeRef::named("Int")))
                    .field(FieldDef::new("fast", TypeRef::named("Int"))),
            )
            .object(
                ObjectDef::new("User")
                    .field(FieldDef::new("id", TypeRef::named_non_null("ID")))
                    .field(FieldDef::new("name", TypeRef::named_non_null("String")))
                    .field(FieldDef::new("color", TypeRef::named("Color"))),
            )
            .object(
                ObjectDef::new("Subscription")
                    .field(FieldDef::new("counter", TypeRef::named_non_null("Int")))
                    .field(FieldDef::new("failing", TypeRef::named("Int"))),
            )
            .add_type(TypeDef::Enum(EnumDef::new("Color", ["RED", "GREEN"])))
            .resolver_fn("Query", "hello", |_, _, _, _| Ok(json!("world")))
            .resolver_fn("Query", "greet", |_, args, _, _| {
                let name: String = args.require("name")?;
                Ok(json!(format!("hi {name}")))
            })
            .resolver_fn("Query", "user", |_, args, _, _| {
                let id = args.get("id").cloned().unwrap_or(Value::Null);
                Ok(json!({"id": id, "name": "Ada", "color": "BLUE"}))
            })
            .resolver_fn("Query", "users", |_, _, _, _| {
                Ok(json!([{"id": 1, "name": "Ada"}, {"id": 2, "name": null}]))
            })
            .resolver_fn("Query", "broken", |_, _, _, _| {
                Err(ResolverError::custom("boom"))
            })
            .resolver_async("Query", "slow", |_, _, _, _| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, ResolverError>(json!(1))
            })
            .resolver_async("Query", "fast", |_, _, _, _| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, ResolverError>(json!(2))
            })
            .subscription_fn("Subscription", "counter", |_, _, _, _| async {
                let events = futures::stream::iter((1..=3).map(|n| Ok(json!(n))));
                Ok::<EventStream, ResolverError>(events.boxed())
            })
            .subscription_fn("Subscription", "failing", |_, _, _, _| async {
                Err::<EventStream, _>(ResolverError::custom("no source"))
            })
            .build()
    }

    async fn run(query: &str) -> Response {
        run_request(Request::new(query)).await
    }

    async fn run_request(request: Request) -> Response {
        let document = ferrogql_syntax::parse(&request.query).unwrap();
        Executor::new(Arc::new(schema()))
            .execute_once(&document, &request)
            .await
    }

    #[tokio::test]
    async fn test_query_with_aliases_fragments_and_typename() {
        let response = run(
            r#"{
                hello
                again: hello
                __typename
                user(id: 7) { ...Named ... on User { id } }
            }
            fragment Named on User { name }"#,
        )
        .await;

        assert!(response.is_ok(), "{:?}", response.errors);
        assert_eq!(
            response.data,
            Some(json!({
                "hello": "world",
                "again": "world",
                "__typename": "Query",
                "user": {"name": "Ada", "id": "7"}
            }))
        );
    }

    #[tokio::test]
    async fn test_skip_and_include() {
        let mut vars = Map::new();
        vars.insert("yes".into(), json!(true));
        let request = Request::new(
            "query Q($yes: Boolean) { hello @skip(if: $yes) greet @include(if: $yes) }",
        )
        .variables(vars);

        let response = run_request(request).await;
        assert_eq!(response.data, Some(json!({"greet": "hi world"})));
    }

    #[tokio::test]
    async fn test_resolver_error_has_path_and_location() {
        let response = run("{ hello\n  broken }").await;

        assert_eq!(response.data, Some(json!({"hello": "world", "broken": null})));
        let error = &response.errors[0];
        assert_eq!(error.message, "boom");
        assert_eq!(error.path, vec![PathSegment::from("broken")]);
        assert_eq!(error.locations, vec![ferrogql_core::Location::new(2, 3)]);
        assert_eq!(error.code(), Some("EXECUTION_ERROR"));
        assert!(error.original_error().is_some());
    }

    #[tokio::test]
    async fn test_null_propagates_to_nearest_nullable_parent() {
        let response = run("{ users { id name } }").await;

        assert_eq!(response.data, Some(json!({"users": null})));
        assert_eq!(response.errors.len(), 1);
        assert_eq!(
            response.errors[0].message,
            "Cannot return null for non-nullable field User.name."
        );
        assert_eq!(
            response.errors[0].path,
            vec![
                PathSegment::from("users"),
                PathSegment::Index(1),
                PathSegment::from("name")
            ]
        );
    }

    #[tokio::test]
    async fn test_enum_values_are_checked() {
        let response = run("{ user(id: 1) { color } }").await;

        assert_eq!(response.data, Some(json!({"user": {"color": null}})));
        assert_eq!(
            response.errors[0].message,
            "Enum \"Color\" cannot represent value: \"BLUE\""
        );
    }

    #[tokio::test]
    async fn test_arguments_and_variables() {
        let response = run(r#"{ greet(name: "Ada") }"#).await;
        assert_eq!(response.data, Some(json!({"greet": "hi Ada"})));

        let response = run("query Q($id: ID!) { user(id: $id) { id } }").await;
        assert!(response.data.is_none());
        assert_eq!(
            response.errors[0].message,
            "Variable \"$id\" of required type \"ID!\" was not provided."
        );

        let response = run("{ user { id } }").await;
        assert_eq!(response.data, Some(json!({"user": null})));
        assert_eq!(
            response.errors[0].message,
            "Argument \"id\" of required type \"ID!\" was not provided."
        );
    }

    #[tokio::test]
    async fn test_operation_selection() {
        let response = run("query A { hello } query B { greet }").await;
        assert_eq!(
            response.errors[0].message,
            "Must provide operation name if query contains multiple operations."
        );

        let request = Request::new("query A { hello } query B { greet }").operation_name("B");
        assert_eq!(
            run_request(request).await.data,
            Some(json!({"greet": "hi world"}))
        );

        let request = Request::new("query A { hello }").operation_name("C");
        assert_eq!(
            run_request(request).await.errors[0].message,
            "Unknown operation named \"C\"."
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_fields_keep_selection_order() {
        let response = run("{ slow fast }").await;
        let data = response.data.unwrap();
        let keys: Vec<_> = data.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn test_mutation_fields_run_serially() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&log);
        let schema = SchemaBuilder::new()
            .query_type("Query")
            .mutation_type("Mutation")
            .object(ObjectDef::new("Query"))
            .object(ObjectDef::new("Mutation").field(
                FieldDef::new("push", TypeRef::named_non_null("Int"))
                    .argument(InputValueDef::new("n", TypeRef::named_non_null("Int"))),
            ))
            .resolver_async("Mutation", "push", move |_, args, _, _| {
                let log = Arc::clone(&recorded);
                async move {
                    let n: i64 = args.require("n")?;
                    // Later fields finish sooner if run concurrently.
                    tokio::time::sleep(Duration::from_millis(30 - 10 * n as u64)).await;
                    log.lock().unwrap().push(n);
                    Ok::<_, ResolverError>(json!(n))
                }
            })
            .build();

        let request = Request::new("mutation { a: push(n: 0) b: push(n: 1) c: push(n: 2) }");
        let document = ferrogql_syntax::parse(&request.query).unwrap();
        let response = Executor::new(Arc::new(schema))
            .execute_once(&document, &request)
            .await;

        assert_eq!(response.data, Some(json!({"a": 0, "b": 1, "c": 2})));
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_subscription_once_uses_first_event() {
        let response = run("subscription { counter }").await;
        assert_eq!(response.data, Some(json!({"counter": 1})));

        let response = run("subscription { failing }").await;
        assert!(response.data.is_none());
        assert_eq!(response.errors[0].message, "no source");
    }

    #[tokio::test]
    async fn test_streaming_yields_one_result_per_event() {
        let request = Request::new("subscription { n: counter }");
        let document = Arc::new(ferrogql_syntax::parse(&request.query).unwrap());
        let stream = Executor::new(Arc::new(schema())).execute_streaming(document, request);

        let results: Vec<_> = stream.map(|r| r.data.unwrap()).collect().await;
        assert_eq!(
            results,
            vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]
        );
    }

    #[tokio::test]
    async fn test_streaming_source_errors_keep_going() {
        let schema = SchemaBuilder::new()
            .query_type("Query")
            .subscription_type("Subscription")
            .object(ObjectDef::new("Query"))
            .object(
                ObjectDef::new("Subscription")
                    .field(FieldDef::new("ticks", TypeRef::named("Int"))),
            )
            .subscription_fn("Subscription", "ticks", |_, _, _, _| async {
                let events = futures::stream::iter(vec![
                    Ok(json!(1)),
                    Err(ResolverError::custom("hiccup")),
                    Ok(json!(2)),
                ]);
                Ok::<EventStream, ResolverError>(events.boxed())
            })
            .build();

        let request = Request::new("subscription { ticks }");
        let document = Arc::new(ferrogql_syntax::parse(&request.query).unwrap());
        let results: Vec<_> = Executor::new(Arc::new(schema))
            .execute_streaming(document, request)
            .collect()
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].data, Some(json!({"ticks": 1})));
        assert_eq!(results[1].data, Some(Value::Null));
        assert_eq!(results[1].errors[0].message, "hiccup");
        assert_eq!(results[2].data, Some(json!({"ticks": 2})));
    }

    #[tokio::test]
    async fn test_streaming_stops_when_cancelled() {
        let schema = SchemaBuilder::new()
            .query_type("Query")
            .subscription_type("Subscription")
            .object(ObjectDef::new("Query"))
            .object(
                ObjectDef::new("Subscription")
                    .field(FieldDef::new("forever", TypeRef::named("Int"))),
            )
            .subscription_fn("Subscription", "forever", |_, _, _, _| async {
                let events = futures::stream::repeat_with(|| Ok(json!(1)));
                Ok::<EventStream, ResolverError>(events.boxed())
            })
            .build();

        let context = Context::new();
        let request = Request::new("subscription { forever }").context(context.clone());
        let document = Arc::new(ferrogql_syntax::parse(&request.query).unwrap());
        let mut stream = Executor::new(Arc::new(schema)).execute_streaming(document, request);

        assert!(stream.next().await.is_some());
        context.cancel();
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_serialize_scalar() {
        assert_eq!(serialize_scalar("Int", json!(3.0)), Ok(json!(3)));
        assert_eq!(
            serialize_scalar("Int", json!(1.5)),
            Err("Int cannot represent non-integer value: 1.5".to_string())
        );
        assert_eq!(
            serialize_scalar("Int", json!(4_000_000_000_i64)),
            Err("Int cannot represent non 32-bit signed integer value: 4000000000".to_string())
        );
        assert_eq!(serialize_scalar("ID", json!(42)), Ok(json!("42")));
        assert_eq!(serialize_scalar("String", json!(true)), Ok(json!("true")));
        assert_eq!(serialize_scalar("Boolean", json!(0)), Ok(json!(false)));
        assert_eq!(serialize_scalar("DateTime", json!({"a": 1})), Ok(json!({"a": 1})));
    }
}

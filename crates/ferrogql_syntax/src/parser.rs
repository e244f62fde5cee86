//! Recursive descent parser for executable GraphQL documents.
//!
//! Parsing stops at the first syntax error.

use crate::ast::*;
use crate::lexer::{block_string_value, string_value, Lexer};
use crate::token::{Token, TokenKind};
use ferrogql_core::{ErrorCode, FormattedError, LineIndex, Location, Span};

/// A syntax error with its position in the source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Syntax Error: {message}")]
pub struct SyntaxError {
    pub message: String,
    pub span: Span,
    pub location: Location,
}

impl From<SyntaxError> for FormattedError {
    fn from(err: SyntaxError) -> Self {
        FormattedError::new(err.to_string())
            .with_location(err.location)
            .with_code(ErrorCode::GraphqlParseFailed)
            .with_source(err)
    }
}

type PResult<T> = Result<T, SyntaxError>;

/// Deepest nesting of selection sets, list and object values, and list
/// types a document may have.
pub const DEFAULT_MAX_DEPTH: usize = 128;

/// Parses a source string into a document.
pub fn parse(source: &str) -> Result<Document, SyntaxError> {
    Parser::new(source).parse_document()
}

/// Parser for executable documents.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    source: &'a str,
    current: Token,
    /// End offset of the last consumed token.
    prev_end: u32,
    depth: usize,
    max_depth: usize,
}

impl<'a> Parser<'a> {
    /// Creates a new parser.
    pub fn new(source: &'a str) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer.next_token();
        Self {
            lexer,
            source,
            current,
            prev_end: 0,
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Sets the nesting limit; deeper documents are rejected.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Enters one nesting level. Callers pair it with [`Parser::ascend`]
    /// on success; an error aborts the whole parse.
    fn descend(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(self.error_at(
                self.current.span,
                format!("Document nesting exceeds {} levels.", self.max_depth),
            ));
        }
        Ok(())
    }

    fn ascend(&mut self) {
        self.depth -= 1;
    }

    #[inline]
    fn at(&self) -> TokenKind {
        self.current.kind
    }

    #[inline]
    fn at_kind(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn advance(&mut self) {
        self.prev_end = self.current.span.end;
        self.current = self.lexer.next_token();
    }

    /// Consumes the current token if it has the given kind.
    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at_kind(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> PResult<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error_expected(&kind.to_string()))
        }
    }

    fn current_text(&self) -> &'a str {
        self.lexer.span_text(self.current.span)
    }

    fn span_from(&self, start: u32) -> Span {
        Span::new(start, self.prev_end)
    }

    fn error_at(&self, span: Span, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            message: message.into(),
            span,
            location: LineIndex::new(self.source).span_start(span),
        }
    }

    fn error_expected(&self, expected: &str) -> SyntaxError {
        if self.at_kind(TokenKind::Error) {
            return self.error_lexical();
        }
        self.error_at(
            self.current.span,
            format!("Expected {expected}, found {}.", self.describe_current()),
        )
    }

    fn error_unexpected(&self) -> SyntaxError {
        if self.at_kind(TokenKind::Error) {
            return self.error_lexical();
        }
        self.error_at(
            self.current.span,
            format!("Unexpected {}.", self.describe_current()),
        )
    }

    fn error_lexical(&self) -> SyntaxError {
        let text = self.current_text();
        let message = if text.starts_with('"') {
            "Unterminated string.".to_string()
        } else if text.starts_with(['-', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9']) {
            format!("Invalid number: \"{text}\".")
        } else {
            format!("Unexpected character: \"{text}\".")
        };
        self.error_at(self.current.span, message)
    }

    fn describe_current(&self) -> String {
        match self.at() {
            TokenKind::Ident => format!("Name \"{}\"", self.current_text()),
            TokenKind::IntLiteral | TokenKind::FloatLiteral | TokenKind::StringLiteral => {
                format!("{} {}", self.at(), self.current_text())
            }
            kind => kind.to_string(),
        }
    }

    /// Parses a document.
    pub fn parse_document(&mut self) -> PResult<Document> {
        let start = self.current.span.start;
        let mut definitions = Vec::new();

        loop {
            definitions.push(self.parse_definition()?);
            if self.at_kind(TokenKind::Eof) {
                break;
            }
        }

        Ok(Document {
            definitions,
            span: self.span_from(start),
            line_index: LineIndex::new(self.source),
        })
    }

    fn parse_definition(&mut self) -> PResult<Definition> {
        match self.at() {
            TokenKind::LBrace => {
                let start = self.current.span.start;
                let selection_set = self.parse_selection_set()?;
                Ok(Definition::Operation(OperationDefinition {
                    operation: OperationType::Query,
                    name: None,
                    variables: Vec::new(),
                    directives: Vec::new(),
                    selection_set,
                    span: self.span_from(start),
                }))
            }
            TokenKind::Query | TokenKind::Mutation | TokenKind::Subscription => {
                self.parse_operation_definition().map(Definition::Operation)
            }
            TokenKind::Fragment => self.parse_fragment_definition().map(Definition::Fragment),
            _ => Err(self.error_unexpected()),
        }
    }

    fn parse_operation_definition(&mut self) -> PResult<OperationDefinition> {
        let start = self.current.span.start;
        let operation = match self.at() {
            TokenKind::Mutation => OperationType::Mutation,
            TokenKind::Subscription => OperationType::Subscription,
            _ => OperationType::Query,
        };
        self.advance();

        let name = if self.at().is_name() {
            Some(self.parse_name()?)
        } else {
            None
        };
        let variables = self.parse_variable_definitions()?;
        let directives = self.parse_directives(false)?;
        let selection_set = self.parse_selection_set()?;

        Ok(OperationDefinition {
            operation,
            name,
            variables,
            directives,
            selection_set,
            span: self.span_from(start),
        })
    }

    fn parse_variable_definitions(&mut self) -> PResult<Vec<VariableDefinition>> {
        let mut variables = Vec::new();
        if !self.eat(TokenKind::LParen) {
            return Ok(variables);
        }

        loop {
            let start = self.current.span.start;
            self.expect(TokenKind::Dollar)?;
            let name = self.parse_name()?;
            self.expect(TokenKind::Colon)?;
            let ty = self.parse_type()?;
            let default_value = if self.eat(TokenKind::Eq) {
                Some(self.parse_value(true)?)
            } else {
                None
            };
            let directives = self.parse_directives(true)?;
            variables.push(VariableDefinition {
                name,
                ty,
                default_value,
                directives,
                span: self.span_from(start),
            });

            if self.eat(TokenKind::RParen) {
                return Ok(variables);
            }
        }
    }

    fn parse_type(&mut self) -> PResult<Type> {
        let start = self.current.span.start;
        let ty = if self.at_kind(TokenKind::LBracket) {
            self.descend()?;
            self.advance();
            let inner = self.parse_type()?;
            self.expect(TokenKind::RBracket)?;
            self.ascend();
            Type::List(Box::new(inner), self.span_from(start))
        } else {
            Type::Named(self.parse_name()?)
        };

        if self.eat(TokenKind::Bang) {
            Ok(Type::NonNull(Box::new(ty), self.span_from(start)))
        } else {
            Ok(ty)
        }
    }

    fn parse_fragment_definition(&mut self) -> PResult<FragmentDefinition> {
        let start = self.current.span.start;
        self.expect(TokenKind::Fragment)?;

        if self.at_kind(TokenKind::On) {
            return Err(self.error_unexpected());
        }
        let name = self.parse_name()?;
        self.expect(TokenKind::On)?;
        let type_condition = self.parse_name()?;
        let directives = self.parse_directives(false)?;
        let selection_set = self.parse_selection_set()?;

        Ok(FragmentDefinition {
            name,
            type_condition,
            directives,
            selection_set,
            span: self.span_from(start),
        })
    }

    fn parse_selection_set(&mut self) -> PResult<SelectionSet> {
        let start = self.current.span.start;
        if self.at_kind(TokenKind::LBrace) {
            self.descend()?;
        }
        self.expect(TokenKind::LBrace)?;

        let mut selections = Vec::new();
        loop {
            selections.push(self.parse_selection()?);
            if self.eat(TokenKind::RBrace) {
                break;
            }
        }
        self.ascend();

        Ok(SelectionSet {
            selections,
            span: self.span_from(start),
        })
    }

    fn parse_selection(&mut self) -> PResult<Selection> {
        if !self.at_kind(TokenKind::Spread) {
            return self.parse_field().map(Selection::Field);
        }

        let start = self.current.span.start;
        self.advance();

        if self.at().is_name() && !self.at_kind(TokenKind::On) {
            let name = self.parse_name()?;
            let directives = self.parse_directives(false)?;
            return Ok(Selection::FragmentSpread(FragmentSpread {
                name,
                directives,
                span: self.span_from(start),
            }));
        }

        let type_condition = if self.eat(TokenKind::On) {
            Some(self.parse_name()?)
        } else {
            None
        };
        let directives = self.parse_directives(false)?;
        let selection_set = self.parse_selection_set()?;
        Ok(Selection::InlineFragment(InlineFragment {
            type_condition,
            directives,
            selection_set,
            span: self.span_from(start),
        }))
    }

    fn parse_field(&mut self) -> PResult<Field> {
        let start = self.current.span.start;

        let first_name = self.parse_name()?;
        let (alias, name) = if self.eat(TokenKind::Colon) {
            (Some(first_name), self.parse_name()?)
        } else {
            (None, first_name)
        };

        let arguments = self.parse_arguments(false)?;
        let directives = self.parse_directives(false)?;
        let selection_set = if self.at_kind(TokenKind::LBrace) {
            Some(self.parse_selection_set()?)
        } else {
            None
        };

        Ok(Field {
            alias,
            name,
            arguments,
            directives,
            selection_set,
            span: self.span_from(start),
        })
    }

    fn parse_arguments(&mut self, is_const: bool) -> PResult<Vec<Argument>> {
        let mut arguments = Vec::new();
        if !self.eat(TokenKind::LParen) {
            return Ok(arguments);
        }

        loop {
            let start = self.current.span.start;
            let name = self.parse_name()?;
            self.expect(TokenKind::Colon)?;
            let value = self.parse_value(is_const)?;
            arguments.push(Argument {
                name,
                value,
                span: self.span_from(start),
            });

            if self.eat(TokenKind::RParen) {
                return Ok(arguments);
            }
        }
    }

    fn parse_directives(&mut self, is_const: bool) -> PResult<Vec<Directive>> {
        let mut directives = Vec::new();
        while self.at_kind(TokenKind::At) {
            let start = self.current.span.start;
            self.advance();
            let name = self.parse_name()?;
            let arguments = self.parse_arguments(is_const)?;
            directives.push(Directive {
                name,
                arguments,
                span: self.span_from(start),
            });
        }
        Ok(directives)
    }

    fn parse_value(&mut self, is_const: bool) -> PResult<Value> {
        let start = self.current.span.start;

        let value = match self.at() {
            TokenKind::Dollar if !is_const => {
                self.advance();
                Value::Variable(self.parse_name()?)
            }
            TokenKind::IntLiteral => {
                let text = self.current_text();
                let value = text.parse::<i64>().map_err(|_| {
                    self.error_at(
                        self.current.span,
                        format!("Int cannot represent value: {text}."),
                    )
                })?;
                self.advance();
                Value::Int(value, self.span_from(start))
            }
            TokenKind::FloatLiteral => {
                let text = self.current_text();
                let value = text.parse::<f64>().map_err(|_| {
                    self.error_at(self.current.span, format!("Invalid number: \"{text}\"."))
                })?;
                self.advance();
                Value::Float(value, self.span_from(start))
            }
            TokenKind::StringLiteral => {
                let value = string_value(self.current_text())
                    .map_err(|message| self.error_at(self.current.span, message))?;
                self.advance();
                Value::String(value, self.span_from(start))
            }
            TokenKind::BlockStringLiteral => {
                let value = block_string_value(self.current_text());
                self.advance();
                Value::String(value, self.span_from(start))
            }
            TokenKind::True | TokenKind::False => {
                let value = self.at_kind(TokenKind::True);
                self.advance();
                Value::Boolean(value, self.span_from(start))
            }
            TokenKind::Null => {
                self.advance();
                Value::Null(self.span_from(start))
            }
            TokenKind::LBracket => {
                self.descend()?;
                self.advance();
                let mut items = Vec::new();
                while !self.eat(TokenKind::RBracket) {
                    items.push(self.parse_value(is_const)?);
                }
                self.ascend();
                Value::List(items, self.span_from(start))
            }
            TokenKind::LBrace => {
                self.descend()?;
                self.advance();
                let mut fields = Vec::new();
                while !self.eat(TokenKind::RBrace) {
                    let name = self.parse_name()?;
                    self.expect(TokenKind::Colon)?;
                    fields.push((name, self.parse_value(is_const)?));
                }
                self.ascend();
                Value::Object(fields, self.span_from(start))
            }
            kind if kind.is_name() => Value::Enum(self.parse_name()?),
            _ => return Err(self.error_unexpected()),
        };

        Ok(value)
    }

    fn parse_name(&mut self) -> PResult<Name> {
        if !self.at().is_name() {
            return Err(self.error_expected("Name"));
        }
        let name = Name::new(self.current_text(), self.current.span);
        self.advance();
        Ok(name)
    }
}

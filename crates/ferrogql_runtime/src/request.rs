//! Request parameters and results.

use crate::context::Context;
use ferrogql_core::FormattedError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The parameters of one GraphQL request.
///
/// Built with the consuming setters, then moved into exactly one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub query: String,
    pub variables: Map<String, Value>,
    pub operation_name: Option<String>,
    pub root_value: Map<String, Value>,
    pub context: Context,
}

impl Request {
    /// Creates a request for the given query text.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    #[must_use]
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn root_value(mut self, root_value: Map<String, Value>) -> Self {
        self.root_value = root_value;
        self
    }

    #[must_use]
    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
}

/// One result of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FormattedError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl Response {
    /// Creates a successful response.
    pub fn new(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// Creates a response that carries only errors and no `data` entry.
    pub fn from_errors(errors: Vec<FormattedError>) -> Self {
        Self {
            errors,
            ..Self::default()
        }
    }

    /// Appends errors to this response.
    #[must_use]
    pub fn with_errors(mut self, errors: impl IntoIterator<Item = FormattedError>) -> Self {
        self.errors.extend(errors);
        self
    }

    /// Adds an extension entry.
    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Returns true if the response carries no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Converts the response into its JSON form.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

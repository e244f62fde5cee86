//! The GraphQL error shape carried by every result.

use crate::span::Location;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Error codes placed under `extensions.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    /// The query text could not be parsed.
    GraphqlParseFailed,
    /// The document failed validation against the schema.
    GraphqlValidationFailed,
    /// An extension hook rejected the request.
    ExtensionError,
    /// A resolver or source stream failed.
    ExecutionError,
    /// A failure inside the engine itself.
    InternalError,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::GraphqlParseFailed => "GRAPHQL_PARSE_FAILED",
            Self::GraphqlValidationFailed => "GRAPHQL_VALIDATION_FAILED",
            Self::ExtensionError => "EXTENSION_ERROR",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Returns true if the error was caused by the request rather than the server.
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::GraphqlParseFailed | Self::GraphqlValidationFailed)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(s: &str) -> Self {
        Self::Field(s.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(s: String) -> Self {
        Self::Field(s)
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        Self::Index(i)
    }
}

/// A GraphQL error as it appears in a response's `errors` list.
///
/// The original error, if any, travels along in-process but is never
/// serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattedError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<PathSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
    #[serde(skip)]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl FormattedError {
    /// Creates an error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: Vec::new(),
            extensions: None,
            source: None,
        }
    }

    /// Creates an error from another error, keeping it as the original error.
    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(error.to_string()).with_source(error)
    }

    /// Adds a location.
    pub fn with_location(mut self, location: Location) -> Self {
        self.locations.push(location);
        self
    }

    /// Sets the response path.
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = path;
        self
    }

    /// Adds an extension entry.
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Sets `extensions.code`.
    pub fn with_code(self, code: ErrorCode) -> Self {
        self.with_extension("code", Value::String(code.as_str().to_string()))
    }

    /// Attaches the original error.
    pub fn with_source<E>(mut self, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(error));
        self
    }

    /// Returns the `extensions.code` value, if set.
    pub fn code(&self) -> Option<&str> {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .and_then(Value::as_str)
    }

    /// Returns the original error this one was built from.
    pub fn original_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

impl PartialEq for FormattedError {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
            && self.locations == other.locations
            && self.path == other.path
            && self.extensions == other.extensions
    }
}

impl fmt::Display for FormattedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(location) = self.locations.first() {
            write!(f, " ({location})")?;
        }
        Ok(())
    }
}

impl std::error::Error for FormattedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_omits_empty_fields() {
        let err = FormattedError::new("boom");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!({"message": "boom"})
        );
    }

    #[test]
    fn test_serialization_full_shape() {
        let err = FormattedError::new("bad field")
            .with_location(Location::new(1, 3))
            .with_path(vec!["user".into(), 0.into(), "name".into()])
            .with_code(ErrorCode::ExecutionError);

        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!({
                "message": "bad field",
                "locations": [{"line": 1, "column": 3}],
                "path": ["user", 0, "name"],
                "extensions": {"code": "EXECUTION_ERROR"}
            })
        );
        assert_eq!(err.code(), Some("EXECUTION_ERROR"));
    }

    #[test]
    fn test_original_error_is_kept() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = FormattedError::from_error(io);

        assert_eq!(err.message, "disk on fire");
        let original = err.original_error().unwrap();
        assert!(original.downcast_ref::<std::io::Error>().is_some());
    }

    #[test]
    fn test_error_code_properties() {
        assert!(ErrorCode::GraphqlParseFailed.is_client_error());
        assert!(!ErrorCode::InternalError.is_client_error());
        assert_eq!(ErrorCode::ExtensionError.to_string(), "EXTENSION_ERROR");
    }
}

//! Server error types.

use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors returned from the public server API.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Accepting a connection failed.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),
}

impl ServerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// A bad inbound frame. Reported to the peer; the connection stays open.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("{0}")]
    Malformed(String),

    #[error("unknown message type \"{kind}\"")]
    UnknownType { id: Option<Value>, kind: String },

    #[error("\"{0}\" message requires an id")]
    MissingId(String),

    #[error("{message}")]
    InvalidPayload { id: Value, message: String },

    #[error("binary messages are not supported")]
    Binary,
}

impl ProtocolError {
    /// The id of the frame the error belongs to, when it could be read.
    pub fn id(&self) -> Option<&Value> {
        match self {
            Self::UnknownType { id, .. } => id.as_ref(),
            Self::InvalidPayload { id, .. } => Some(id),
            Self::Malformed(_) | Self::MissingId(_) | Self::Binary => None,
        }
    }
}

/// A socket failure. Ends the connection; never sent to the peer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("read failed: {0}")]
    Read(#[source] tungstenite::Error),

    #[error("write failed: {0}")]
    Write(#[source] tungstenite::Error),

    #[error("no liveness probe within {0:?}")]
    ReadTimeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TransportError {
    /// Returns true for failures that mean the peer simply went away.
    pub fn is_benign(&self) -> bool {
        match self {
            Self::Read(error) | Self::Write(error) => match error {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
                tungstenite::Error::Protocol(
                    tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
                ) => true,
                tungstenite::Error::Io(io) => matches!(
                    io.kind(),
                    std::io::ErrorKind::UnexpectedEof
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::BrokenPipe
                ),
                _ => false,
            },
            Self::ReadTimeout(_) | Self::WriteTimeout(_) | Self::Encode(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protocol_error_ids() {
        let err = ProtocolError::InvalidPayload {
            id: json!("1"),
            message: "missing field `query`".into(),
        };
        assert_eq!(err.id(), Some(&json!("1")));
        assert_eq!(err.to_string(), "missing field `query`");

        let err = ProtocolError::UnknownType {
            id: None,
            kind: "bogus".into(),
        };
        assert!(err.id().is_none());
        assert_eq!(err.to_string(), "unknown message type \"bogus\"");
    }

    #[test]
    fn test_benign_transport_errors() {
        assert!(TransportError::Read(tungstenite::Error::ConnectionClosed).is_benign());
        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert!(TransportError::Read(tungstenite::Error::Io(eof)).is_benign());
        assert!(!TransportError::ReadTimeout(Duration::from_secs(1)).is_benign());
    }
}

//! Websocket frame format.
//!
//! Every frame is one JSON object `{ "id", "type", "payload" }`. Both the
//! `graphql-ws` spelling (`start`/`data`/`stop`) and the
//! `graphql-transport-ws` spelling (`subscribe`/`next`/`complete`) are
//! understood; a result frame mirrors the spelling its request used.

use crate::error::ProtocolError;
use ferrogql_runtime::{Request, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const CONNECTION_INIT: &str = "connection_init";
pub const CONNECTION_ACK: &str = "connection_ack";
pub const SUBSCRIBE: &str = "subscribe";
pub const START: &str = "start";
pub const STOP: &str = "stop";
pub const COMPLETE: &str = "complete";
pub const NEXT: &str = "next";
pub const DATA: &str = "data";
pub const ERROR: &str = "error";

/// One websocket message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Frame {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            payload: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: Value) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn ack() -> Self {
        Self::new(CONNECTION_ACK)
    }

    /// An error frame carrying `message`, tagged with the offending id when known.
    pub fn error(id: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            id,
            kind: ERROR.to_string(),
            payload: Some(Value::String(message.into())),
        }
    }

    pub fn protocol_error(error: &ProtocolError) -> Self {
        Self::error(error.id().cloned(), error.to_string())
    }

    /// A result frame for session `id`.
    pub fn result(id: Value, reply: ReplyKind, response: &Response) -> Self {
        Self {
            id: Some(id),
            kind: reply.as_str().to_string(),
            payload: Some(response.to_json()),
        }
    }
}

/// The frame type results are sent under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// `subscribe` requests get `next` frames.
    Next,
    /// `start` requests get `data` frames.
    Data,
}

impl ReplyKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Next => NEXT,
            Self::Data => DATA,
        }
    }
}

/// The payload of a `subscribe`/`start` frame.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub query: String,
    #[serde(default, deserialize_with = "nullable_map")]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub operation_name: Option<String>,
    #[serde(default, deserialize_with = "nullable_map")]
    pub extensions: Map<String, Value>,
}

fn nullable_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl SubscribePayload {
    /// Builds the pipeline request; the context is attached by the caller.
    pub fn into_request(self) -> Request {
        let mut request = Request::new(self.query).variables(self.variables);
        if let Some(name) = self.operation_name {
            request = request.operation_name(name);
        }
        request
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Headers are the string-valued entries of the init payload.
    ConnectionInit { headers: BTreeMap<String, String> },
    Subscribe {
        id: Value,
        reply: ReplyKind,
        payload: SubscribePayload,
    },
    /// `stop` or `complete`.
    Stop { id: Value },
}

/// Decodes one text frame.
pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
    let frame: Frame =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    match frame.kind.as_str() {
        CONNECTION_INIT => {
            let headers = match frame.payload {
                Some(Value::Object(map)) => map
                    .into_iter()
                    .filter_map(|(key, value)| match value {
                        Value::String(s) => Some((key, s)),
                        _ => None,
                    })
                    .collect(),
                _ => BTreeMap::new(),
            };
            Ok(Inbound::ConnectionInit { headers })
        }
        SUBSCRIBE | START => {
            let reply = if frame.kind == SUBSCRIBE {
                ReplyKind::Next
            } else {
                ReplyKind::Data
            };
            let id = frame.id.ok_or(ProtocolError::MissingId(frame.kind))?;
            let payload = frame.payload.unwrap_or(Value::Null);
            let payload = serde_json::from_value(payload).map_err(|e| {
                ProtocolError::InvalidPayload {
                    id: id.clone(),
                    message: e.to_string(),
                }
            })?;
            Ok(Inbound::Subscribe { id, reply, payload })
        }
        STOP | COMPLETE => {
            let id = frame.id.ok_or(ProtocolError::MissingId(frame.kind))?;
            Ok(Inbound::Stop { id })
        }
        _ => Err(ProtocolError::UnknownType {
            id: frame.id,
            kind: frame.kind,
        }),
    }
}

/// The registry key for a frame id.
pub fn session_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_connection_init() {
        let inbound =
            decode(r#"{"type":"connection_init","payload":{"authorization":"t","retries":3}}"#)
                .unwrap();
        let Inbound::ConnectionInit { headers } = inbound else {
            panic!("expected connection_init");
        };
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["authorization"], "t");

        assert_eq!(
            decode(r#"{"type":"connection_init"}"#).unwrap(),
            Inbound::ConnectionInit {
                headers: BTreeMap::new()
            }
        );
    }

    #[test]
    fn test_decode_subscribe_spellings() {
        let inbound = decode(
            r#"{"id":"1","type":"start","payload":{"query":"{ hello }","variables":null}}"#,
        )
        .unwrap();
        let Inbound::Subscribe { id, reply, payload } = inbound else {
            panic!("expected subscribe");
        };
        assert_eq!(id, json!("1"));
        assert_eq!(reply, ReplyKind::Data);
        assert_eq!(payload.query, "{ hello }");
        assert!(payload.variables.is_empty());

        let inbound = decode(
            r#"{"id":7,"type":"subscribe","payload":{"query":"query Q { a }","operationName":"Q"}}"#,
        )
        .unwrap();
        let Inbound::Subscribe { id, reply, payload } = inbound else {
            panic!("expected subscribe");
        };
        assert_eq!(session_key(&id), "7");
        assert_eq!(reply, ReplyKind::Next);
        assert_eq!(payload.operation_name.as_deref(), Some("Q"));
    }

    #[test]
    fn test_decode_stop_and_complete() {
        assert_eq!(
            decode(r#"{"id":"2","type":"stop"}"#).unwrap(),
            Inbound::Stop { id: json!("2") }
        );
        assert_eq!(
            decode(r#"{"id":"2","type":"complete"}"#).unwrap(),
            Inbound::Stop { id: json!("2") }
        );
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode("{not json"), Err(ProtocolError::Malformed(_))));
        assert_eq!(
            decode(r#"{"type":"start","payload":{"query":"{ a }"}}"#),
            Err(ProtocolError::MissingId("start".into()))
        );
        assert!(matches!(
            decode(r#"{"id":"3","type":"start","payload":{"variables":{}}}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
        assert_eq!(
            decode(r#"{"id":"4","type":"bogus"}"#),
            Err(ProtocolError::UnknownType {
                id: Some(json!("4")),
                kind: "bogus".into()
            })
        );
    }

    #[test]
    fn test_frame_encoding() {
        assert_eq!(
            serde_json::to_string(&Frame::ack()).unwrap(),
            r#"{"type":"connection_ack"}"#
        );

        let response = Response::new(json!({"hello": "world"}));
        let frame = Frame::result(json!("1"), ReplyKind::Data, &response);
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"id":"1","type":"data","payload":{"data":{"hello":"world"}}}"#
        );

        let frame = Frame::error(None, "bad frame");
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"type":"error","payload":"bad frame"}"#
        );
    }
}

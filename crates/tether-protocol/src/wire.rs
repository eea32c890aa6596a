//! Wire protocol envelope.
//!
//! Messages are exchanged as newline-delimited JSON over one persistent
//! duplex connection (TCP locally, anything byte-stream shaped remotely).
//! Every frame is one of three envelopes: a correlated request, its
//! response, or a fire-and-forget named event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error payload carried inside a response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A single protocol frame.
///
/// Request ids must be unique among the *currently outstanding* requests on
/// one connection; global uniqueness is not required.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Correlated request. The peer must answer with a `Response` carrying
    /// the same `id`.
    Request {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
        timestamp: i64,
    },

    /// Answer to a request. Exactly one of `result`/`error` is populated.
    Response {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
        timestamp: i64,
    },

    /// Named event with an arbitrary payload. Not correlated, not answered.
    Event {
        event: String,
        #[serde(default)]
        data: Value,
        timestamp: i64,
    },
}

impl Message {
    /// Build a request frame with a fresh id and current timestamp.
    pub fn request(method: impl Into<String>, params: Value) -> Self {
        Self::Request {
            id: new_message_id(),
            method: method.into(),
            params,
            timestamp: now_ms(),
        }
    }

    /// Build a success response for the given request id.
    pub fn ok_response(id: impl Into<String>, result: Value) -> Self {
        Self::Response {
            id: id.into(),
            result: Some(result),
            error: None,
            timestamp: now_ms(),
        }
    }

    /// Build an error response for the given request id.
    pub fn err_response(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Response {
            id: id.into(),
            result: None,
            error: Some(ErrorBody::new(message)),
            timestamp: now_ms(),
        }
    }

    /// Build an event frame.
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Self::Event {
            event: event.into(),
            data,
            timestamp: now_ms(),
        }
    }

    /// Serialize to one NDJSON line (newline included).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse a single NDJSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate an id unlikely to collide among outstanding requests.
///
/// Wallclock millis plus a short random suffix. Not a UUID on purpose:
/// uniqueness only matters within one connection's pending set.
pub fn new_message_id() -> String {
    format!("{}-{}", now_ms(), nanoid::nanoid!(8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let msg = Message::request("session.send", json!({"message": "hi"}));
        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"type\":\"request\""));
        assert!(line.contains("\"method\":\"session.send\""));

        let parsed = Message::from_line(line.trim()).unwrap();
        match parsed {
            Message::Request { method, params, .. } => {
                assert_eq!(method, "session.send");
                assert_eq!(params["message"], "hi");
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_response_error_shape() {
        let msg = Message::err_response("abc", "boom");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["id"], "abc");
        assert_eq!(json["error"]["message"], "boom");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_event_defaults_missing_data() {
        let parsed =
            Message::from_line(r#"{"type":"event","event":"connected","timestamp":1}"#).unwrap();
        match parsed {
            Message::Event { event, data, .. } => {
                assert_eq!(event, "connected");
                assert!(data.is_null());
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_message_ids_differ() {
        let a = new_message_id();
        let b = new_message_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = Message::from_line(r#"{"type":"telegram","id":"x"}"#);
        assert!(err.is_err());
    }
}

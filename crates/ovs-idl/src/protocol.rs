//! OVSDB JSON-RPC 1.0 protocol types (RFC 7047 §4)
//!
//! OVSDB predates JSON-RPC 2.0: there is no `jsonrpc` member, responses
//! always carry both `result` and `error`, and notifications are requests
//! whose `id` is `null`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IdlError, Result};

/// JSON-RPC request (or notification when `id` is null)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl Request {
    /// Create a request with a numeric id
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            method: method.into(),
            params,
            id: Value::from(id),
        }
    }

    /// Create a notification (no reply expected)
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            id: Value::Null,
        }
    }
}

/// JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Value,
    pub id: Value,
}

impl Response {
    /// Create a success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            result,
            error: Value::Null,
            id,
        }
    }

    /// Create an error response
    pub fn error(id: Value, error: impl Into<String>) -> Self {
        Self {
            result: Value::Null,
            error: Value::String(error.into()),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_null()
    }
}

/// An incoming message, classified by shape
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Notification { method: String, params: Value },
    Response(Response),
}

impl Message {
    /// Classify a decoded JSON value
    pub fn classify(value: Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| IdlError::protocol(format!("message is not an object: {}", value)))?;

        if obj.contains_key("method") {
            let request: Request = serde_json::from_value(value)?;
            if request.id.is_null() {
                return Ok(Message::Notification {
                    method: request.method,
                    params: request.params,
                });
            }
            return Ok(Message::Request(request));
        }

        if obj.contains_key("result") || obj.contains_key("error") {
            return Ok(Message::Response(serde_json::from_value(value)?));
        }

        Err(IdlError::protocol(format!("unrecognized message: {}", value)))
    }
}

/// Splits a byte stream into top-level JSON values.
///
/// ovsdb-server writes messages back to back with no delimiter, so
/// framing relies on the JSON grammar itself.
#[derive(Debug, Default)]
pub struct JsonFramer {
    buf: Vec<u8>,
}

impl JsonFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as a value
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete value, or `None` if more bytes are needed
    pub fn next_value(&mut self) -> Result<Option<Value>> {
        let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
            self.buf.clear();
            return Ok(None);
        };

        let (value, consumed) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buf[start..]).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) => (value, start + stream.byte_offset()),
                Some(Err(e)) if e.is_eof() => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        };

        self.buf.drain(..consumed);
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = Request::new("list_dbs", json!([]), 7);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"method\":\"list_dbs\""));
        assert!(json.contains("\"id\":7"));
        assert!(!json.contains("jsonrpc"));
    }

    #[test]
    fn test_classify_messages() {
        let update = json!({"method": "update", "params": [null, {}], "id": null});
        assert!(matches!(
            Message::classify(update).unwrap(),
            Message::Notification { ref method, .. } if method == "update"
        ));

        let echo = json!({"method": "echo", "params": [], "id": "echo"});
        assert!(matches!(Message::classify(echo).unwrap(), Message::Request(_)));

        let reply = json!({"result": ["Open_vSwitch"], "error": null, "id": 1});
        match Message::classify(reply).unwrap() {
            Message::Response(resp) => {
                assert!(!resp.is_error());
                assert_eq!(resp.id, json!(1));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        assert!(Message::classify(json!([1, 2])).is_err());
        assert!(Message::classify(json!({"foo": 1})).is_err());
    }

    #[test]
    fn test_framer_splits_back_to_back_values() {
        let mut framer = JsonFramer::new();
        framer.push(br#"{"id":1,"result":[]} {"id":2,"res"#);

        let first = framer.next_value().unwrap().unwrap();
        assert_eq!(first["id"], 1);
        assert!(framer.next_value().unwrap().is_none());

        framer.push(br#"ult":{"a":"}{"},"error":null}"#);
        let second = framer.next_value().unwrap().unwrap();
        assert_eq!(second["result"]["a"], "}{");
        assert!(framer.next_value().unwrap().is_none());
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_framer_rejects_garbage() {
        let mut framer = JsonFramer::new();
        framer.push(b"{]");
        assert!(framer.next_value().is_err());
    }
}

//! Wire envelopes for plugin sessions
//!
//! Requests and responses are JSON objects travelling inside length-prefixed
//! frames (see `transport`). Correlation is by the peer-chosen `id` value,
//! which is opaque to this side and echoed back verbatim.
//!
//! Message flow:
//! ```text
//! Peer → Backend:  {"method": ..., "id": ..., "params": {...} | null}
//! Backend → Peer:  {"id": ..., "result": ...}
//!                  {"id": ..., "error": {"code": ..., "message": ..., "data"?: ...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error codes carried in error responses.
pub mod codes {
    /// The request could not be parsed, or its parameters did not match
    /// the shape the operation expects.
    pub const PARSE_ERROR: i32 = -32700;

    /// The backend does not expose the requested operation.
    pub const NO_SUPPORT: i32 = -32601;

    /// Uncaught fault while handling a request.
    pub const PLUGIN_FAULT: i32 = -32603;

    /// The backend failed to construct.
    pub const CONSTRUCTION_ERROR: i32 = -32099;
}

/// Correlation id for errors that precede any request, such as a backend
/// construction failure.
pub fn sentinel_id() -> Value {
    Value::from(0)
}

/// A fully extracted inbound request. At most one is in flight at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub id: Value,
    /// Named arguments for the operation. `None` covers both an absent
    /// `params` field and an explicit `null`.
    pub params: Option<Map<String, Value>>,
}

/// Failure to extract a [`Request`] from a decoded message.
///
/// Carries whatever id could still be recovered so the error response can
/// correlate with the offending request.
#[derive(Debug)]
pub struct MalformedRequest {
    pub id: Option<Value>,
    pub detail: String,
}

impl Request {
    /// Extract a request from a decoded JSON message.
    pub fn from_value(value: Value) -> Result<Self, MalformedRequest> {
        let mut fields = match value {
            Value::Object(map) => map,
            other => {
                return Err(MalformedRequest {
                    id: None,
                    detail: format!("expected a request object, got {}", json_kind(&other)),
                })
            }
        };

        let id = fields.remove("id");

        let method = match fields.remove("method") {
            Some(Value::String(name)) => name,
            Some(other) => {
                return Err(MalformedRequest {
                    id,
                    detail: format!("method must be a string, got {}", json_kind(&other)),
                })
            }
            None => {
                return Err(MalformedRequest {
                    id,
                    detail: "request has no method field".to_string(),
                })
            }
        };

        let id = match id {
            Some(value) => value,
            None => {
                return Err(MalformedRequest {
                    id: None,
                    detail: format!("request for {method} has no id field"),
                })
            }
        };

        let params = match fields.remove("params") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(other) => {
                return Err(MalformedRequest {
                    id: Some(id),
                    detail: format!("params must be an object or null, got {}", json_kind(&other)),
                })
            }
        };

        Ok(Request { method, id, params })
    }
}

/// Error payload of an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An outbound response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Error { id: Value, error: ErrorBody },
    Success { id: Value, result: Value },
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Response::Success { id, result }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Response::Error {
            id,
            error: ErrorBody {
                code,
                message: message.into(),
                data,
            },
        }
    }

    /// The correlation id this response answers.
    pub fn id(&self) -> &Value {
        match self {
            Response::Error { id, .. } => id,
            Response::Success { id, .. } => id,
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_complete_request() {
        let req = Request::from_value(json!({
            "method": "volume_create",
            "id": 12,
            "params": {"name": "v0", "size_bytes": 1024}
        }))
        .unwrap();

        assert_eq!(req.method, "volume_create");
        assert_eq!(req.id, json!(12));
        let params = req.params.unwrap();
        assert_eq!(params.get("name"), Some(&json!("v0")));
    }

    #[test]
    fn null_and_absent_params_are_equivalent() {
        let with_null =
            Request::from_value(json!({"method": "ping", "id": 1, "params": null})).unwrap();
        let absent = Request::from_value(json!({"method": "ping", "id": 1})).unwrap();
        assert_eq!(with_null, absent);
        assert!(with_null.params.is_none());
    }

    #[test]
    fn missing_method_still_recovers_id() {
        let err = Request::from_value(json!({"id": 44})).unwrap_err();
        assert_eq!(err.id, Some(json!(44)));
        assert!(err.detail.contains("method"));
    }

    #[test]
    fn non_object_request_is_rejected() {
        let err = Request::from_value(json!([1, 2, 3])).unwrap_err();
        assert!(err.id.is_none());
        assert!(err.detail.contains("an array"));
    }

    #[test]
    fn array_params_are_rejected_with_id() {
        let err =
            Request::from_value(json!({"method": "ping", "id": 5, "params": [1]})).unwrap_err();
        assert_eq!(err.id, Some(json!(5)));
        assert!(err.detail.contains("params"));
    }

    #[test]
    fn missing_id_is_rejected() {
        let err = Request::from_value(json!({"method": "ping"})).unwrap_err();
        assert!(err.id.is_none());
        assert!(err.detail.contains("id"));
    }

    #[test]
    fn error_response_omits_absent_data() {
        let wire = serde_json::to_value(Response::error(
            json!(7),
            codes::NO_SUPPORT,
            "Unsupported operation",
            None,
        ))
        .unwrap();
        assert_eq!(
            wire,
            json!({"id": 7, "error": {"code": -32601, "message": "Unsupported operation"}})
        );
    }

    #[test]
    fn error_response_carries_data_verbatim() {
        let wire = serde_json::to_value(Response::error(
            json!(9),
            50,
            "disk full",
            Some(json!({"foo": 1})),
        ))
        .unwrap();
        assert_eq!(
            wire,
            json!({"id": 9, "error": {"code": 50, "message": "disk full", "data": {"foo": 1}}})
        );
    }

    #[test]
    fn success_response_round_trips() {
        let resp = Response::success(json!("abc"), json!({"total": 10}));
        let wire = serde_json::to_string(&resp).unwrap();
        let back: Response = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, resp);
        assert_eq!(back.id(), &json!("abc"));
    }
}

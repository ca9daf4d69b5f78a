//! JSON-RPC 2.0 message types for the line-delimited stdio transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Tool protocol revision announced on `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// An incoming request or notification.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// An outgoing response. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Parses one line into a request, or the error response to send back.
pub fn parse_request(line: &str) -> Result<Request, Response> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| Response::failure(Value::Null, PARSE_ERROR, format!("Parse error: {e}")))?;

    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: Request = serde_json::from_value(value).map_err(|e| {
        Response::failure(id.clone(), INVALID_REQUEST, format!("Invalid request: {e}"))
    })?;

    if request.jsonrpc != JSONRPC_VERSION {
        return Err(Response::failure(
            id,
            INVALID_REQUEST,
            format!("Unsupported jsonrpc version '{}'", request.jsonrpc),
        ));
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_valid_request() {
        let req = parse_request(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert_eq!(req.id, Some(json!(1)));
        assert_eq!(req.method, "ping");
        assert!(req.params.is_null());
        assert!(!req.is_notification());
    }

    #[test]
    fn test_parse_notification() {
        let req =
            parse_request(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn test_parse_error_code() {
        let resp = parse_request("{not json").unwrap_err();
        assert_eq!(resp.id, Value::Null);
        assert_eq!(resp.error.unwrap().code, PARSE_ERROR);
    }

    #[test]
    fn test_invalid_request_keeps_id() {
        let resp = parse_request(r#"{"jsonrpc":"2.0","id":"a"}"#).unwrap_err();
        assert_eq!(resp.id, json!("a"));
        assert_eq!(resp.error.unwrap().code, INVALID_REQUEST);

        let resp = parse_request(r#"{"jsonrpc":"1.0","id":2,"method":"ping"}"#).unwrap_err();
        assert_eq!(resp.error.unwrap().code, INVALID_REQUEST);
    }

    #[test]
    fn test_response_serialization_omits_absent_fields() {
        let ok = serde_json::to_value(Response::success(json!(3), json!({}))).unwrap();
        assert_eq!(ok, json!({"jsonrpc": "2.0", "id": 3, "result": {}}));

        let err = serde_json::to_value(Response::failure(json!(4), METHOD_NOT_FOUND, "nope"))
            .unwrap();
        assert_eq!(
            err,
            json!({"jsonrpc": "2.0", "id": 4, "error": {"code": -32601, "message": "nope"}})
        );
    }
}

//! JSON-RPC 2.0 message model for the proxied wire protocol.
//!
//! The proxy treats payloads as opaque `serde_json::Value`s; only the
//! envelope (id, method, result/error) is interpreted here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC parse error.
pub const PARSE_ERROR: i32 = -32700;
/// Connection to the child closed before a response arrived.
pub const CHILD_DISCONNECTED: i32 = -32000;
/// The child did not answer within the configured deadline.
pub const REQUEST_TIMEOUT: i32 = -32001;
/// No child connection is available (restart window, exhausted budget).
pub const CHILD_UNAVAILABLE: i32 = -32002;
/// A restart cycle is already executing.
pub const RESTART_IN_PROGRESS: i32 = -32003;
/// The configured restart limit was reached.
pub const RESTART_LIMIT_EXCEEDED: i32 = -32004;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
    Notification(RpcNotification),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

impl RpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_the_three_message_kinds() {
        let request: RpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        assert!(matches!(request, RpcMessage::Request(_)));

        let response: RpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).unwrap();
        assert!(matches!(response, RpcMessage::Response(_)));

        let notification: RpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(matches!(notification, RpcMessage::Notification(_)));
    }

    #[test]
    fn error_response_serializes_without_result() {
        let response = RpcResponse::error(json!(7), CHILD_UNAVAILABLE, "child server is not available");
        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["id"], 7);
        assert_eq!(encoded["error"]["code"], CHILD_UNAVAILABLE);
        assert!(encoded.get("result").is_none());
    }
}

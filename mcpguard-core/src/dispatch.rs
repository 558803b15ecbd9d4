//! Method-family classification and forwarding error mapping.
//!
//! Classification is a closed set: every client request routes to exactly
//! one handler, with no open-ended dispatch by method string downstream.

use crate::error::ProxyError;
use crate::rpc::{RpcRequest, RpcResponse};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodFamily {
    Initialize,
    ToolsList,
    ToolsCall,
    Resources,
    Prompts,
    Completion,
    Ping,
    Other,
}

pub fn classify(method: &str) -> MethodFamily {
    match method {
        "initialize" => MethodFamily::Initialize,
        "tools/list" => MethodFamily::ToolsList,
        "tools/call" => MethodFamily::ToolsCall,
        "completion/complete" => MethodFamily::Completion,
        "ping" => MethodFamily::Ping,
        m if m.starts_with("resources/") => MethodFamily::Resources,
        m if m.starts_with("prompts/") => MethodFamily::Prompts,
        _ => MethodFamily::Other,
    }
}

/// The tool a `tools/call` request targets, if any.
pub fn tool_call_name(request: &RpcRequest) -> Option<&str> {
    request.params.as_ref()?.get("name")?.as_str()
}

/// Error response the client can recognize and retry on, carrying the
/// client's own request id.
pub fn failure_response(id: Value, error: &ProxyError) -> RpcResponse {
    RpcResponse::error(id, error.code(), error.to_string())
}

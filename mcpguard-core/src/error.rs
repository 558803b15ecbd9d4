use thiserror::Error;

use crate::rpc;

/// Failure taxonomy of the proxy core.
///
/// Per-request failures (`Timeout`, `Disconnected`, `ChildUnavailable`) are
/// converted into protocol-level error responses on the client connection;
/// they never terminate the client session. The only fatal variant is
/// `Spawn` on the very first start.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to spawn child process: {0}")]
    Spawn(String),

    #[error("restart limit exceeded (limit {0})")]
    RestartLimitExceeded(u32),

    #[error("a restart is already in progress")]
    RestartInProgress,

    #[error("child server is not available")]
    ChildUnavailable,

    #[error("request timed out")]
    Timeout,

    #[error("connection closed before a response arrived")]
    Disconnected,

    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

impl ProxyError {
    /// JSON-RPC error code the client sees for this failure.
    pub fn code(&self) -> i32 {
        match self {
            ProxyError::Spawn(_) | ProxyError::Disconnected => rpc::CHILD_DISCONNECTED,
            ProxyError::RestartLimitExceeded(_) => rpc::RESTART_LIMIT_EXCEEDED,
            ProxyError::RestartInProgress => rpc::RESTART_IN_PROGRESS,
            ProxyError::ChildUnavailable => rpc::CHILD_UNAVAILABLE,
            ProxyError::Timeout => rpc::REQUEST_TIMEOUT,
            ProxyError::MalformedMessage(_) => rpc::PARSE_ERROR,
        }
    }
}

//! Restart orchestration: the implementation behind the synthetic
//! `restart_server` tool and crash recovery.
//!
//! At most one restart cycle executes at a time. A second request while one
//! is in flight is rejected immediately, never queued: queuing would make
//! the ordering of child identities ambiguous.

use crate::error::ProxyError;
use crate::proxy::Proxy;
use crate::rpc::{RpcMessage, RpcResponse};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Single-flight gate over the restart cycle.
pub struct RestartGate {
    in_progress: AtomicBool,
}

impl RestartGate {
    pub fn new() -> Self {
        Self {
            in_progress: AtomicBool::new(false),
        }
    }

    /// Acquires the gate, or `None` if a cycle is already running. The
    /// permit releases on drop, so every exit path of the cycle marks the
    /// gate idle again.
    pub fn try_acquire(&self) -> Option<RestartPermit<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RestartPermit { gate: self })
    }
}

impl Default for RestartGate {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RestartPermit<'a> {
    gate: &'a RestartGate,
}

impl Drop for RestartPermit<'_> {
    fn drop(&mut self) {
        self.gate.in_progress.store(false, Ordering::SeqCst);
    }
}

/// Initialize params the proxy uses for a re-handshake when the client has
/// never initialized (a restart before the first handshake).
pub fn default_initialize_params() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {},
        "clientInfo": {
            "name": "mcpguard",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

impl Proxy {
    /// Drives one full restart cycle: detach the old child connection
    /// (failing its in-flight requests), restart the process, attach a
    /// fresh connection and re-handshake it. The caller answers the
    /// originating request and emits the list-changed notification
    /// afterwards, in that order.
    pub(crate) async fn perform_restart(self: Arc<Self>) -> Result<Value, ProxyError> {
        let _permit = self
            .restart_gate
            .try_acquire()
            .ok_or(ProxyError::RestartInProgress)?;

        info!("restart cycle starting");

        // Requests still in flight to the old child fail with Disconnected
        // now, not after their timeout. They are never replayed.
        self.detach_child().await;

        let io = self.supervisor.restart().await?;
        self.clone().attach_child(io).await;
        self.handshake_child().await?;

        info!("restart cycle complete");
        Ok(json!({
            "content": [{"type": "text", "text": "server restarted"}]
        }))
    }

    /// Proxy-originated handshake with a freshly started child: initialize
    /// with the client's cached params (the client never sees this
    /// exchange), then the initialized notification, then cache the child's
    /// refreshed capability set.
    pub(crate) async fn handshake_child(&self) -> Result<(), ProxyError> {
        let child = self
            .child
            .read()
            .await
            .clone()
            .ok_or(ProxyError::ChildUnavailable)?;

        let params = self
            .cached_init_params
            .read()
            .await
            .clone()
            .unwrap_or_else(default_initialize_params);

        let response = child.request("initialize", Some(params)).await?;
        if let Some(error) = &response.error {
            warn!(code = error.code, message = %error.message, "child rejected initialize during restart");
            return Err(ProxyError::ChildUnavailable);
        }
        if let Some(result) = response.result {
            *self.cached_capabilities.write().await = Some(result);
        }
        child.notify("notifications/initialized", None)?;
        Ok(())
    }

    /// Handles a `tools/call` targeting the synthetic restart tool. Never
    /// forwarded to the child; the result is synthesized locally.
    pub(crate) async fn handle_restart_call(self: Arc<Self>, id: Value) {
        match self.clone().perform_restart().await {
            Ok(result) => {
                // Success result first, then the capability-changed
                // notification so the client re-queries the new child.
                let _ = self
                    .client
                    .send(RpcMessage::Response(RpcResponse::result(id, result)));
                self.notify_tools_changed();
            }
            Err(error @ ProxyError::RestartInProgress) => {
                self.respond_failure(id, &error);
            }
            Err(error) => {
                // Restart failures are reported, never swallowed: the
                // caller gets a structured failure result and the session
                // stays open even though the child is gone.
                let result = json!({
                    "content": [{"type": "text", "text": format!("restart failed: {error}")}],
                    "isError": true
                });
                let _ = self
                    .client
                    .send(RpcMessage::Response(RpcResponse::result(id, result)));
            }
        }
    }
}

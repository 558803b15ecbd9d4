//! Proxy wiring: the client-facing read loop, the child-facing message
//! pump, and the crash watcher that drives automatic restarts.
//!
//! The client-facing connection is created once and lives for the whole
//! proxy process. The child-facing connection is swapped wholesale on every
//! restart. That asymmetry is what makes restarts invisible to the client.

use crate::capabilities::{augment_initialize_result, augment_tools_result, RESTART_TOOL_NAME};
use crate::config::Config;
use crate::connection::{Connection, MessageSink, MessageSource};
use crate::dispatch::{self, MethodFamily};
use crate::error::ProxyError;
use crate::restart::RestartGate;
use crate::rpc::{RpcMessage, RpcNotification, RpcRequest, RpcResponse, JSONRPC_VERSION};
use crate::supervisor::{ChildIo, ChildState, Supervisor, SupervisorEvent};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

pub struct Proxy {
    pub(crate) supervisor: Arc<Supervisor>,
    pub(crate) config: Config,
    /// Client-facing connection; never replaced.
    pub(crate) client: Arc<Connection>,
    /// Current child-facing connection; replaced on every restart.
    pub(crate) child: RwLock<Option<Arc<Connection>>>,
    pub(crate) restart_gate: RestartGate,
    /// The client's initialize params, replayed on restart re-handshakes.
    pub(crate) cached_init_params: RwLock<Option<Value>>,
    /// The child's most recent raw (unaugmented) initialize result.
    pub(crate) cached_capabilities: RwLock<Option<Value>>,
}

impl Proxy {
    pub fn new(
        supervisor: Arc<Supervisor>,
        config: Config,
        client_writer: MessageSink,
        client_reader: MessageSource,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RpcMessage>) {
        let (client, client_rx) =
            Connection::attach(client_writer, client_reader, config.request_timeout);
        let proxy = Arc::new(Self {
            supervisor,
            config,
            client,
            child: RwLock::new(None),
            restart_gate: RestartGate::new(),
            cached_init_params: RwLock::new(None),
            cached_capabilities: RwLock::new(None),
        });
        (proxy, client_rx)
    }

    /// The child's most recently cached capability set, as reported by the
    /// child itself (without the synthetic tool).
    pub async fn capabilities(&self) -> Option<Value> {
        self.cached_capabilities.read().await.clone()
    }

    /// Runs the proxy until the client connection closes. Failure to spawn
    /// the child on this first start is fatal.
    pub async fn run(
        self: Arc<Self>,
        mut client_rx: mpsc::UnboundedReceiver<RpcMessage>,
    ) -> Result<(), ProxyError> {
        let io = self.supervisor.start().await?;
        self.clone().attach_child(io).await;
        self.clone().spawn_crash_watcher();

        while let Some(message) = client_rx.recv().await {
            match message {
                RpcMessage::Request(request) => self.clone().handle_client_request(request),
                RpcMessage::Notification(notification) => {
                    self.forward_client_notification(notification).await;
                }
                RpcMessage::Response(response) => {
                    // Client responses to child-originated requests resolve
                    // inside the client connection; anything else is stray.
                    debug!(id = %response.id, "ignoring stray response from client");
                }
            }
        }

        info!("client connection closed, shutting down");
        self.detach_child().await;
        self.supervisor.stop().await;
        Ok(())
    }

    // ========================================================================
    // Client -> child direction
    // ========================================================================

    /// Each request runs in its own task so a slow child never serializes
    /// the in-flight traffic.
    fn handle_client_request(self: Arc<Self>, request: RpcRequest) {
        tokio::spawn(async move {
            match dispatch::classify(&request.method) {
                MethodFamily::Initialize => self.handle_initialize(request).await,
                MethodFamily::ToolsList => self.handle_tools_list(request).await,
                MethodFamily::ToolsCall
                    if dispatch::tool_call_name(&request) == Some(RESTART_TOOL_NAME) =>
                {
                    let id = request.id.clone();
                    self.handle_restart_call(id).await;
                }
                // Everything else is opaque: tool calls, resources, prompts,
                // completion, ping and unknown methods forward unmodified.
                _ => self.forward_request(request).await,
            }
        });
    }

    async fn handle_initialize(&self, request: RpcRequest) {
        *self.cached_init_params.write().await = request.params.clone();

        let Some(child) = self.ready_child().await else {
            self.respond_failure(request.id, &ProxyError::ChildUnavailable);
            return;
        };
        match child.request(&request.method, request.params).await {
            Ok(response) => {
                let mut reply = RpcResponse {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id: request.id,
                    result: None,
                    error: response.error,
                };
                if let Some(result) = response.result {
                    *self.cached_capabilities.write().await = Some(result.clone());
                    reply.result = Some(augment_initialize_result(&result));
                }
                let _ = self.client.send(RpcMessage::Response(reply));
            }
            Err(error) => self.respond_failure(request.id, &error),
        }
    }

    async fn handle_tools_list(&self, request: RpcRequest) {
        let Some(child) = self.ready_child().await else {
            self.respond_failure(request.id, &ProxyError::ChildUnavailable);
            return;
        };
        match child.request(&request.method, request.params).await {
            Ok(response) => {
                let reply = RpcResponse {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id: request.id,
                    result: response.result.as_ref().map(augment_tools_result),
                    error: response.error,
                };
                let _ = self.client.send(RpcMessage::Response(reply));
            }
            Err(error) => self.respond_failure(request.id, &error),
        }
    }

    /// The shared dispatch contract: fail fast while the child is away,
    /// otherwise forward and relay the child's answer verbatim under the
    /// client's id.
    async fn forward_request(&self, request: RpcRequest) {
        let Some(child) = self.ready_child().await else {
            self.respond_failure(request.id, &ProxyError::ChildUnavailable);
            return;
        };
        match child.request(&request.method, request.params).await {
            Ok(response) => {
                let reply = RpcResponse {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id: request.id,
                    result: response.result,
                    error: response.error,
                };
                let _ = self.client.send(RpcMessage::Response(reply));
            }
            Err(error) => self.respond_failure(request.id, &error),
        }
    }

    async fn forward_client_notification(&self, notification: RpcNotification) {
        match self.child.read().await.clone() {
            Some(child) => {
                let _ = child.send(RpcMessage::Notification(notification));
            }
            None => {
                warn!(method = %notification.method, "dropping client notification, child unavailable");
            }
        }
    }

    // ========================================================================
    // Child -> client direction
    // ========================================================================

    pub(crate) async fn attach_child(self: Arc<Self>, io: ChildIo) {
        let (writer, reader) = io;
        let (connection, child_rx) =
            Connection::attach(writer, reader, self.config.request_timeout);
        *self.child.write().await = Some(connection);
        tokio::spawn(self.pump_child(child_rx));
    }

    /// Replaces the current child connection with nothing, failing every
    /// request still in flight to the old child with `Disconnected`.
    pub(crate) async fn detach_child(&self) {
        if let Some(connection) = self.child.write().await.take() {
            connection.detach();
        }
    }

    async fn ready_child(&self) -> Option<Arc<Connection>> {
        if self.supervisor.state() != ChildState::Running {
            return None;
        }
        self.child.read().await.clone()
    }

    /// One pump per child connection generation; ends when the connection
    /// is detached or the child's stdout closes.
    async fn pump_child(self: Arc<Self>, mut child_rx: mpsc::UnboundedReceiver<RpcMessage>) {
        while let Some(message) = child_rx.recv().await {
            match message {
                RpcMessage::Request(request) => {
                    let proxy = self.clone();
                    tokio::spawn(async move { proxy.relay_child_request(request).await });
                }
                RpcMessage::Notification(notification) => {
                    let _ = self.client.send(RpcMessage::Notification(notification));
                }
                RpcMessage::Response(response) => {
                    debug!(id = %response.id, "ignoring stray response from child");
                }
            }
        }
        debug!("child message pump ended");
    }

    /// Child-originated requests (e.g. sampling) pass through symmetrically:
    /// forwarded to the client under a client-direction id, answered back to
    /// the child under its original id.
    async fn relay_child_request(&self, request: RpcRequest) {
        let child = self.child.read().await.clone();
        let reply = match self.client.request(&request.method, request.params).await {
            Ok(response) => RpcResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id: request.id,
                result: response.result,
                error: response.error,
            },
            Err(error) => dispatch::failure_response(request.id, &error),
        };
        // If the child was replaced while the client was answering, the old
        // connection is detached and this send is a no-op.
        if let Some(child) = child {
            let _ = child.send(RpcMessage::Response(reply));
        }
    }

    // ========================================================================
    // Crash handling
    // ========================================================================

    fn spawn_crash_watcher(self: Arc<Self>) {
        let mut events = self.supervisor.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SupervisorEvent::Crashed { exit_code }) => {
                        self.clone().handle_crash(exit_code).await;
                    }
                    Ok(SupervisorEvent::StateChanged(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "crash watcher lagged behind supervisor events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn handle_crash(self: Arc<Self>, exit_code: Option<i32>) {
        warn!(?exit_code, "child crashed");
        self.detach_child().await;

        if self.supervisor.should_auto_restart() {
            tokio::time::sleep(self.supervisor.restart_delay()).await;
            match self.clone().perform_restart().await {
                Ok(_) => {
                    info!("child restarted after crash");
                    self.notify_tools_changed();
                }
                Err(ProxyError::RestartInProgress) => {
                    debug!("crash recovery skipped, a restart is already running");
                }
                Err(error) => {
                    error!(%error, "automatic restart failed");
                    self.notify_tools_changed();
                }
            }
        } else {
            // The session persists in degraded form: the client stays
            // connected and every forward fails with ChildUnavailable.
            error!("child crashed and automatic restart is unavailable");
            self.notify_tools_changed();
        }
    }

    pub(crate) fn respond_failure(&self, id: Value, error: &ProxyError) {
        let _ = self
            .client
            .send(RpcMessage::Response(dispatch::failure_response(id, error)));
    }

    pub(crate) fn notify_tools_changed(&self) {
        let _ = self.client.notify("notifications/tools/list_changed", None);
    }
}

//! Transport correlator: frames newline-delimited JSON-RPC messages over a
//! duplex byte stream and matches responses to pending requests by id.
//!
//! Each `Connection` owns one direction of the proxy (client-facing or
//! child-facing): its own writer task, reader task, pending-request map and
//! id generator. The two directions therefore have disjoint identifier
//! namespaces by construction.

use crate::error::ProxyError;
use crate::rpc::{RpcMessage, RpcNotification, RpcRequest, RpcResponse};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Where outbound messages are written (child stdin, or the proxy's stdout).
pub type MessageSink = Box<dyn AsyncWrite + Send + Unpin>;
/// Where inbound messages are read from (child stdout, or the proxy's stdin).
pub type MessageSource = Box<dyn AsyncBufRead + Send + Unpin>;

type PendingMap = Arc<DashMap<u64, oneshot::Sender<RpcResponse>>>;

pub struct Connection {
    outbound: mpsc::UnboundedSender<RpcMessage>,
    pending: PendingMap,
    next_id: AtomicU64,
    timeout: Duration,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl Connection {
    /// Binds a duplex stream and starts the writer and reader tasks.
    ///
    /// Returns the connection plus the stream of inbound requests and
    /// notifications. Responses never appear on that stream: the reader
    /// resolves them against the pending map, and late answers for ids that
    /// already resolved are discarded.
    pub fn attach(
        writer: MessageSink,
        reader: MessageSource,
        timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RpcMessage>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(DashMap::new());

        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, pending.clone()));
        let reader_task = tokio::spawn(read_loop(reader, pending.clone(), inbound_tx));

        let connection = Arc::new(Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            timeout,
            writer_task,
            reader_task,
        });

        (connection, inbound_rx)
    }

    /// Sends a request and suspends until its response arrives, the timeout
    /// fires, or the connection is torn down. Does not block other in-flight
    /// requests on the same connection.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<RpcResponse, ProxyError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let request = RpcRequest::new(Value::from(id), method, params);
        if self.outbound.send(RpcMessage::Request(request)).is_err() {
            self.pending.remove(&id);
            return Err(ProxyError::Disconnected);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the stream closed or the connection detached.
            Ok(Err(_)) => Err(ProxyError::Disconnected),
            Err(_) => {
                self.pending.remove(&id);
                Err(ProxyError::Timeout)
            }
        }
    }

    /// Fire-and-forget notification. No correlation, no failure surfaced
    /// beyond the connection being gone.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProxyError> {
        self.send(RpcMessage::Notification(RpcNotification::new(method, params)))
    }

    /// Writes an already-built message (used to relay responses verbatim).
    pub fn send(&self, message: RpcMessage) -> Result<(), ProxyError> {
        self.outbound
            .send(message)
            .map_err(|_| ProxyError::Disconnected)
    }

    /// Tears the connection down: stops both tasks and fails every
    /// outstanding request with `Disconnected`. Called when the child-facing
    /// connection is replaced on restart, and at shutdown.
    pub fn detach(&self) {
        self.reader_task.abort();
        self.writer_task.abort();
        // Dropping the senders resolves the waiting callers as Disconnected.
        self.pending.clear();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

async fn write_loop(
    mut writer: MessageSink,
    mut outbound_rx: mpsc::UnboundedReceiver<RpcMessage>,
    pending: PendingMap,
) {
    while let Some(message) = outbound_rx.recv().await {
        let line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                error!("failed to serialize outbound message: {e}");
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!("failed to write to connection: {e}");
            break;
        }
        if let Err(e) = writer.write_all(b"\n").await {
            error!("failed to write to connection: {e}");
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("failed to flush connection: {e}");
            break;
        }
    }
    // A dead sink can no longer produce answers.
    pending.clear();
    debug!("connection writer task ended");
}

async fn read_loop(
    reader: MessageSource,
    pending: PendingMap,
    inbound_tx: mpsc::UnboundedSender<RpcMessage>,
) {
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<RpcMessage>(line) {
                    Ok(RpcMessage::Response(response)) => resolve_response(&pending, response),
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // The sender of garbage does not get to take the
                        // connection down with it.
                        warn!("{}", ProxyError::MalformedMessage(e.to_string()));
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("read error on connection: {e}");
                break;
            }
        }
    }
    // EOF or read error: fail whatever is still in flight.
    pending.clear();
    debug!("connection reader task ended");
}

fn resolve_response(pending: &DashMap<u64, oneshot::Sender<RpcResponse>>, response: RpcResponse) {
    let Some(id) = response.id.as_u64() else {
        debug!(id = %response.id, "discarding response with an id this side never issued");
        return;
    };
    match pending.remove(&id) {
        Some((_, tx)) => {
            // The receiver may have timed out in the meantime; that late
            // answer is dropped here.
            let _ = tx.send(response);
        }
        None => debug!(id, "discarding response for an unknown or already-resolved request"),
    }
}

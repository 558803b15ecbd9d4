//! Child process supervisor: spawning, lifecycle state machine, restart
//! policy and crash detection.
//!
//! The supervisor is the sole owner of the OS process handle. The handle
//! lives inside a monitor task; `stop()` talks to that task over a channel,
//! so nothing ever touches the process from two places at once.

use crate::config::Config;
use crate::connection::{MessageSink, MessageSource};
use crate::error::ProxyError;
use anyhow::{anyhow, Context};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// How to launch the child: command, arguments, working directory and
/// environment overlay (on top of the inherited environment).
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl ChildSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            cwd: None,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Crashed,
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    StateChanged(ChildState),
    /// The child exited without a preceding `stop()`.
    Crashed { exit_code: Option<i32> },
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub auto_restart: bool,
    pub graceful_timeout: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_delay: Duration::from_millis(1000),
            auto_restart: true,
            graceful_timeout: Duration::from_millis(5000),
        }
    }
}

impl RestartPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_restarts: config.restart_limit,
            restart_delay: config.restart_delay,
            auto_restart: config.auto_restart,
            graceful_timeout: config.graceful_timeout,
        }
    }
}

/// The protocol streams a connection attaches to.
pub type ChildIo = (MessageSink, MessageSource);

/// Everything a starter hands back: protocol sink/source, the child's
/// stderr (drained into the log) and the OS handle. The last two are absent
/// for in-memory children used in tests.
pub type SpawnedChild = (
    MessageSink,
    MessageSource,
    Option<MessageSource>,
    Option<Child>,
);

/// Injectable process starter, so tests can substitute duplex streams for a
/// real child process.
pub type ProcessStarterFn =
    Arc<dyn Fn(ChildSpec) -> BoxFuture<'static, anyhow::Result<SpawnedChild>> + Send + Sync>;

struct StopRequest {
    ack: oneshot::Sender<()>,
}

pub struct Supervisor {
    spec: ChildSpec,
    policy: RestartPolicy,
    starter: ProcessStarterFn,
    state_tx: watch::Sender<ChildState>,
    events_tx: broadcast::Sender<SupervisorEvent>,
    stop_tx: tokio::sync::Mutex<Option<mpsc::Sender<StopRequest>>>,
    restarts: AtomicU32,
    pid: Mutex<Option<u32>>,
    last_exit: Arc<Mutex<Option<i32>>>,
}

impl Supervisor {
    pub fn new(spec: ChildSpec, policy: RestartPolicy) -> Self {
        let starter: ProcessStarterFn = Arc::new(|spec| Box::pin(spawn_child(spec)));
        Self::with_starter(spec, policy, starter)
    }

    pub fn with_starter(spec: ChildSpec, policy: RestartPolicy, starter: ProcessStarterFn) -> Self {
        let (state_tx, _) = watch::channel(ChildState::Stopped);
        let (events_tx, _) = broadcast::channel(64);
        Self {
            spec,
            policy,
            starter,
            state_tx,
            events_tx,
            stop_tx: tokio::sync::Mutex::new(None),
            restarts: AtomicU32::new(0),
            pid: Mutex::new(None),
            last_exit: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> ChildState {
        *self.state_tx.borrow()
    }

    /// Watch channel carrying the current lifecycle state.
    pub fn watch_state(&self) -> watch::Receiver<ChildState> {
        self.state_tx.subscribe()
    }

    /// Broadcast stream of state transitions and crash events.
    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events_tx.subscribe()
    }

    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap()
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        *self.last_exit.lock().unwrap()
    }

    pub fn restart_delay(&self) -> Duration {
        self.policy.restart_delay
    }

    /// Whether a crash should be answered with an automatic restart:
    /// the policy allows it and the budget is not exhausted.
    pub fn should_auto_restart(&self) -> bool {
        self.policy.auto_restart && self.restarts.load(Ordering::SeqCst) < self.policy.max_restarts
    }

    /// Spawns the child: `Stopped -> Starting -> Running`. Returns the
    /// protocol streams for the caller to attach a connection to. A spawn
    /// failure leaves the state `Stopped`; on the very first start the
    /// caller treats that as fatal.
    pub async fn start(&self) -> Result<ChildIo, ProxyError> {
        if matches!(self.state(), ChildState::Starting | ChildState::Running) {
            return Err(ProxyError::Spawn("child is already running".to_string()));
        }
        self.set_state(ChildState::Starting);

        let spawned = match (self.starter)(self.spec.clone()).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.set_state(ChildState::Stopped);
                return Err(ProxyError::Spawn(e.to_string()));
            }
        };
        let (writer, reader, stderr, child) = spawned;

        if let Some(stderr) = stderr {
            tokio::spawn(drain_stderr(stderr));
        }

        let pid = child.as_ref().and_then(|c| c.id());
        *self.pid.lock().unwrap() = pid;

        let (stop_tx, stop_rx) = mpsc::channel(1);
        *self.stop_tx.lock().await = Some(stop_tx);

        // Running must be published before the monitor can observe an
        // instant exit, or a Crashed transition would be overwritten.
        self.set_state(ChildState::Running);
        tokio::spawn(monitor_child(
            child,
            stop_rx,
            self.state_tx.clone(),
            self.events_tx.clone(),
            self.last_exit.clone(),
            self.policy.graceful_timeout,
            pid,
        ));

        Ok((writer, reader))
    }

    /// Graceful stop with kill escalation: `Stopping -> Stopped`.
    /// Idempotent; stopping an already-dead child is a no-op.
    pub async fn stop(&self) {
        let stop_tx = self.stop_tx.lock().await.take();
        let Some(stop_tx) = stop_tx else {
            if self.state() != ChildState::Stopped {
                self.set_state(ChildState::Stopped);
            }
            return;
        };

        self.set_state(ChildState::Stopping);
        let (ack_tx, ack_rx) = oneshot::channel();
        if stop_tx.send(StopRequest { ack: ack_tx }).await.is_ok() {
            // The monitor acks once the process is confirmed gone. A closed
            // channel means it already exited on its own.
            let _ = ack_rx.await;
        }
        *self.pid.lock().unwrap() = None;
        self.set_state(ChildState::Stopped);
    }

    /// Stop-then-start cycle counted against the restart budget. Exceeding
    /// the budget fails with `RestartLimitExceeded` and leaves the child
    /// stopped; the caller decides whether that is fatal.
    pub async fn restart(&self) -> Result<ChildIo, ProxyError> {
        let attempt = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.policy.max_restarts {
            self.stop().await;
            return Err(ProxyError::RestartLimitExceeded(self.policy.max_restarts));
        }

        info!(attempt, limit = self.policy.max_restarts, "restarting child process");
        self.set_state(ChildState::Restarting);
        self.stop().await;
        self.start().await
    }

    fn set_state(&self, state: ChildState) {
        publish_state(&self.state_tx, &self.events_tx, state);
    }
}

fn publish_state(
    state_tx: &watch::Sender<ChildState>,
    events_tx: &broadcast::Sender<SupervisorEvent>,
    state: ChildState,
) {
    debug!(?state, "supervisor state");
    state_tx.send_replace(state);
    let _ = events_tx.send(SupervisorEvent::StateChanged(state));
}

/// Owns the OS process handle for its whole lifetime. Ends when the child
/// exits on its own (crash) or a stop request is served.
async fn monitor_child(
    child: Option<Child>,
    mut stop_rx: mpsc::Receiver<StopRequest>,
    state_tx: watch::Sender<ChildState>,
    events_tx: broadcast::Sender<SupervisorEvent>,
    last_exit: Arc<Mutex<Option<i32>>>,
    graceful_timeout: Duration,
    pid: Option<u32>,
) {
    let Some(mut child) = child else {
        // In-memory children have no OS process; only the stop handshake
        // needs serving.
        if let Some(request) = stop_rx.recv().await {
            let _ = request.ack.send(());
        }
        return;
    };

    tokio::select! {
        status = child.wait() => {
            let exit_code = status.ok().and_then(|s| s.code());
            *last_exit.lock().unwrap() = exit_code;
            warn!(?exit_code, "child process exited unexpectedly");
            publish_state(&state_tx, &events_tx, ChildState::Crashed);
            let _ = events_tx.send(SupervisorEvent::Crashed { exit_code });
        }
        request = stop_rx.recv() => {
            match request {
                Some(request) => {
                    let exit_code = shutdown_child(&mut child, pid, graceful_timeout).await;
                    *last_exit.lock().unwrap() = exit_code;
                    let _ = request.ack.send(());
                }
                None => {
                    // Supervisor dropped; do not leave an orphan behind.
                    let _ = child.start_kill();
                }
            }
        }
    }
}

async fn shutdown_child(child: &mut Child, pid: Option<u32>, graceful_timeout: Duration) -> Option<i32> {
    terminate(pid, child);
    match tokio::time::timeout(graceful_timeout, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            error!("failed waiting for child exit: {e}");
            None
        }
        Err(_) => {
            warn!("child ignored the termination signal, killing it");
            if let Err(e) = child.start_kill() {
                error!("failed to kill child: {e}");
            }
            child.wait().await.ok().and_then(|s| s.code())
        }
    }
}

#[cfg(unix)]
fn terminate(pid: Option<u32>, child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    match pid {
        Some(pid) => {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn terminate(_pid: Option<u32>, child: &mut Child) {
    let _ = child.start_kill();
}

/// Default starter: spawn the real child with piped stdio.
async fn spawn_child(spec: ChildSpec) -> anyhow::Result<SpawnedChild> {
    info!(command = %spec.command, args = ?spec.args, "spawning child process");

    let mut command = Command::new(&spec.command);
    command
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .envs(&spec.env)
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", spec.command))?;

    let stdin = child.stdin.take().ok_or_else(|| anyhow!("child stdin unavailable"))?;
    let stdout = child.stdout.take().ok_or_else(|| anyhow!("child stdout unavailable"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("child stderr unavailable"))?;

    Ok((
        Box::new(stdin),
        Box::new(BufReader::new(stdout)),
        Some(Box::new(BufReader::new(stderr))),
        Some(child),
    ))
}

async fn drain_stderr(stderr: MessageSource) {
    let mut lines = stderr.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "mcpguard::child", "{line}");
    }
}

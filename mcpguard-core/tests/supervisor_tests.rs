//! Lifecycle tests against real OS processes, plus the full
//! crash/auto-restart scenario with a stub server script.

use mcpguard_core::supervisor::SupervisorEvent;
use mcpguard_core::{ChildSpec, ChildState, Config, Proxy, ProxyError, RestartPolicy, Supervisor};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::broadcast;

fn policy(max_restarts: u32, restart_delay_ms: u64) -> RestartPolicy {
    RestartPolicy {
        max_restarts,
        restart_delay: Duration::from_millis(restart_delay_ms),
        auto_restart: true,
        graceful_timeout: Duration::from_millis(1000),
    }
}

/// Waits for the next crash event, skipping state-change events.
async fn wait_for_crash(events: &mut broadcast::Receiver<SupervisorEvent>) -> Option<i32> {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a crash event")
            .expect("supervisor event stream closed");
        if let SupervisorEvent::Crashed { exit_code } = event {
            return exit_code;
        }
    }
}

#[tokio::test]
async fn start_and_stop_are_clean_and_stop_is_idempotent() {
    let supervisor = Supervisor::new(ChildSpec::new("cat", vec![]), policy(3, 100));
    assert_eq!(supervisor.state(), ChildState::Stopped);

    let _io = supervisor.start().await.unwrap();
    assert_eq!(supervisor.state(), ChildState::Running);
    assert!(supervisor.pid().is_some());

    supervisor.stop().await;
    assert_eq!(supervisor.state(), ChildState::Stopped);
    assert!(supervisor.pid().is_none());

    // No-op on an already-stopped child.
    supervisor.stop().await;
    assert_eq!(supervisor.state(), ChildState::Stopped);
}

#[tokio::test]
async fn spawn_failure_is_reported_and_leaves_stopped() {
    let supervisor = Supervisor::new(
        ChildSpec::new("/nonexistent/mcpguard-test-binary", vec![]),
        policy(1, 10),
    );
    let error = match supervisor.start().await {
        Ok(_) => panic!("called `Result::unwrap_err()` on an `Ok` value"),
        Err(e) => e,
    };
    assert!(matches!(error, ProxyError::Spawn(_)));
    assert_eq!(supervisor.state(), ChildState::Stopped);
}

#[cfg(unix)]
#[tokio::test]
async fn out_of_band_kill_is_detected_as_a_crash() {
    let supervisor = Supervisor::new(ChildSpec::new("cat", vec![]), policy(3, 100));
    let mut events = supervisor.events();
    let _io = supervisor.start().await.unwrap();

    let pid = supervisor.pid().unwrap();
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    // Killed by a signal: no exit code.
    let exit_code = wait_for_crash(&mut events).await;
    assert_eq!(exit_code, None);
    assert_eq!(supervisor.state(), ChildState::Crashed);
}

#[tokio::test]
async fn restart_limit_boundary_yields_exactly_n_attempts() {
    // A child that exits immediately registers as a crash every generation.
    let supervisor = Supervisor::new(ChildSpec::new("true", vec![]), policy(2, 10));
    let mut events = supervisor.events();
    let _io = supervisor.start().await.unwrap();

    let mut successful_restarts = 0u32;
    let error = loop {
        wait_for_crash(&mut events).await;
        match supervisor.restart().await {
            Ok(_io) => successful_restarts += 1,
            Err(error) => break error,
        }
    };

    assert_eq!(successful_restarts, 2);
    assert!(matches!(error, ProxyError::RestartLimitExceeded(2)));
    assert_eq!(supervisor.state(), ChildState::Stopped);
}

#[cfg(unix)]
#[tokio::test]
async fn graceful_stop_escalates_to_kill() {
    let policy = RestartPolicy {
        graceful_timeout: Duration::from_millis(200),
        ..policy(1, 10)
    };
    let spec = ChildSpec::new(
        "sh",
        vec![
            "-c".to_string(),
            "trap '' TERM; while :; do sleep 0.1; done".to_string(),
        ],
    );
    let supervisor = Supervisor::new(spec, policy);
    let _io = supervisor.start().await.unwrap();

    // Give the shell a moment to install the trap.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    supervisor.stop().await;
    let elapsed = started.elapsed();

    assert_eq!(supervisor.state(), ChildState::Stopped);
    assert!(
        elapsed >= Duration::from_millis(150),
        "stop did not honor the grace period: {elapsed:?}"
    );
    assert!(elapsed < Duration::from_secs(3), "kill escalation hung: {elapsed:?}");
}

// ============================================================================
// Crash / auto-restart scenario
// ============================================================================

/// Answers the proxy's first child-connection request (always id 1, the
/// initialize the proxy forwards or originates) and then stays alive.
const STUB_SERVER: &str = r#"#!/bin/sh
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"stub","version":"0.0.0"}}}'
cat >/dev/null
"#;

async fn write_line(stream: &mut DuplexStream, value: &Value) {
    stream
        .write_all(value.to_string().as_bytes())
        .await
        .expect("failed to write to proxy");
    stream.write_all(b"\n").await.expect("failed to write newline");
    stream.flush().await.expect("failed to flush");
}

async fn read_line(reader: &mut BufReader<DuplexStream>) -> Value {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("timed out reading from proxy")
        .expect("failed to read from proxy");
    serde_json::from_str(line.trim()).expect("proxy wrote invalid JSON")
}

fn assert_subsequence(states: &[ChildState], expected: &[ChildState]) {
    let mut iter = states.iter();
    for want in expected {
        assert!(
            iter.any(|state| state == want),
            "missing {want:?} in observed sequence {states:?}"
        );
    }
}

#[cfg(unix)]
#[tokio::test]
async fn crash_auto_restart_keeps_the_client_session() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("stub-server.sh");
    std::fs::write(&script, STUB_SERVER).unwrap();
    let mut permissions = std::fs::metadata(&script).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&script, permissions).unwrap();

    let config = Config {
        restart_limit: 3,
        restart_delay: Duration::from_millis(100),
        auto_restart: true,
        request_timeout: Duration::from_millis(2000),
        graceful_timeout: Duration::from_millis(1000),
    };
    let spec = ChildSpec::new(script.to_str().unwrap(), vec![]);
    let supervisor = Arc::new(Supervisor::new(spec, RestartPolicy::from_config(&config)));
    let mut events = supervisor.events();

    let (proxy_out, client_in) = tokio::io::duplex(8192);
    let (client_out, proxy_in) = tokio::io::duplex(8192);
    let (proxy, client_rx) = Proxy::new(
        supervisor.clone(),
        config,
        Box::new(proxy_out),
        Box::new(BufReader::new(proxy_in)),
    );
    tokio::spawn(proxy.run(client_rx));

    let mut client_out = client_out;
    let mut client_in = BufReader::new(client_in);

    // Handshake through the proxy against the real stub process.
    write_line(
        &mut client_out,
        &json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": "0.0.0"}
            }
        }),
    )
    .await;
    let response = read_line(&mut client_in).await;
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["capabilities"]["tools"]["listChanged"], true);

    // Kill the child out-of-band.
    let pid = supervisor.pid().unwrap();
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    // Within the restart delay the proxy respawns the child, re-handshakes
    // it, and tells the client to re-query its listings.
    let notification = read_line(&mut client_in).await;
    assert_eq!(notification["method"], "notifications/tools/list_changed");
    assert_eq!(supervisor.restart_count(), 1);

    let mut watch = supervisor.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        watch.wait_for(|state| *state == ChildState::Running),
    )
    .await
    .expect("timed out waiting for the restarted child")
    .unwrap();

    // The lifecycle passed through the crash-recovery sequence.
    let mut observed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::StateChanged(state) = event {
            observed.push(state);
        }
    }
    assert_subsequence(
        &observed,
        &[
            ChildState::Running,
            ChildState::Crashed,
            ChildState::Starting,
            ChildState::Running,
        ],
    );
}

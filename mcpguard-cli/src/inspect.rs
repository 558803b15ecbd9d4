//! One-shot read-only inspection client.
//!
//! Spawns the child directly, performs the initialize handshake over the
//! same connection contract the proxy uses, issues a single read-only call,
//! prints the result and disconnects. No augmentation, no restart logic.

use anyhow::{bail, Result};
use clap::ValueEnum;
use mcpguard_core::connection::Connection;
use mcpguard_core::restart::default_initialize_params;
use mcpguard_core::{ChildSpec, RestartPolicy, Supervisor};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Query {
    /// The child's initialize result (server info and capabilities)
    Server,
    /// tools/list
    Tools,
    /// resources/list
    Resources,
    /// prompts/list
    Prompts,
}

pub async fn run(query: Query, spec: ChildSpec) -> Result<()> {
    let policy = RestartPolicy {
        auto_restart: false,
        ..RestartPolicy::default()
    };
    let supervisor = Arc::new(Supervisor::new(spec, policy));
    let (writer, reader) = supervisor.start().await?;

    let (connection, mut inbound) = Connection::attach(writer, reader, Duration::from_secs(10));
    // Unsolicited traffic from the child is irrelevant to a one-shot query.
    tokio::spawn(async move { while inbound.recv().await.is_some() {} });

    let init = connection
        .request("initialize", Some(default_initialize_params()))
        .await?;
    if let Some(error) = init.error {
        bail!("initialize failed: {} (code {})", error.message, error.code);
    }
    connection.notify("notifications/initialized", None)?;

    let result = match query {
        Query::Server => init.result.unwrap_or(Value::Null),
        Query::Tools => list(&connection, "tools/list").await?,
        Query::Resources => list(&connection, "resources/list").await?,
        Query::Prompts => list(&connection, "prompts/list").await?,
    };

    println!("{}", serde_json::to_string_pretty(&result)?);

    connection.detach();
    supervisor.stop().await;
    Ok(())
}

async fn list(connection: &Connection, method: &str) -> Result<Value> {
    let response = connection.request(method, None).await?;
    if let Some(error) = response.error {
        bail!("{method} failed: {} (code {})", error.message, error.code);
    }
    Ok(response.result.unwrap_or(Value::Null))
}

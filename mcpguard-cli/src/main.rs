use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use mcpguard_core::connection::{MessageSink, MessageSource};
use mcpguard_core::{ChildSpec, Config, Proxy, RestartPolicy, Supervisor};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::info;

mod inspect;

#[derive(Parser, Debug)]
#[command(name = "mcpguard")]
#[command(about = "Keep an MCP stdio server restartable without dropping the client session")]
struct Cli {
    /// Enable debug logging (stderr)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy in front of a child MCP server
    Run {
        /// Maximum number of restarts before giving up on the child
        #[arg(long)]
        restart_limit: Option<u32>,

        /// Delay in milliseconds between a crash and the automatic restart
        #[arg(long)]
        restart_delay_ms: Option<u64>,

        /// Deadline in milliseconds for every forwarded request
        #[arg(long)]
        request_timeout_ms: Option<u64>,

        /// Do not restart automatically after an unexpected child exit
        #[arg(long)]
        no_auto_restart: bool,

        /// Child command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true, value_name = "COMMAND")]
        child: Vec<String>,
    },
    /// One-shot read-only queries against a child server
    Inspect {
        /// What to query
        #[arg(value_enum)]
        what: inspect::Query,

        /// Child command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true, value_name = "COMMAND")]
        child: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging goes to stderr only: stdout carries the protocol.
    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            std::env::var("MCPGUARD_LOG").unwrap_or_else(|_| default_filter.to_string()),
        )
        .init();

    match cli.command {
        Command::Run {
            restart_limit,
            restart_delay_ms,
            request_timeout_ms,
            no_auto_restart,
            child,
        } => {
            let mut config = Config::from_env()?;
            if let Some(limit) = restart_limit {
                config.restart_limit = limit;
            }
            if let Some(delay) = restart_delay_ms {
                config.restart_delay = std::time::Duration::from_millis(delay);
            }
            if let Some(timeout) = request_timeout_ms {
                config.request_timeout = std::time::Duration::from_millis(timeout);
            }
            if no_auto_restart {
                config.auto_restart = false;
            }
            run_proxy(config, child_spec(child)?).await
        }
        Command::Inspect { what, child } => inspect::run(what, child_spec(child)?).await,
    }
}

fn child_spec(argv: Vec<String>) -> Result<ChildSpec> {
    let mut argv = argv.into_iter();
    let Some(command) = argv.next() else {
        bail!("no child command given");
    };
    Ok(ChildSpec::new(command, argv.collect()))
}

async fn run_proxy(config: Config, spec: ChildSpec) -> Result<()> {
    info!(command = %spec.command, "starting mcpguard");

    let supervisor = Arc::new(Supervisor::new(spec, RestartPolicy::from_config(&config)));
    let stdout: MessageSink = Box::new(tokio::io::stdout());
    let stdin: MessageSource = Box::new(BufReader::new(tokio::io::stdin()));

    let (proxy, client_rx) = Proxy::new(supervisor, config, stdout, stdin);
    proxy.run(client_rx).await?;
    Ok(())
}

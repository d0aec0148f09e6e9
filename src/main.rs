use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use skeleton_crew::{Config, Daemon, ErrorKind, GatewayClient};

/// Exit code for configuration errors
const EXIT_CONFIG: u8 = 2;

/// Exit code for fatal runtime errors (JACK unreachable on an audio hub)
const EXIT_FATAL: u8 = 3;

/// Exit code when interrupted before a clean shutdown
const EXIT_INTERRUPTED: u8 = 130;

/// Skeleton Crew - distributed control plane for JACK workstations
#[derive(Parser)]
#[command(name = "skeletond", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "SKELETON_CONFIG")]
    config: Option<PathBuf>,

    /// Override the node id
    #[arg(long, env = "SKELETON_NODE_ID")]
    node_id: Option<String>,

    /// Override the gateway port
    #[arg(long)]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Query a node's gateway for health and known peers
    Status {
        /// Gateway host
        #[arg(default_value = "127.0.0.1")]
        host: String,
        /// Gateway port
        #[arg(short, long, default_value = "8070")]
        port: u16,
    },
    /// Invoke a tool on a node's gateway
    Invoke {
        /// Tool name (e.g. jack_status, connect_jack_ports)
        tool: String,
        /// Tool arguments as JSON
        #[arg(default_value = "{}")]
        args: String,
        /// Gateway host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Gateway port
        #[arg(short, long, default_value = "8070")]
        port: u16,
        /// Caller identity recorded in the remote audit log
        #[arg(long, default_value = "cli")]
        caller: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,skeleton_crew=info",
        1 => "info,skeleton_crew=debug",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    if let Some(command) = cli.command {
        return match run_command(command).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("command failed: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Some(node_id) = cli.node_id {
        config.node.id = node_id;
    }
    if let Some(port) = cli.port {
        config.node.control_port = port;
    }

    tracing::info!(
        node_id = %config.node.id,
        host = %config.node.host,
        port = config.node.control_port,
        roles = ?config.node.roles,
        "starting skeleton crew daemon"
    );

    let daemon = match Daemon::new(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!("startup failed: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // A second interrupt during shutdown aborts immediately
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if interrupted.swap(true, Ordering::SeqCst) {
                    tracing::warn!("second interrupt, aborting");
                    std::process::exit(i32::from(EXIT_INTERRUPTED));
                }
            }
        });
    }

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.kind() == ErrorKind::JackUnavailable => {
            tracing::error!("fatal: {e}");
            ExitCode::from(EXIT_FATAL)
        }
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_command(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Status { host, port } => {
            let http = reqwest::Client::new();
            let health: serde_json::Value = http
                .get(format!("http://{host}:{port}/api/health"))
                .timeout(Duration::from_secs(3))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("node: {}", health["node_id"].as_str().unwrap_or("?"));

            let nodes: serde_json::Value = http
                .get(format!("http://{host}:{port}/api/nodes"))
                .timeout(Duration::from_secs(3))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            if let Some(list) = nodes.as_array() {
                println!("known nodes: {}", list.len());
                for node in list {
                    println!(
                        "  {} ({}) {} @ {}:{}",
                        node["id"].as_str().unwrap_or("?"),
                        node["status"].as_str().unwrap_or("?"),
                        node["name"].as_str().unwrap_or(""),
                        node["host"].as_str().unwrap_or("?"),
                        node["control_port"],
                    );
                }
            }
            Ok(())
        }
        Command::Invoke {
            tool,
            args,
            host,
            port,
            caller,
        } => {
            let args: serde_json::Value = serde_json::from_str(&args)
                .map_err(|e| anyhow::anyhow!("arguments must be JSON: {e}"))?;

            let client = GatewayClient::new(&caller);
            let response = client
                .invoke(&host, port, &tool, args, Duration::from_secs(5))
                .await?;

            if response.is_ok() {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&response.result.unwrap_or_default())?
                );
                Ok(())
            } else {
                anyhow::bail!(
                    "{}: {}",
                    response
                        .error_kind
                        .map_or("error".to_string(), |k| k.to_string()),
                    response.message.unwrap_or_default()
                )
            }
        }
    }
}

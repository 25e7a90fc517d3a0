#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # cmdrelay
//!
//! Channel broker that relays design-tool commands between automation
//! controllers and a plugin worker over WebSocket.
//!
//! ## Subcommands
//!
//! - `cmdrelay serve` (default) — run the broker; `--events` prints workflow
//!   trigger payloads as JSON lines on stdout
//! - `cmdrelay channels` — list channels on a running broker
//! - `cmdrelay create-channel <id> [--name <name>]`
//! - `cmdrelay send --channel <id> <command> [--params <json>]`
//! - `cmdrelay status [--channel <id>]` — is a worker connected?
//!
//! ## Endpoints
//!
//! | Method | Path      | Description                         |
//! |--------|-----------|-------------------------------------|
//! | GET    | `/`       | WebSocket upgrade                   |
//! | GET    | `/ws`     | WebSocket upgrade (alias)           |
//! | GET    | `/health` | Liveness probe with routing counters |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! protocol.rs      — typed wire frames
//! registry.rs      — connections and registered identities
//! channels.rs      — channel table
//! ledger.rs        — pending commands with timeouts
//! events.rs        — lifecycle events, workflow-trigger payloads
//! broker/
//!   mod.rs         — frame dispatch and command routing
//!   ws.rs          — axum router, per-socket loop
//! client/
//!   mod.rs         — CommandRelay trait
//!   embedded.rs    — in-process relay
//!   remote.rs      — WebSocket relay with reconnect
//! ```

use std::error::Error;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cmdrelay::broker::{self, Broker};
use cmdrelay::config::{Config, EventsConfig};
use cmdrelay::{ClientPurpose, CommandRelay, RemoteRelay, TriggerFeed};

type BoxError = Box<dyn Error + Send + Sync>;

/// Channel broker for design-tool command relay.
#[derive(Parser)]
#[command(name = "cmdrelay", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker (default when no subcommand given).
    Serve {
        /// Print workflow-trigger events as JSON lines on stdout.
        #[arg(long)]
        events: bool,
    },
    /// List channels on a running broker.
    Channels,
    /// Create a channel on a running broker.
    CreateChannel {
        id: String,
        /// Display name (defaults to the id).
        #[arg(long)]
        name: Option<String>,
    },
    /// Send one command through a channel and print its result.
    Send {
        #[arg(long)]
        channel: String,
        command: String,
        /// Command parameters as a JSON value.
        #[arg(long)]
        params: Option<String>,
    },
    /// Report whether a worker is connected.
    Status {
        /// Check this channel only.
        #[arg(long)]
        channel: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("cmdrelay: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing; stdout is reserved for command output and events.
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command.unwrap_or(Commands::Serve { events: false }) {
        Commands::Serve { events } => run_server(config, events).await,
        Commands::Channels => list_channels(&config).await,
        Commands::CreateChannel { id, name } => create_channel(&config, &id, name.as_deref()).await,
        Commands::Send {
            channel,
            command,
            params,
        } => send_command(&config, &channel, &command, params.as_deref()).await,
        Commands::Status { channel } => status(&config, channel.as_deref()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config, events: bool) -> Result<(), BoxError> {
    let addr = config.server.listen_addr()?;

    info!("cmdrelay v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Command timeout: {}ms",
        config.server.command_timeout_ms
    );

    let broker = Broker::from_config(&config.server);
    let feed_task = events.then(|| spawn_trigger_feed(&broker, &config.events));

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on ws://{addr}");

    broker::ws::serve(listener, broker, shutdown_signal()).await?;

    info!("Shutting down...");
    if let Some(task) = feed_task {
        task.abort();
    }
    Ok(())
}

/// Print one JSON line per enabled broker event.
fn spawn_trigger_feed(broker: &Broker, config: &EventsConfig) -> JoinHandle<()> {
    let feed = TriggerFeed::new(config.server_id.clone(), config.enabled.iter().copied());
    info!(server_id = feed.server_id(), "Workflow trigger feed enabled");
    let mut rx = broker.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(payload) = feed.payload(&event) {
                        println!("{payload}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Trigger feed lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

async fn list_channels(config: &Config) -> Result<(), BoxError> {
    let relay = RemoteRelay::new(config.client.clone());
    let channels = relay.get_channels().await?;
    println!("{}", serde_json::to_string_pretty(&channels)?);
    Ok(())
}

async fn create_channel(config: &Config, id: &str, name: Option<&str>) -> Result<(), BoxError> {
    let relay = RemoteRelay::new(config.client.clone());
    relay.create_channel(id, name).await?;
    println!("{}", json!({"channelId": id, "channelName": name.unwrap_or(id)}));
    Ok(())
}

async fn send_command(
    config: &Config,
    channel: &str,
    command: &str,
    params: Option<&str>,
) -> Result<(), BoxError> {
    let params: Value = match params {
        Some(p) => serde_json::from_str(p).map_err(|e| format!("--params is not valid JSON: {e}"))?,
        None => json!({}),
    };

    let relay = RemoteRelay::new(config.client.clone());
    relay.connect(ClientPurpose::Command, Some(channel)).await?;
    let result = relay.send_command(command, params).await;
    relay.disconnect().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn status(config: &Config, channel: Option<&str>) -> Result<(), BoxError> {
    let relay = RemoteRelay::new(config.client.clone());
    if let Some(channel) = channel {
        relay.connect(ClientPurpose::Command, Some(channel)).await?;
    }
    let connected = relay.is_worker_connected().await;
    relay.disconnect().await;

    println!("{}", json!({"channelId": channel, "connected": connected?}));
    Ok(())
}

//! # Pedal Hub Daemon
//!
//! Boots the coordination engine against a SQLite file and a radio helper
//! speaking JSON lines on stdio.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  CLI args ──► tracing (stderr) ──► HubConfig (TOML + env)              │
//! │                                        │                                │
//! │                                        ▼                                │
//! │                              SQLite + migrations                        │
//! │                                        │                                │
//! │           ┌────────────────────────────┼──────────────────────┐         │
//! │           ▼                            ▼                      ▼         │
//! │     stdin reader               Orchestrator::run        stdout writer  │
//! │  (EventBridge, HubHandle)                               (StdioLink)    │
//! │                                        │                                │
//! │                    Ctrl-C / SIGTERM ──►│ shutdown                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod bridge;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pedal_db::{Database, DbConfig};
use pedal_hub::{EventBridge, HttpCloudClient, HubConfig, Orchestrator};

use crate::bridge::StdioLink;

#[derive(Debug, Parser)]
#[command(name = "pedal-hubd", version, about = "Pedal hub coordination daemon")]
struct Args {
    /// Hub config file (TOML). Defaults to the platform config directory.
    #[arg(long, env = "PEDAL_HUB_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file. Overrides `hub.database_path`.
    #[arg(long)]
    database: Option<PathBuf>,

    /// tracing filter directive for stderr logs.
    #[arg(long, env = "RUST_LOG", default_value = "info,pedal_hub=debug,pedal_db=debug,sqlx=warn")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter).context("invalid log filter")?)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting pedal hub daemon");

    let config_path = args.config.clone().or_else(HubConfig::default_config_path);
    let config = HubConfig::load_or_default(config_path.clone());

    let db_path = args
        .database
        .clone()
        .or_else(|| config.database_path())
        .context("no database path configured")?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = Database::new(DbConfig::new(&db_path))
        .await
        .with_context(|| format!("opening database {}", db_path.display()))?;
    info!(path = %db_path.display(), "Database ready");

    let cloud = HttpCloudClient::new(&config.cloud, config.hub_id())?;

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(bridge::write_stdout(out_rx));
    let link = Arc::new(StdioLink::new(out_tx.clone()));
    let (events, event_rx) = EventBridge::channel(config.session.event_channel_capacity);

    let mut hub = Orchestrator::boot(config, config_path, &db, Box::new(cloud), link).await?;
    let (handle, commands) = hub.handle();

    let reader = tokio::spawn(bridge::read_stdin(events, handle.clone(), out_tx));

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        if signal_handle.shutdown().await.is_err() {
            warn!("Hub already stopped when signal arrived");
        }
    });

    hub.run(event_rx, commands).await;

    reader.abort();
    drop(hub);
    if writer.await.is_err() {
        warn!("Stdout writer task failed");
    }
    db.close().await;

    info!("Hub daemon stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

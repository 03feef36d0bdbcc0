//! appgate core daemon
//!
//! Listens on a Unix domain socket for app connections, brokers their access
//! to the platform and supervises the configured worker processes.

use anyhow::{Context, Result};
use appgated::config::{load_config, resolve_config_path};
use appgated::connection::serve;
use appgated::gateway::{seed_store, Gateway};
use appgated::store::app_data::SqliteAppData;
use appgated::store::SqliteStore;
use appgated::supervisor::{spawn_monitor, WorkerSupervisor, MONITOR_INTERVAL};
use appgated::sweeper::spawn_lease_sweeper;
use appgated::DAEMON_VERSION;
use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_SECRET: &str = "change-me-in-production";
const DEFAULT_DATA_DIR: &str = "./appgate-data";

#[derive(Parser, Debug)]
#[command(name = "appgated", version)]
#[command(about = "appgate core daemon")]
struct Cli {
    /// Unix socket path apps connect to
    #[arg(long, default_value = appgate_protocol::DEFAULT_SOCK)]
    socket: PathBuf,

    /// Path to appgate.toml (or use APPGATE_CONFIG env var)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Core signing secret (or use APPGATE_SECRET env var)
    #[arg(long)]
    secret: Option<String>,

    /// Directory for the core database and per-app databases (or APPGATE_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let secret = cli
        .secret
        .or_else(|| std::env::var("APPGATE_SECRET").ok())
        .unwrap_or_else(|| DEFAULT_SECRET.to_string());
    if secret == DEFAULT_SECRET {
        warn!("Using default secret - change APPGATE_SECRET in production!");
    }

    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var_os("APPGATE_DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

    info!(
        "appgated version {} ({})",
        DAEMON_VERSION,
        appgate_build_info::build_id()
    );
    let config_path = resolve_config_path(cli.config);
    let config = load_config(config_path.as_deref())?;

    let store = Arc::new(
        SqliteStore::open(&data_dir.join("appgate.sqlite")).context("Failed to open core store")?,
    );
    seed_store(&store, &config).await?;
    let app_data = Arc::new(
        SqliteAppData::new(data_dir.join("app-data")).context("Failed to open app data dir")?,
    );
    let gateway = Arc::new(Gateway::new(store, app_data, &config, &secret));

    if let Some(ttl) = config.tasks.lease_ttl() {
        info!("Task leases expire after {}s", ttl.as_secs());
        spawn_lease_sweeper(
            gateway.router().leases().clone(),
            ttl,
            config.tasks.sweep_interval(),
        );
    }

    let _ = std::fs::remove_file(&cli.socket);
    let listener = UnixListener::bind(&cli.socket)
        .with_context(|| format!("Failed to bind {}", cli.socket.display()))?;
    info!("appgate daemon listening on {}", cli.socket.display());

    let supervisor = Arc::new(WorkerSupervisor::new(&cli.socket));
    for spec in config.workers.iter().cloned() {
        let id = spec.id.clone();
        if let Err(err) = supervisor.spawn(spec).await {
            error!("Worker {} failed to start: {}", id, err);
        }
    }
    spawn_monitor(supervisor.clone(), MONITOR_INTERVAL);

    tokio::select! {
        result = serve(listener, gateway) => {
            if let Err(err) = result {
                error!("Listener failed: {}", err);
            }
        }
        _ = shutdown_signal() => {}
    }

    supervisor.terminate_all().await;
    let _ = std::fs::remove_file(&cli.socket);
    info!("appgate daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!("Failed to install SIGTERM handler: {}", err);
            if signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C; shutting down daemon");
            }
            return;
        }
    };
    tokio::select! {
        _ = signal::ctrl_c() => info!("Received Ctrl+C; shutting down daemon"),
        _ = sigterm.recv() => info!("Received SIGTERM; shutting down daemon"),
    }
}

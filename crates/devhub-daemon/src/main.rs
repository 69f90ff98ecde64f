//! Devhub Daemon - Main entry point
//!
//! Loads the configured plugins, ticks their synchronous devices and serves
//! a read-only status API until interrupted.

mod api;
mod config;
mod plugins;
mod server;
mod state;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "devhub")]
#[command(about = "Device hosting daemon for synchronous and asynchronous plugin devices")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "devhub.toml")]
    config: PathBuf,

    /// Bind address for the status API
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run this many host ticks, then shut down
    #[arg(long)]
    ticks: Option<u64>,

    /// Write the example configuration to --config and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Devhub v{}", env!("CARGO_PKG_VERSION"));

    if args.init_config {
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Wrote example configuration");
        return Ok(());
    }

    let mut config = config::load_config(&args.config)?;
    if let Some(bind) = args.bind {
        config.api.bind = bind;
    }

    info!(
        plugins = config.plugins.len(),
        tick_ms = config.host.tick_interval_ms,
        api = config.api.enabled,
        "Configuration loaded"
    );

    let state = state::HostState::new(config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(state::run_message_log(state.connection.clone()));

    let api = if state.config.api.enabled {
        let api_state = state.clone();
        let bind = state.config.api.bind.clone();
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server::run(api_state, &bind, rx).await {
                error!(error = %e, "Status API failed");
            }
        }))
    } else {
        None
    };

    let ticker = tokio::spawn(state::run_tick_loop(state.clone(), shutdown_rx, args.ticks));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupt received, shutting down");
        }
        // Only returns on its own when --ticks is reached
        result = ticker => {
            result??;
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(api) = api {
        let _ = api.await;
    }

    // Joins every asynchronous wait loop
    let stats = state.stats();
    tokio::task::spawn_blocking(move || state.shutdown()).await?;
    info!(
        ticks = stats.ticks,
        messages = stats.messages_sent,
        "Shutdown complete"
    );

    Ok(())
}

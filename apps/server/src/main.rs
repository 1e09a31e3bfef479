//! Prism Cast Server - headless live ABR media server.
//!
//! Serves the channels described in a YAML configuration over WebSocket.
//! The bound port is `ws_base_port + server_id`, letting a launcher run
//! one process per port without per-process config files.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use prismcast_core::{MediaServer, ServerConfig};
use tokio::signal;

/// Prism Cast Server - live ABR media streaming over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "prismcast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    config: PathBuf,

    /// Server index; the bound port is ws_base_port + server_id.
    server_id: u16,

    /// Experiment identifier, recorded in logs.
    expt_id: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "PRISMCAST_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

// Current-thread flavor: the whole server is one cooperative event loop.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!(
        "Prism Cast Server v{} (server_id={}, expt_id={})",
        env!("CARGO_PKG_VERSION"),
        args.server_id,
        args.expt_id.as_deref().unwrap_or("-")
    );

    let config = ServerConfig::load(&args.config).context("Failed to load configuration")?;
    let port = config
        .ws_base_port
        .checked_add(args.server_id)
        .context("ws_base_port + server_id overflows a port number")?;

    let server = MediaServer::new(config).context("Failed to start channels")?;
    let shutdown = server.shutdown_token();

    let _ = tokio::spawn(async move {
        shutdown_signal().await;
        log::info!("shutdown signal received, draining connections...");
        shutdown.cancel();
    });

    server
        .run(port)
        .await
        .context("Server terminated with an error")?;

    log::info!("shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

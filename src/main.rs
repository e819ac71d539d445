//! ==============================================================================
//! main.rs - greenhouse station entry point
//! ==============================================================================
//!
//! purpose:
//!     reads sensor controllers over serial lines, keeps a short history per
//!     controller and streams every reading live to websocket clients.
//!
//! responsibilities:
//!     - parse the command line and load station.toml
//!     - set up logging
//!     - spawn the history store and the broadcast hub
//!     - create and start one device per enabled source
//!     - serve the http api until ctrl-c, then stop the devices
//!
//! architecture:
//!
//!     ┌──────────────┐  readings   ┌───────────────┐
//!     │ device       │────────────▶│ history store │◀──── GET /values, /room
//!     │ (read loop,  │             └───────────────┘
//!     │  one thread) │  readings   ┌───────────────┐  payloads  ┌────────────┐
//!     │              │────────────▶│ broadcast hub │───────────▶│ pump (per  │──▶ websocket
//!     └──────▲───────┘             └───────────────┘            │  client)   │
//!            │ C:<idx><+|->[dur]                                └────────────┘
//!     POST /effectors
//!
//! ==============================================================================

mod api;
mod config;
mod device;
mod domain;
mod error;
mod history;
mod hub;
mod link;
mod protocol;
mod pump;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::StationConfig;
use crate::device::{Device, DeviceDirectory};
use crate::link::SerialConnector;

/// Serial sensor station with a live websocket feed
#[derive(Parser, Debug)]
#[command(name = "station")]
#[command(version)]
struct Args {
    /// Path to station.toml (default: config/station.toml, then ../config/station.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP port, overrides server.port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error), overrides logging.level
    #[arg(long)]
    log_level: Option<String>,
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // step 1: load configuration (logging depends on it)
    let mut loaded = StationConfig::load_or_default(args.config.as_deref())?;
    if let Some(port) = args.port {
        loaded.config.server.port = port;
    }
    let config = loaded.config.clone();

    // step 2: logging, RUST_LOG wins over the cli which wins over the file
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "station starting");
    loaded.log();

    // step 3: the two shared consumers
    let (history, history_task) = history::spawn(config.history.window, config.history.queue_capacity);
    let (hub, hub_task) = hub::spawn(config.history.queue_capacity);

    // step 4: devices
    let mut directory = DeviceDirectory::new();
    for source in config.enabled_sources() {
        let device = Arc::new(Device::new(&source.name));
        device.add_listener("history", history.listener());
        device.add_listener("hub", hub.listener());

        // a controller that isn't plugged in shouldn't keep the others down;
        // the error stays visible through /api/sources
        if let Err(e) = device.start(&SerialConnector, &source.link()) {
            tracing::error!(device = %source.name, error = %e, "unable to start device");
        }
        directory.add(device);
    }
    let directory = Arc::new(directory);

    // step 5: serve until ctrl-c
    let state = api::ApiState {
        sources: Arc::new(config.sources.clone()),
        devices: Arc::clone(&directory),
        history,
        hub,
        window: config.history.window,
    };
    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "api listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    // step 6: stop the read loops; stop() blocks until each loop has exited
    tracing::info!("shutting down");
    let stopping = Arc::clone(&directory);
    tokio::task::spawn_blocking(move || {
        for device in stopping.iter().filter(|d| d.is_running()) {
            if let Err(e) = device.stop() {
                tracing::warn!(device = %device.name(), error = %e, "stop failed");
            }
        }
    })
    .await
    .context("device shutdown panicked")?;

    history_task.abort();
    hub_task.abort();

    tracing::info!("station stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "unable to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

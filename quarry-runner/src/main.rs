//! Quarry Runner
//!
//! Pulls compute jobs from message queue subscriptions and hands each one to a
//! command.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Backend: One `TaskQueue` selected by queue type
//! - Services: The command handler run for every message
//! - Scheduler: Subscription discovery and one worker per subscription
//!
//! SIGINT or SIGTERM stops intake everywhere; messages already being handled
//! are interrupted and returned to their queue.

mod config;
mod scheduler;
mod service;

use anyhow::{Context, Result};
use quarry_core::MessageHandler;
use quarry_devices::DeviceReporter;
use quarry_queue::open_queue;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::scheduler::QueueWatcher;
use crate::service::CommandHandler;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quarry_runner=info,quarry_queue=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Quarry Runner");

    let config = load_config()?;
    info!(
        runner_id = %config.runner_id,
        queue_type = %config.queue_type,
        project = %config.project,
        "Loaded configuration"
    );

    let devices = DeviceReporter::global();
    if devices.is_available() {
        info!("Device telemetry available");
    }

    let queue = open_queue(
        config.queue_type,
        &config.queue_desc(),
        &config.backend_options(),
    )
    .context("Failed to open queue backend")?;

    let handler: Arc<dyn MessageHandler> = Arc::new(
        CommandHandler::new(&config.handler_cmd, config.runner_id.clone())
            .context("Invalid handler command")?,
    );

    let watcher = QueueWatcher::new(config, queue, handler, devices)?;

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    watcher.run(shutdown).await;
    info!("Runner stopped");
    Ok(())
}

/// Loads and validates configuration from environment variables
fn load_config() -> Result<Config> {
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;
    Ok(config)
}

/// Cancels `shutdown` on SIGINT or SIGTERM
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let interrupt = tokio::signal::ctrl_c();

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
            result = interrupt => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for SIGINT");
                    return;
                }
                info!("Received SIGINT, shutting down");
            }
            _ = terminate => info!("Received SIGTERM, shutting down"),
        }
        shutdown.cancel();
    });
}

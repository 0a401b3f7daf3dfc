//! Triage Discovery - scans the mailbox for unread mail.
//!
//! This binary:
//! 1. Lists unread messages every `DISCOVERY_INTERVAL_SECS`
//! 2. Fetches each message's snippet and sender
//! 3. Publishes one job per message to the email-processing queue
//!
//! Scans are serialized; a slow scan delays the next one instead of
//! overlapping with it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::{signal, sync::watch};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use triage::mailbox::GmailGateway;
use triage::{AmqpQueue, Config, Discovery};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("discovery_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        interval_secs = config.discovery_interval_secs,
        gmail_user_id = %config.gmail_user_id,
        "config_loaded"
    );

    let client = Client::builder()
        .timeout(config.request_timeout())
        .build()
        .context("Failed to create HTTP client")?;

    let mailbox = GmailGateway::new(
        client,
        config.gmail_api_base.clone(),
        config.mailbox_session(),
    );
    let queue = AmqpQueue::new(config.amqp_url.clone(), 1, config.redelivery_policy());

    let discovery = Arc::new(Discovery::new(Arc::new(mailbox), Arc::new(queue.clone())));
    let interval = Duration::from_secs(config.discovery_interval_secs.max(1));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scanner = {
        let discovery = Arc::clone(&discovery);
        tokio::spawn(async move { discovery.run(interval, shutdown_rx).await })
    };

    info!("discovery_ready");

    shutdown_signal().await;
    info!("discovery_stopping");

    let _ = shutdown_tx.send(true);
    scanner.await.context("Discovery task failed")?;
    queue.close().await;

    info!("discovery_shutdown_complete");
    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
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
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

//! Triage Worker - processes email jobs from the email-processing queue.
//!
//! Each job is classified, answered with a category-specific reply and, for
//! discovered mail, labeled and marked read. A completion reporter logs the
//! terminal state of every job from the queue's event stream.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use reqwest::Client;
use tokio::{signal, sync::watch};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use triage::inference::{HuggingFaceClassifier, HuggingFaceGenerator};
use triage::mailbox::GmailGateway;
use triage::worker;
use triage::{
    spawn_reporter, AmqpQueue, Classifier, CompletionLog, Config, EmailProcessor, JobQueue,
    MailboxGateway, Responder,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        amqp_url_set = !config.amqp_url.is_empty(),
        concurrency = config.worker_concurrency,
        max_attempts = config.job_max_attempts,
        backoff_ms = config.job_backoff_ms,
        classification_model = %config.hf_classification_model,
        generation_model = %config.hf_generation_model,
        "config_loaded"
    );

    // Create a shared HTTP client for all providers
    let client = Client::builder()
        .timeout(config.request_timeout())
        .build()
        .context("Failed to create HTTP client")?;

    let mailbox: Arc<dyn MailboxGateway> = Arc::new(GmailGateway::new(
        client.clone(),
        config.gmail_api_base.clone(),
        config.mailbox_session(),
    ));

    let classifier = HuggingFaceClassifier::new(
        client.clone(),
        &config.hf_api_base,
        &config.hf_classification_model,
        config.hf_api_token.clone(),
    )
    .context("Failed to configure classifier")?;

    let generator = HuggingFaceGenerator::new(
        client,
        &config.hf_api_base,
        &config.hf_generation_model,
        config.hf_api_token.clone(),
    )
    .context("Failed to configure generator")?;

    let processor = Arc::new(EmailProcessor::new(
        Classifier::new(Arc::new(classifier)),
        Responder::new(Arc::new(generator)),
        mailbox,
        config.reply_subject.clone(),
    ));

    let amqp = AmqpQueue::new(
        config.amqp_url.clone(),
        config.worker_concurrency.min(u16::MAX as usize) as u16,
        config.redelivery_policy(),
    );
    let queue: Arc<dyn JobQueue> = Arc::new(amqp.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Completion reporting runs beside the pool and never touches job state
    let subscription = queue
        .subscribe()
        .await
        .context("Failed to subscribe to job events")?;
    let reporter = spawn_reporter(subscription, CompletionLog::new(), shutdown_rx.clone());

    let mut pool = tokio::spawn(worker::run(
        queue,
        processor,
        config.worker_concurrency,
        shutdown_rx,
    ));

    info!("worker_ready");

    // The pool only returns early if every loop stopped on its own; exit so
    // the supervisor restarts the process instead of leaving it idle.
    tokio::select! {
        _ = shutdown_signal() => info!("worker_stopping"),
        result = &mut pool => {
            error!("worker_pool_exited");
            let _ = shutdown_tx.send(true);
            let _ = reporter.await;
            amqp.close().await;
            result.context("Worker pool task failed")?;
            bail!("worker pool exited before shutdown was requested");
        }
    }

    // In-flight jobs finish before the pool exits
    let _ = shutdown_tx.send(true);
    pool.await.context("Worker pool task failed")?;
    reporter.await.context("Completion reporter task failed")?;

    amqp.close().await;

    info!("worker_shutdown_complete");
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

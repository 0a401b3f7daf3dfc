//! Processing worker pool.
//!
//! Runs `concurrency` independent loops against one queue. Each loop claims a
//! job, processes it to completion or failure, reports the result to the
//! queue, and only then claims the next one. Shutdown is observed between
//! jobs; a claimed job is never abandoned halfway.

pub mod processor;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::queue::{ClaimedJob, Disposition, JobQueue};

pub use processor::{EmailProcessor, ProcessFailure, ProcessOutcome, Stage};

/// Pause before claiming again after the queue reported an error.
const CLAIM_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Run the worker pool until shutdown is signaled or the queue closes.
pub async fn run(
    queue: Arc<dyn JobQueue>,
    processor: Arc<EmailProcessor>,
    concurrency: usize,
    shutdown: watch::Receiver<bool>,
) {
    let mut loops = JoinSet::new();

    for worker_id in 0..concurrency.max(1) {
        let queue = Arc::clone(&queue);
        let processor = Arc::clone(&processor);
        let shutdown = shutdown.clone();
        loops.spawn(worker_loop(worker_id, queue, processor, shutdown));
    }

    info!(concurrency = concurrency.max(1), "worker_pool_started");

    while let Some(result) = loops.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "worker_loop_panicked");
        }
    }

    info!("worker_pool_stopped");
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn JobQueue>,
    processor: Arc<EmailProcessor>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = tokio::select! {
            _ = shutdown.changed() => break,
            claimed = queue.claim() => claimed,
        };

        match claimed {
            Ok(Some(claim)) => handle(worker_id, queue.as_ref(), &processor, claim).await,
            Ok(None) => {
                info!(worker_id = worker_id, "worker_queue_closed");
                break;
            }
            Err(e) => {
                warn!(worker_id = worker_id, error = %e, "worker_claim_failed");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(CLAIM_RETRY_DELAY) => {}
                }
            }
        }
    }

    info!(worker_id = worker_id, "worker_loop_stopped");
}

/// Process one claimed job and report the outcome to the queue.
async fn handle(
    worker_id: usize,
    queue: &dyn JobQueue,
    processor: &EmailProcessor,
    claim: ClaimedJob,
) {
    let job_id = claim.job.id.clone();

    match processor.process(&claim.job).await {
        Ok(outcome) => {
            if let Err(e) = queue.complete(claim).await {
                error!(job_id = %job_id, error = %e, "worker_complete_failed");
                return;
            }
            info!(
                worker_id = worker_id,
                job_id = %job_id,
                category = %outcome.category,
                labeled = outcome.labeled,
                "job_completed"
            );
        }
        Err(failure) => match queue.fail(claim, failure.to_string()).await {
            Ok(Disposition::Redelivered { attempt, delay }) => info!(
                worker_id = worker_id,
                job_id = %job_id,
                stage = %failure.stage,
                next_attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "job_failed_will_retry"
            ),
            Ok(Disposition::Failed) => warn!(
                worker_id = worker_id,
                job_id = %job_id,
                stage = %failure.stage,
                reason = %failure,
                "job_failed"
            ),
            Err(e) => error!(job_id = %job_id, error = %e, "worker_fail_report_failed"),
        },
    }
}

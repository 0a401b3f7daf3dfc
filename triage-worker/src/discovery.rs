//! Discovery producer: turns unread messages into jobs.
//!
//! Each scan lists the messages unread at that moment and enqueues one job per
//! message. A message stays unread until its job labels it, so a message whose
//! job is still pending is enqueued again on the next scan. That duplication
//! is part of the at-least-once model and is deliberately not filtered here.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::mailbox::{MailboxGateway, MessageRef};
use crate::queue::{JobId, JobPayload, JobQueue, PROCESS_EMAIL};

/// Counts from one discovery scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub discovered: usize,
    pub enqueued: usize,
    pub failed: usize,
}

/// Lists unread mail and enqueues processing jobs.
pub struct Discovery {
    mailbox: Arc<dyn MailboxGateway>,
    queue: Arc<dyn JobQueue>,
}

impl Discovery {
    pub fn new(mailbox: Arc<dyn MailboxGateway>, queue: Arc<dyn JobQueue>) -> Self {
        Self { mailbox, queue }
    }

    /// Run one scan.
    ///
    /// Only a failure to list unread messages fails the scan; per-message
    /// fetch or enqueue failures are logged, counted and skipped. Skipped
    /// messages are still unread and get picked up by a later scan.
    pub async fn scan_once(&self) -> Result<ScanReport, PipelineError> {
        let unread = self
            .mailbox
            .list_unread()
            .await
            .map_err(PipelineError::GatewayFetch)?;

        let mut report = ScanReport {
            discovered: unread.len(),
            ..Default::default()
        };

        for message_id in &unread {
            match self.enqueue_message(message_id).await {
                Ok(job_id) => {
                    report.enqueued += 1;
                    info!(message_id = %message_id, job_id = %job_id, "discovery_job_enqueued");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        message_id = %message_id,
                        error_kind = e.kind(),
                        error = %e,
                        "discovery_message_skipped"
                    );
                }
            }
        }

        info!(
            discovered = report.discovered,
            enqueued = report.enqueued,
            failed = report.failed,
            "discovery_scan_complete"
        );

        Ok(report)
    }

    async fn enqueue_message(&self, message_id: &MessageRef) -> Result<JobId, PipelineError> {
        let message = self
            .mailbox
            .get(message_id)
            .await
            .map_err(PipelineError::GatewayFetch)?;

        let payload = JobPayload::discovered(message.content, message.sender, message_id.clone());
        Ok(self.queue.enqueue(PROCESS_EMAIL, payload).await?)
    }

    /// Scan every `interval` until shutdown is signaled.
    ///
    /// Scans never overlap: a scan that outlasts the interval delays the next
    /// tick instead of running concurrently with it.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = interval.as_secs(), "discovery_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.scan_once().await {
                error!(error_kind = e.kind(), error = %e, "discovery_scan_failed");
            }
        }

        info!("discovery_stopped");
    }
}

//! Job queue abstraction and its backends.
//!
//! This module provides:
//! - Job and event types for the `email-processing` queue
//! - The [`JobQueue`] trait the producers and the worker talk to
//! - A RabbitMQ backend for deployments and an in-process memory backend
//!
//! ## Architecture
//!
//! ```text
//! Discovery / Web → email-processing queue → Worker
//!                                              ↓
//!                   Reporter ← email-processing.events
//! ```
//!
//! Delivery is at-least-once: a job may be handed out again after a worker
//! failure or crash, so a reply can be sent twice for the same message. No
//! backend deduplicates jobs.

pub mod amqp;
pub mod memory;
pub mod types;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::QueueError;

pub use amqp::AmqpQueue;
pub use memory::MemoryQueue;
pub use types::{
    Job, JobEvent, JobId, JobPayload, JobStatus, EVENTS_EXCHANGE, JOB_QUEUE, PROCESS_EMAIL,
};

/// A durable channel of jobs with completion signaling.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Store a new job and return its id. Never waits for processing.
    async fn enqueue(&self, kind: &str, payload: JobPayload) -> Result<JobId, QueueError>;

    /// Wait for the next job. Returns `None` once the queue is closed.
    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError>;

    /// Record success for a claimed job and acknowledge it.
    async fn complete(&self, claim: ClaimedJob) -> Result<(), QueueError>;

    /// Record a failure; the job is redelivered while attempts remain.
    async fn fail(&self, claim: ClaimedJob, reason: String) -> Result<Disposition, QueueError>;

    /// Subscribe to terminal job events.
    async fn subscribe(&self) -> Result<Subscription, QueueError>;
}

/// What the queue did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Scheduled for another attempt after `delay`
    Redelivered { attempt: u32, delay: Duration },
    /// Attempts exhausted, job recorded as failed
    Failed,
}

/// A job handed to exactly one worker until it is completed or failed.
#[derive(Debug)]
pub struct ClaimedJob {
    pub job: Job,
    pub(crate) receipt: Receipt,
}

/// Backend-specific acknowledgement handle.
pub(crate) enum Receipt {
    Memory,
    Amqp(lapin::acker::Acker),
}

impl fmt::Debug for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Receipt::Memory => f.write_str("Memory"),
            Receipt::Amqp(_) => f.write_str("Amqp"),
        }
    }
}

/// Redelivery settings for failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Total deliveries allowed per job, including the first
    pub max_attempts: u32,
    /// Base delay before the second attempt; doubles per attempt
    pub backoff: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

impl RedeliveryPolicy {
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before redelivering a job that failed on `attempt`.
    ///
    /// Exponential in the attempt number with up to 10% random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        let base = self.backoff.saturating_mul(1u32 << exponent);
        let jitter_ms = (base.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        base + Duration::from_millis(jitter)
    }
}

/// Cancellable stream of job events.
///
/// Events are delivered at-least-once. Dropping the subscription cancels it.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<JobEvent>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(events: mpsc::UnboundedReceiver<JobEvent>, task: JoinHandle<()>) -> Self {
        Self { events, task }
    }

    /// Next event, or `None` when the stream ended.
    pub async fn next(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    /// Stop receiving events.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

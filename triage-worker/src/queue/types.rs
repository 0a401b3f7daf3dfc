//! Job and event types carried by the `email-processing` queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue name for email processing jobs.
pub const JOB_QUEUE: &str = "email-processing";

/// Fanout exchange carrying completion and failure events.
pub const EVENTS_EXCHANGE: &str = "email-processing.events";

/// The only job kind the pipeline produces.
pub const PROCESS_EMAIL: &str = "process-email";

/// Opaque job identifier assigned by the queue on enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Work description for one email.
///
/// `source_message_id` is only set for jobs produced by discovery; direct
/// submissions have no provider message to relabel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Message body or snippet to classify and answer
    pub content: String,
    /// Reply-to address
    pub recipient: String,
    /// Provider message id of the source email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_message_id: Option<String>,
}

impl JobPayload {
    /// Payload for a message found by the discovery producer.
    pub fn discovered(content: String, recipient: String, message_id: String) -> Self {
        Self {
            content,
            recipient,
            source_message_id: Some(message_id),
        }
    }

    /// Payload for a direct submission.
    pub fn submitted(content: String, recipient: String) -> Self {
        Self {
            content,
            recipient,
            source_message_id: None,
        }
    }
}

/// A job as stored on the queue.
///
/// The payload is never modified after enqueue; redelivery only bumps
/// `attempt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: String,
    pub payload: JobPayload,
    /// 1-based delivery attempt
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

fn first_attempt() -> u32 {
    1
}

impl Job {
    pub fn new(kind: &str, payload: JobPayload) -> Self {
        Self {
            id: JobId::generate(),
            kind: kind.to_string(),
            payload,
            attempt: 1,
            enqueued_at: Utc::now(),
        }
    }

    /// Copy of this job for the next delivery attempt.
    pub fn redelivery(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Lifecycle state of a job, owned by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Terminal-state notification published on the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn completed(job_id: JobId) -> Self {
        Self {
            job_id,
            status: JobStatus::Completed,
            reason: None,
            at: Utc::now(),
        }
    }

    pub fn failed(job_id: JobId, reason: String) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            reason: Some(reason),
            at: Utc::now(),
        }
    }
}

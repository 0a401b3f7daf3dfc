//! Inbox triage - async job pipeline for classifying and answering email.
//!
//! This library provides shared modules for the three binaries:
//! - `triage-web`: Thin web server accepting direct submissions
//! - `triage-discovery`: Interval scanner that enqueues unread mail
//! - `triage-worker`: Worker pool that classifies, replies and labels
//!
//! ## Architecture
//!
//! ```text
//! Discovery / Web → email-processing → Worker → Gmail / Hugging Face
//!                                        ↓
//!                    email-processing.events → completion reporter
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod inference;
pub mod mailbox;
pub mod queue;
pub mod reporter;
pub mod web;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use discovery::{Discovery, ScanReport};
pub use error::{PipelineError, ProviderError, QueueError};
pub use inference::{Category, Classifier, PromptTemplate, Responder};
pub use mailbox::{MailboxGateway, MailboxSession};
pub use queue::{AmqpQueue, Job, JobEvent, JobId, JobPayload, JobQueue, JobStatus, MemoryQueue};
pub use reporter::{spawn_reporter, CompletionLog};
pub use web::AppState;
pub use worker::EmailProcessor;

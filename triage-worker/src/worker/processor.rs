//! Per-job processing: classify, draft, send, label.
//!
//! Steps run strictly in order and the first failure ends the job. Nothing is
//! retried here; retries belong to the queue's redelivery policy.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info};

use crate::error::PipelineError;
use crate::inference::{Category, Classifier, Responder};
use crate::mailbox::{LabelResolver, MailboxGateway, UNREAD_LABEL};
use crate::queue::Job;

/// Execution state of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Classifying,
    Drafting,
    Sending,
    Labeling,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Classifying => "classifying",
            Stage::Drafting => "drafting",
            Stage::Sending => "sending",
            Stage::Labeling => "labeling",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successfully processed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub category: Category,
    pub reply: String,
    /// Whether the source message was labeled and marked read
    pub labeled: bool,
}

/// A job that stopped at `stage`.
#[derive(Debug)]
pub struct ProcessFailure {
    pub stage: Stage,
    pub error: PipelineError,
}

impl fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

/// Orchestrates the classifier, responder and mailbox for one job at a time.
pub struct EmailProcessor {
    classifier: Classifier,
    responder: Responder,
    mailbox: Arc<dyn MailboxGateway>,
    labels: LabelResolver,
    reply_subject: String,
}

impl EmailProcessor {
    pub fn new(
        classifier: Classifier,
        responder: Responder,
        mailbox: Arc<dyn MailboxGateway>,
        reply_subject: String,
    ) -> Self {
        Self {
            classifier,
            responder,
            labels: LabelResolver::new(Arc::clone(&mailbox)),
            mailbox,
            reply_subject,
        }
    }

    /// Run every step for `job`.
    ///
    /// Labeling is skipped for jobs without a source message. A successful
    /// return means the reply was sent and, when applicable, the source
    /// message was labeled and marked read.
    pub async fn process(&self, job: &Job) -> Result<ProcessOutcome, ProcessFailure> {
        let payload = &job.payload;
        let mut stage = Stage::Received;

        info!(
            job_id = %job.id,
            attempt = job.attempt,
            recipient = %payload.recipient,
            content_length = payload.content.len(),
            has_source_message = payload.source_message_id.is_some(),
            "job_received"
        );

        let result: Result<ProcessOutcome, PipelineError> = async {
            stage = self.enter(job, Stage::Classifying);
            let category = self
                .classifier
                .categorize(&payload.content)
                .await
                .map_err(PipelineError::Classification)?;
            info!(job_id = %job.id, category = %category, "job_categorized");

            stage = self.enter(job, Stage::Drafting);
            let reply = self
                .responder
                .draft(&payload.content, category)
                .await
                .map_err(PipelineError::Generation)?;

            stage = self.enter(job, Stage::Sending);
            self.mailbox
                .send(&payload.recipient, &self.reply_subject, &reply)
                .await
                .map_err(PipelineError::Send)?;
            info!(job_id = %job.id, recipient = %payload.recipient, "job_reply_sent");

            let labeled = match payload.source_message_id.as_ref() {
                Some(message_id) => {
                    stage = self.enter(job, Stage::Labeling);
                    let label_id = self
                        .labels
                        .apply(message_id, category.as_str(), &[UNREAD_LABEL.to_string()])
                        .await
                        .map_err(PipelineError::Label)?;
                    info!(
                        job_id = %job.id,
                        message_id = %message_id,
                        label = category.as_str(),
                        label_id = %label_id,
                        "job_message_labeled"
                    );
                    true
                }
                None => false,
            };

            Ok(ProcessOutcome {
                category,
                reply,
                labeled,
            })
        }
        .await;

        match result {
            Ok(outcome) => {
                self.enter(job, Stage::Done);
                Ok(outcome)
            }
            Err(error) => {
                error!(
                    job_id = %job.id,
                    stage = %stage,
                    error_kind = error.kind(),
                    error = %error,
                    "job_step_failed"
                );
                Err(ProcessFailure { stage, error })
            }
        }
    }

    fn enter(&self, job: &Job, stage: Stage) -> Stage {
        info!(job_id = %job.id, stage = %stage, "job_stage");
        stage
    }
}

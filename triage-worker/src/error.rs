//! Error types for the triage pipeline.
//!
//! Capability adapters (Gmail, Hugging Face, RabbitMQ) report low-level
//! failures as [`ProviderError`] or [`QueueError`]. The worker wraps those into
//! the [`PipelineError`] variant for the step that failed, and the variant name
//! becomes part of the job's failure reason.

/// Failure of an outbound call to the mail provider or the inference API.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("label already exists: {0}")]
    LabelExists(String),
}

impl ProviderError {
    /// Whether the provider rejected the request itself (400 or 404), as it
    /// does for a label id that no longer exists.
    pub fn is_rejected_request(&self) -> bool {
        matches!(self, ProviderError::Status { status: 400 | 404, .. })
    }
}

/// Failure of the job queue backend.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("queue closed")]
    Closed,

    #[error("job encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors raised while processing a job or feeding the queue.
///
/// Each variant maps to one stage of the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("ClassificationError: {0}")]
    Classification(ProviderError),

    #[error("GenerationError: {0}")]
    Generation(ProviderError),

    #[error("SendError: {0}")]
    Send(ProviderError),

    #[error("LabelError: {0}")]
    Label(ProviderError),

    #[error("QueueUnavailable: {0}")]
    QueueUnavailable(#[from] QueueError),

    #[error("GatewayFetchError: {0}")]
    GatewayFetch(ProviderError),
}

impl PipelineError {
    /// Short name of the error class, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Classification(_) => "ClassificationError",
            PipelineError::Generation(_) => "GenerationError",
            PipelineError::Send(_) => "SendError",
            PipelineError::Label(_) => "LabelError",
            PipelineError::QueueUnavailable(_) => "QueueUnavailable",
            PipelineError::GatewayFetch(_) => "GatewayFetchError",
        }
    }
}

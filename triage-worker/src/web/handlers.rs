//! Submission endpoint handlers.
//!
//! These handlers only:
//! 1. Check the optional submit token
//! 2. Enqueue the job
//! 3. Return immediately
//!
//! A 202 means the job was accepted, not processed. Processing results only
//! show up on the completion event stream and in the worker logs.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::queue::{JobPayload, JobQueue, PROCESS_EMAIL};
use crate::Config;

/// Header carrying the shared submit token.
pub const SUBMIT_TOKEN_HEADER: &str = "X-Submit-Token";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<dyn JobQueue>,
}

impl AppState {
    pub fn new(config: Config, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            config: Arc::new(config),
            queue,
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Direct Submission
// =============================================================================

/// Direct submission body.
///
/// The camelCase names used by older clients are accepted as aliases.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(alias = "emailContent")]
    pub content: String,
    #[serde(alias = "recipientEmail")]
    pub recipient: String,
}

/// Submission response.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

fn reply(
    status: StatusCode,
    label: &str,
    job_id: Option<String>,
) -> (StatusCode, Json<SubmitResponse>) {
    (
        status,
        Json(SubmitResponse {
            status: label.to_string(),
            job_id,
        }),
    )
}

/// Direct submission endpoint.
///
/// Enqueues a job without a source message, so the worker replies but never
/// touches labels.
pub async fn submit_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "submission_malformed");
            return reply(StatusCode::BAD_REQUEST, "invalid", None);
        }
    };

    info!(
        recipient = %request.recipient,
        content_length = request.content.len(),
        "submission_received"
    );

    if let Some(expected) = state.config.submit_token.as_deref() {
        let provided = headers
            .get(SUBMIT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected) {
            warn!(
                recipient = %request.recipient,
                has_token = provided.is_some(),
                "submission_unauthorized"
            );
            return reply(StatusCode::UNAUTHORIZED, "unauthorized", None);
        }
    }

    if request.content.trim().is_empty() || request.recipient.trim().is_empty() {
        warn!("submission_invalid");
        return reply(StatusCode::BAD_REQUEST, "invalid", None);
    }

    let payload = JobPayload::submitted(request.content, request.recipient.trim().to_string());

    match state.queue.enqueue(PROCESS_EMAIL, payload).await {
        Ok(job_id) => {
            info!(job_id = %job_id, recipient = %request.recipient, "submission_enqueued");
            reply(StatusCode::ACCEPTED, "enqueued", Some(job_id.to_string()))
        }
        Err(e) => {
            error!(error = %e, "submission_enqueue_failed");
            reply(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", None)
        }
    }
}

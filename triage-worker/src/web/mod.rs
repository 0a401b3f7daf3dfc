//! Web server module for direct job submission.
//!
//! This module provides a thin web server that:
//! - Accepts `{content, recipient}` submissions
//! - Immediately enqueues them as jobs
//! - Returns 202 without waiting for processing

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    health, submit_email, AppState, HealthResponse, SubmitRequest, SubmitResponse,
    SUBMIT_TOKEN_HEADER,
};

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/process-email", post(submit_email))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

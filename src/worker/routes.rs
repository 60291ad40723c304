//! The intercepted fetch surface.
//!
//! `POST /api/sync` is a magic local path: it exists only to be taken
//! over by the worker. The router is driven in-process as a
//! `tower::Service` by the page's sync client and is never bound to a
//! socket, so the submission can never escape to the network as-is.
//! Whatever happens inside, the page always gets a 200.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tower_http::cors::CorsLayer;

use crate::error::SyncError;
use crate::types::{SyncPayload, SyncSubmission};
use crate::worker::engine::{SyncEngine, SyncStatus};

/// The magic local path the page posts submissions to.
pub const SYNC_ENDPOINT: &str = "/api/sync";

/// Build the worker's intercept router.
pub fn sync_router(engine: Arc<SyncEngine>) -> Router {
    Router::new()
        .route(SYNC_ENDPOINT, post(sync_handler))
        .route("/api/sync/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

/// GET /api/sync/health — liveness probe.
async fn health_handler(State(engine): State<Arc<SyncEngine>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "queued": engine.queue_len(),
    }))
}

/// POST /api/sync — take over a sync submission.
///
/// The body is read raw so a malformed submission still gets its 200;
/// the extractor rejecting with a 4xx would leak the failure to the page.
async fn sync_handler(
    State(engine): State<Arc<SyncEngine>>,
    body: Bytes,
) -> impl IntoResponse {
    let status = match parse_submission(&body) {
        Ok(submission) => engine.submit(submission).await,
        Err(e) => {
            log::warn!("dropping malformed sync submission: {e}");
            SyncStatus::Queued
        }
    };
    Json(serde_json::json!({ "status": status.message() }))
}

fn parse_submission(body: &[u8]) -> Result<SyncSubmission, SyncError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| SyncError::InvalidSubmission(format!("body is not JSON: {e}")))?;

    let webhook_url = value
        .get("webhookUrl")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| SyncError::InvalidSubmission("missing webhookUrl".to_string()))?;

    let payload = value
        .get("payload")
        .cloned()
        .ok_or_else(|| SyncError::InvalidSubmission("missing payload".to_string()))?;
    let payload: SyncPayload = serde_json::from_value(payload)
        .map_err(|e| SyncError::InvalidSubmission(format!("bad payload: {e}")))?;

    Ok(SyncSubmission::new(webhook_url, payload))
}

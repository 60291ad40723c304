//! Error taxonomy for the cache, sync, and lifecycle paths.
//!
//! Errors inside the sync and cache paths are recovered locally: the
//! gateway collapses to an empty result set, the sync route always answers
//! 200, and only the LLM fallback result ever surfaces to the UI. These
//! types exist so the recovery sites can log with a stable code and tests
//! can assert on the precise failure.

use thiserror::Error;

/// Failures in the similarity cache pipeline.
///
/// Every variant is logged with its code and collapsed to an empty result
/// sequence at the gateway boundary; the search path never blocks on it.
#[derive(Debug, Error)]
pub enum CacheError {
    /// CACHE-404: polling finished without a hit.
    #[error("CACHE-404: no similarity hit for hash {query_hash} after {attempts} attempts")]
    Timeout { query_hash: String, attempts: u32 },

    /// CACHE-500: the remote store read failed.
    #[error("CACHE-500: similarity store read failed: {0}")]
    Remote(String),

    /// WEBHOOK-500: the similarity ingress rejected the post.
    #[error("WEBHOOK-500: similarity ingress post failed: {0}")]
    Ingress(String),

    /// The caller cancelled the lookup.
    #[error("similarity lookup cancelled")]
    Cancelled,
}

impl CacheError {
    /// Stable log code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            CacheError::Timeout { .. } => "CACHE-404",
            CacheError::Remote(_) => "CACHE-500",
            CacheError::Ingress(_) => "WEBHOOK-500",
            CacheError::Cancelled => "CACHE-CANCELLED",
        }
    }
}

/// Failures in the background sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Submission body was missing `webhookUrl` or `payload`.
    #[error("malformed sync submission: {0}")]
    InvalidSubmission(String),

    /// The webhook host was unreachable or the request timed out.
    #[error("webhook transport error: {0}")]
    Transport(String),

    /// The durable queue itself failed.
    #[error("sync queue storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// A drain stopped early; the platform should reschedule.
    #[error("sync replay interrupted with {remaining} records still queued")]
    ReplayInterrupted { remaining: usize },
}

/// Failures in worker registration and handshake.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The controlling worker's channel is gone.
    #[error("no controlling worker")]
    NoController,

    #[error("worker storage initialization failed: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Failures calling the LLM edge function. Always converted to the
/// fallback result before reaching the UI.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("edge function request failed: {0}")]
    Http(String),

    #[error("edge function answered with status {status}")]
    Status { status: u16 },

    #[error("edge function response was not in the expected shape: {0}")]
    BadResponse(String),

    #[error("edge function call exceeded the {0}s deadline")]
    Deadline(u64),
}

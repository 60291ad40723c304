//! Similarity Cache Gateway: "has a similar session seen this query?"
//!
//! Two-tier read side against the remote vector store. The exact tier is
//! keyed by SHA-512 of the query text; the semantic tier is the remote
//! store's own embedding match, reached through the same polled relation.
//! Lookups are bounded: five polls with exponential backoff, then the
//! gateway reports a miss. Every failure collapses to an empty result so
//! the search path never blocks on this tier.

pub mod supabase;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use supabase::SupabaseBackend;

use crate::error::CacheError;
use crate::types::SearchResult;
use crate::util::{now_ms, sha512_hex, CancelToken};

/// Poll attempts before the gateway gives up.
pub const MAX_POLL_ATTEMPTS: u32 = 5;

/// Maximum results returned from one lookup.
pub const RESULT_LIMIT: usize = 5;

/// Confidence assigned to similarity-tier results, on the local 0–100
/// scale.
pub const CACHED_CONFIDENCE: u8 = 90;

/// Body posted to the similarity ingress.
#[derive(Debug, Clone, Serialize)]
pub struct IngestRequest {
    pub query: String,
    pub content: String,
    pub user_id: String,
    pub query_hash: String,
}

/// One joined row from the remote result relations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedRow {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Remote surface the gateway polls. Implemented by [`SupabaseBackend`]
/// in production and by an in-memory double in tests.
#[async_trait]
pub trait SimilarityBackend: Send + Sync {
    /// Register the query with the ingress so the store can embed it.
    async fn ingest(&self, request: &IngestRequest) -> Result<(), CacheError>;

    /// Cache ids currently recorded for `(user_id, query_hash)`.
    async fn poll_hits(&self, user_id: &str, query_hash: &str) -> Result<Vec<String>, CacheError>;

    /// The joined result rows for the given cache ids.
    async fn fetch_results(&self, cache_ids: &[String]) -> Result<Vec<CachedRow>, CacheError>;
}

/// Read-side gateway over a [`SimilarityBackend`].
pub struct SimilarityGateway {
    backend: Arc<dyn SimilarityBackend>,
}

impl SimilarityGateway {
    pub fn new(backend: Arc<dyn SimilarityBackend>) -> Self {
        Self { backend }
    }

    /// Up to [`RESULT_LIMIT`] cached results for `query`, or empty.
    ///
    /// Never fails: every error is logged with its code and collapsed to
    /// an empty sequence. Honors `cancel` at each backoff sleep and
    /// around every remote call.
    pub async fn find(
        &self,
        query: &str,
        user_id: &str,
        cancel: &CancelToken,
    ) -> Vec<SearchResult> {
        match self.lookup(query, user_id, cancel).await {
            Ok(results) => results,
            Err(e) => {
                log::warn!("[{}] similarity lookup for user {user_id}: {e}", e.code());
                Vec::new()
            }
        }
    }

    async fn lookup(
        &self,
        query: &str,
        user_id: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchResult>, CacheError> {
        let query_hash = sha512_hex(query);

        let request = IngestRequest {
            query: query.to_string(),
            content: query.to_string(),
            user_id: user_id.to_string(),
            query_hash: query_hash.clone(),
        };
        self.guarded(cancel, self.backend.ingest(&request)).await??;

        for attempt in 0..MAX_POLL_ATTEMPTS {
            let delay = Duration::from_secs(1u64 << attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            }

            let hits = self
                .guarded(cancel, self.backend.poll_hits(user_id, &query_hash))
                .await??;
            if hits.is_empty() {
                continue;
            }

            let rows = self
                .guarded(cancel, self.backend.fetch_results(&hits))
                .await??;
            return Ok(rows
                .into_iter()
                .take(RESULT_LIMIT)
                .map(|row| project(row, query))
                .collect());
        }

        Err(CacheError::Timeout {
            query_hash,
            attempts: MAX_POLL_ATTEMPTS,
        })
    }

    /// Run `fut` unless the token cancels first.
    async fn guarded<T>(
        &self,
        cancel: &CancelToken,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T, CacheError> {
        tokio::select! {
            out = fut => Ok(out),
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
        }
    }
}

/// Project a remote row to a cached [`SearchResult`].
fn project(row: CachedRow, query: &str) -> SearchResult {
    let id = format!("cached-{}", row.id);
    SearchResult {
        root_id: id.clone(),
        id,
        parent_id: None,
        follow_up_query: None,
        title: row.title.unwrap_or_else(|| query.to_string()),
        content: row.content,
        sources: row.sources,
        confidence: CACHED_CONFIDENCE,
        category: "Cached".to_string(),
        timestamp: now_ms(),
        replies: Vec::new(),
        is_cached: true,
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory backend double with scriptable visibility and failures.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use parking_lot::RwLock;

    use super::*;

    #[derive(Default)]
    pub struct MemoryBackend {
        hits: RwLock<HashMap<String, Vec<String>>>,
        rows: RwLock<HashMap<String, CachedRow>>,
        /// Polls that must happen before seeded hits become visible.
        visible_after: AtomicU32,
        pub polls: AtomicU32,
        pub ingests: AtomicU32,
        fail_ingress: AtomicBool,
    }

    impl MemoryBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, user_id: &str, query_hash: &str, rows: Vec<CachedRow>) {
            let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
            self.hits
                .write()
                .insert(format!("{user_id}|{query_hash}"), ids);
            let mut stored = self.rows.write();
            for row in rows {
                stored.insert(row.id.clone(), row);
            }
        }

        pub fn set_visible_after(&self, polls: u32) {
            self.visible_after.store(polls, Ordering::SeqCst);
        }

        pub fn set_fail_ingress(&self, fail: bool) {
            self.fail_ingress.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SimilarityBackend for MemoryBackend {
        async fn ingest(&self, _request: &IngestRequest) -> Result<(), CacheError> {
            self.ingests.fetch_add(1, Ordering::SeqCst);
            if self.fail_ingress.load(Ordering::SeqCst) {
                return Err(CacheError::Ingress("ingress unavailable".to_string()));
            }
            Ok(())
        }

        async fn poll_hits(
            &self,
            user_id: &str,
            query_hash: &str,
        ) -> Result<Vec<String>, CacheError> {
            let count = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if count < self.visible_after.load(Ordering::SeqCst) {
                return Ok(Vec::new());
            }
            Ok(self
                .hits
                .read()
                .get(&format!("{user_id}|{query_hash}"))
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch_results(&self, cache_ids: &[String]) -> Result<Vec<CachedRow>, CacheError> {
            let rows = self.rows.read();
            Ok(cache_ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
        }
    }
}

//! Search Orchestrator: the query path.
//!
//! One entry point, [`SearchOrchestrator::search`], walks the tiers in
//! order: the local exact tier (thread cache), the remote similarity
//! tier, and finally the LLM edge function. Fresh results are persisted
//! locally and handed to the sync engine without being awaited; the UI
//! never waits on delivery, and total failure degrades to a single
//! fallback result instead of an error.

use std::sync::Arc;
use std::time::Duration;

use crate::config::SyncConfig;
use crate::error::LlmError;
use crate::llm::{
    fallback_result, prompts, split_sources, EdgeFunction, SupabaseEdgeFunction,
    LLM_TIMEOUT_SECS,
};
use crate::page::{PageRuntime, SyncClient};
use crate::similarity::{SimilarityGateway, SupabaseBackend};
use crate::store::{ArtifactStore, SearchHistory};
use crate::types::{Reply, SearchHistoryItem, SearchResult, SyncPayload};
use crate::util::{fnv1a32, now_ms, CancelToken};

/// Composes the cache tiers, the LLM, and the sync handoff.
pub struct SearchOrchestrator {
    store: Arc<ArtifactStore>,
    history: Arc<SearchHistory>,
    fingerprint_id: String,
    similarity: Option<SimilarityGateway>,
    edge: Option<Arc<dyn EdgeFunction>>,
    sync: Option<SyncClient>,
    webhook_url: Option<String>,
}

impl SearchOrchestrator {
    pub fn new(
        store: Arc<ArtifactStore>,
        history: Arc<SearchHistory>,
        fingerprint_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            history,
            fingerprint_id: fingerprint_id.into(),
            similarity: None,
            edge: None,
            sync: None,
            webhook_url: None,
        }
    }

    /// Wire up from a page runtime and configuration, enabling whichever
    /// tiers the configuration carries.
    pub fn from_page(page: &PageRuntime, config: &SyncConfig) -> Self {
        let mut orchestrator = Self::new(
            page.store.clone(),
            page.history.clone(),
            page.fingerprint_id.clone(),
        );
        if config.similarity_enabled() {
            if let Some(backend) = SupabaseBackend::from_config(config) {
                orchestrator = orchestrator
                    .with_similarity(SimilarityGateway::new(Arc::new(backend)));
            }
        }
        if let Some(edge) = SupabaseEdgeFunction::from_config(config) {
            orchestrator = orchestrator.with_edge(Arc::new(edge));
        }
        if let Some(url) = &config.webhook_url {
            orchestrator = orchestrator.with_sync(page.sync_client(), url.clone());
        }
        orchestrator
    }

    pub fn with_similarity(mut self, gateway: SimilarityGateway) -> Self {
        self.similarity = Some(gateway);
        self
    }

    pub fn with_edge(mut self, edge: Arc<dyn EdgeFunction>) -> Self {
        self.edge = Some(edge);
        self
    }

    pub fn with_sync(mut self, sync: SyncClient, webhook_url: impl Into<String>) -> Self {
        self.sync = Some(sync);
        self.webhook_url = Some(webhook_url.into());
        self
    }

    /// Run one query. See [`search_with_cancel`].
    ///
    /// [`search_with_cancel`]: SearchOrchestrator::search_with_cancel
    pub async fn search(
        &self,
        query: &str,
        parent: Option<&SearchResult>,
        user_id: Option<&str>,
    ) -> Vec<SearchResult> {
        self.search_with_cancel(query, parent, user_id, &CancelToken::new())
            .await
    }

    /// Run one query with caller-controlled cancellation.
    ///
    /// Returns cached results when a tier hits, otherwise the freshly
    /// generated result (already persisted, sync dispatched), otherwise
    /// the single fallback result. Never errors.
    pub async fn search_with_cancel(
        &self,
        query: &str,
        parent: Option<&SearchResult>,
        user_id: Option<&str>,
        cancel: &CancelToken,
    ) -> Vec<SearchResult> {
        let cache_key = match parent {
            Some(p) => p.id.clone(),
            None => format!("root-{}", fnv1a32(query)),
        };

        if let Some(hit) = self.local_lookup(query, parent, &cache_key) {
            return vec![hit];
        }

        if let (Some(gateway), Some(user_id)) = (&self.similarity, user_id) {
            let cached = gateway.find(query, user_id, cancel).await;
            if !cached.is_empty() {
                return cached;
            }
        }

        let result = self.ask_llm(query, parent, &cache_key, cancel).await;
        if result.category == "Error" {
            // Fallbacks are shown, never cached or synced.
            return vec![result];
        }

        self.store.save(&result);
        if result.is_root() {
            self.history.save(SearchHistoryItem {
                id: result.id.clone(),
                query: query.to_string(),
                timestamp: result.timestamp,
                result_id: result.id.clone(),
            });
        }
        self.dispatch_sync(&result, user_id);
        vec![result]
    }

    /// Exact tier: the stored thread for a root query, or the matching
    /// reply of the parent thread for a follow-up.
    fn local_lookup(
        &self,
        query: &str,
        parent: Option<&SearchResult>,
        cache_key: &str,
    ) -> Option<SearchResult> {
        match parent {
            Some(p) => {
                let thread = self.store.get_thread(&p.id)?;
                thread.replies.iter().find_map(|reply| match reply {
                    Reply::Full(full) if full.follow_up_query.as_deref() == Some(query) => {
                        Some((**full).clone())
                    }
                    _ => None,
                })
            }
            None => {
                let thread = self.store.get_thread(cache_key)?;
                self.history.save(SearchHistoryItem {
                    id: thread.id.clone(),
                    query: query.to_string(),
                    timestamp: now_ms(),
                    result_id: thread.id.clone(),
                });
                Some(thread)
            }
        }
    }

    async fn ask_llm(
        &self,
        query: &str,
        parent: Option<&SearchResult>,
        cache_key: &str,
        cancel: &CancelToken,
    ) -> SearchResult {
        let Some(edge) = &self.edge else {
            log::warn!("no edge function configured, answering with fallback");
            return fallback_result(query);
        };

        let system_prompt = match parent {
            Some(p) => prompts::follow_up_system_prompt(&p.content),
            None => prompts::INITIAL_SYSTEM_PROMPT.to_string(),
        };

        let deadline = Duration::from_secs(LLM_TIMEOUT_SECS);
        let outcome = tokio::select! {
            timed = tokio::time::timeout(deadline, edge.call(query, &system_prompt)) => {
                timed.unwrap_or(Err(LlmError::Deadline(LLM_TIMEOUT_SECS)))
            }
            _ = cancel.cancelled() => Err(LlmError::Http("cancelled by caller".to_string())),
        };

        match outcome {
            Ok(results) => match results.into_iter().next() {
                Some(first) => self.wrap_result(first, query, parent, cache_key),
                None => {
                    log::warn!("edge function answered with no results");
                    fallback_result(query)
                }
            },
            Err(e) => {
                log::warn!("edge function call failed: {e}");
                fallback_result(query)
            }
        }
    }

    /// Re-key a raw edge-function result into this thread, splitting out
    /// its `Sources:` section.
    fn wrap_result(
        &self,
        raw: SearchResult,
        query: &str,
        parent: Option<&SearchResult>,
        cache_key: &str,
    ) -> SearchResult {
        let (content, sources) = split_sources(&raw.content);
        let timestamp = now_ms();
        let (id, root_id, parent_id, follow_up_query) = match parent {
            Some(p) => (
                format!("{}-{timestamp}", p.id),
                p.root_id.clone(),
                Some(p.id.clone()),
                Some(query.to_string()),
            ),
            None => (cache_key.to_string(), cache_key.to_string(), None, None),
        };

        SearchResult {
            id,
            root_id,
            parent_id,
            follow_up_query,
            title: if raw.title.is_empty() {
                query.to_string()
            } else {
                raw.title
            },
            content,
            sources: if sources.is_empty() { raw.sources } else { sources },
            confidence: raw.confidence,
            category: raw.category,
            timestamp,
            replies: Vec::new(),
            is_cached: false,
        }
    }

    /// Hand the result to the sync engine without awaiting it.
    fn dispatch_sync(&self, result: &SearchResult, user_id: Option<&str>) {
        let (Some(sync), Some(url)) = (&self.sync, &self.webhook_url) else {
            return;
        };
        let payload = SyncPayload {
            results: vec![result.clone()],
            user_id: user_id.map(str::to_string),
            fingerprint_id: self.fingerprint_id.clone(),
        };
        let sync = sync.clone();
        let url = url.clone();
        tokio::spawn(async move {
            let status = sync.submit(&url, &payload).await;
            log::debug!("sync submission handed off: {status}");
        });
    }
}

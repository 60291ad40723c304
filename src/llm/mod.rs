//! LLM edge-function client.
//!
//! The edge function is an opaque POST endpoint: `{query, systemPrompt}`
//! in, `{results: [...]}` out, with each result's content ending in a
//! `Sources:` section. Calls carry a 60-second hard deadline; any failure
//! becomes the fallback result, never an error surfaced to the UI.

pub mod prompts;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::LlmError;
use crate::types::SearchResult;
use crate::util::{http_client, now_ms};

/// Hard deadline for one edge-function call.
pub const LLM_TIMEOUT_SECS: u64 = 60;

/// The literal marker separating answer body from citations.
pub const SOURCES_MARKER: &str = "Sources:";

/// Seam over the LLM ingress.
#[async_trait]
pub trait EdgeFunction: Send + Sync {
    /// Ask the model. Implementations must give up within
    /// [`LLM_TIMEOUT_SECS`].
    async fn call(&self, query: &str, system_prompt: &str)
        -> Result<Vec<SearchResult>, LlmError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EdgeRequest<'a> {
    query: &'a str,
    system_prompt: &'a str,
}

#[derive(Deserialize)]
struct EdgeResponse {
    results: Vec<SearchResult>,
}

/// Production client for the edge function.
pub struct SupabaseEdgeFunction {
    url: String,
    api_key: Option<String>,
}

impl SupabaseEdgeFunction {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            api_key,
        }
    }

    /// Build from configuration; `None` when no ingress is configured.
    pub fn from_config(config: &SyncConfig) -> Option<Self> {
        Some(Self::new(
            config.edge_function_url.clone()?,
            config.supabase_key.clone(),
        ))
    }
}

#[async_trait]
impl EdgeFunction for SupabaseEdgeFunction {
    async fn call(
        &self,
        query: &str,
        system_prompt: &str,
    ) -> Result<Vec<SearchResult>, LlmError> {
        let mut builder = http_client()
            .post(&self.url)
            .timeout(Duration::from_secs(LLM_TIMEOUT_SECS))
            .json(&EdgeRequest {
                query,
                system_prompt,
            });
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Deadline(LLM_TIMEOUT_SECS)
            } else {
                LlmError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
            });
        }

        let body: EdgeResponse = response
            .json()
            .await
            .map_err(|e| LlmError::BadResponse(e.to_string()))?;
        Ok(body.results)
    }
}

/// Split an answer on the literal `Sources:` marker.
///
/// Everything before the first marker is the answer body; each non-empty
/// line after it becomes one citation. Without a marker the whole text is
/// the body.
pub fn split_sources(content: &str) -> (String, Vec<String>) {
    match content.split_once(SOURCES_MARKER) {
        Some((body, tail)) => {
            let sources = tail
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            (body.trim_end().to_string(), sources)
        }
        None => (content.to_string(), Vec::new()),
    }
}

/// The single result returned when the LLM call fails or times out.
pub fn fallback_result(query: &str) -> SearchResult {
    let id = format!("error-{}", Uuid::new_v4());
    SearchResult {
        root_id: id.clone(),
        id,
        parent_id: None,
        follow_up_query: None,
        title: query.to_string(),
        content: "Search is temporarily unavailable. Please try again in a moment."
            .to_string(),
        sources: Vec::new(),
        confidence: 0,
        category: "Error".to_string(),
        timestamp: now_ms(),
        replies: Vec::new(),
        is_cached: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sources_extracts_citation_lines() {
        let content = "GraphQL favors persisted queries.[1]\n\nSources:\n1. https://graphql.org\n\n2. https://spec.example\n";
        let (body, sources) = split_sources(content);
        assert_eq!(body, "GraphQL favors persisted queries.[1]");
        assert_eq!(
            sources,
            vec!["1. https://graphql.org", "2. https://spec.example"]
        );
    }

    #[test]
    fn test_split_sources_without_marker() {
        let (body, sources) = split_sources("no citations here");
        assert_eq!(body, "no citations here");
        assert!(sources.is_empty());
    }

    #[test]
    fn test_split_sources_uses_first_marker() {
        let content = "Body mentions Sources: 1. one\nSources:\n2. two";
        let (body, sources) = split_sources(content);
        assert_eq!(body, "Body mentions");
        assert_eq!(sources, vec!["1. one", "2. two"]);
    }

    #[test]
    fn test_fallback_result_shape() {
        let result = fallback_result("graphql best practices");
        assert_eq!(result.category, "Error");
        assert_eq!(result.confidence, 0);
        assert!(result.sources.is_empty());
        assert!(result.is_root());
        assert_eq!(result.root_id, result.id);
        assert!(!result.content.is_empty());
    }

    #[test]
    fn test_edge_request_wire_shape() {
        let req = EdgeRequest {
            query: "q",
            system_prompt: "p",
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["query"], "q");
        assert_eq!(v["systemPrompt"], "p");
    }
}

//! REST backend for the remote similarity store.
//!
//! The store exposes PostgREST-style relations: `cachedQueryResults`
//! records which cache rows answer a given `(user_id, user_query_hash)`
//! pair, and `cache` joined with `cacheUserResults` carries the stored
//! result bodies. Writes go through a separate ingress endpoint that
//! queues the query for embedding.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::config::SyncConfig;
use crate::error::CacheError;
use crate::similarity::{CachedRow, IngestRequest, SimilarityBackend};
use crate::util::http_client;

/// Similarity backend over the vector store's REST surface.
pub struct SupabaseBackend {
    base_url: String,
    api_key: String,
    ingress_url: String,
    ingress_key: Option<String>,
}

impl SupabaseBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        ingress_url: impl Into<String>,
        ingress_key: Option<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            ingress_url: ingress_url.into(),
            ingress_key,
        }
    }

    /// Build from configuration; `None` when the similarity tier is not
    /// configured.
    pub fn from_config(config: &SyncConfig) -> Option<Self> {
        Some(Self::new(
            config.supabase_url.clone()?,
            config.supabase_key.clone()?,
            config.similarity_query_url.clone()?,
            config.similarity_api_key.clone(),
        ))
    }

    fn rest_url(&self, relation: &str) -> String {
        format!("{}/rest/v1/{relation}", self.base_url.trim_end_matches('/'))
    }
}

/// Row of the `cachedQueryResults` relation.
#[derive(Debug, Deserialize)]
struct HitRow {
    cache_id: Value,
}

/// Row of `cache` with its `cacheUserResults` join embedded.
#[derive(Debug, Deserialize)]
struct CacheRowWire {
    id: Value,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, rename = "cacheUserResults")]
    user_results: Vec<UserResultWire>,
}

#[derive(Debug, Deserialize)]
struct UserResultWire {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    sources: Vec<String>,
}

/// Render a PostgREST scalar (int or string id) as a plain string.
fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SimilarityBackend for SupabaseBackend {
    async fn ingest(&self, request: &IngestRequest) -> Result<(), CacheError> {
        let mut builder = http_client().post(&self.ingress_url).json(request);
        if let Some(key) = &self.ingress_key {
            builder = builder.header("x-api-key", key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CacheError::Ingress(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CacheError::Ingress(format!(
                "ingress answered {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn poll_hits(&self, user_id: &str, query_hash: &str) -> Result<Vec<String>, CacheError> {
        let user_filter = format!("eq.{user_id}");
        let hash_filter = format!("eq.{query_hash}");
        let response = http_client()
            .get(self.rest_url("cachedQueryResults"))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .query(&[
                ("select", "cache_id"),
                ("user_id", user_filter.as_str()),
                ("user_query_hash", hash_filter.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CacheError::Remote(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CacheError::Remote(format!(
                "cachedQueryResults answered {}",
                response.status()
            )));
        }

        let rows: Vec<HitRow> = response
            .json()
            .await
            .map_err(|e| CacheError::Remote(e.to_string()))?;
        Ok(rows.iter().map(|r| id_string(&r.cache_id)).collect())
    }

    async fn fetch_results(&self, cache_ids: &[String]) -> Result<Vec<CachedRow>, CacheError> {
        let id_filter = format!("in.({})", cache_ids.join(","));
        let response = http_client()
            .get(self.rest_url("cache"))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .query(&[
                ("select", "*,cacheUserResults(*)"),
                ("id", id_filter.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CacheError::Remote(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CacheError::Remote(format!(
                "cache answered {}",
                response.status()
            )));
        }

        let rows: Vec<CacheRowWire> = response
            .json()
            .await
            .map_err(|e| CacheError::Remote(e.to_string()))?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let joined = row.user_results.into_iter().next();
                let content = row
                    .content
                    .or_else(|| joined.as_ref().and_then(|j| j.content.clone()))?;
                Some(CachedRow {
                    id: id_string(&row.id),
                    title: row.title,
                    content,
                    sources: joined.map(|j| j.sources).unwrap_or_default(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_requires_similarity_settings() {
        let config = SyncConfig::default();
        assert!(SupabaseBackend::from_config(&config).is_none());

        let config = SyncConfig {
            supabase_url: Some("https://store.example".to_string()),
            supabase_key: Some("key".to_string()),
            similarity_query_url: Some("https://ingress.example/similar".to_string()),
            ..Default::default()
        };
        let backend = SupabaseBackend::from_config(&config).unwrap();
        assert_eq!(
            backend.rest_url("cache"),
            "https://store.example/rest/v1/cache"
        );
    }

    #[test]
    fn test_join_rows_project_to_cached_rows() {
        let json = r#"[
            {"id": 7, "title": "GraphQL", "cacheUserResults": [
                {"content": "Use persisted queries.", "sources": ["1. spec"]}
            ]},
            {"id": 8, "content": "Inline body", "cacheUserResults": []},
            {"id": 9, "cacheUserResults": []}
        ]"#;
        let rows: Vec<CacheRowWire> = serde_json::from_str(json).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(id_string(&rows[0].id), "7");
        assert_eq!(
            rows[0].user_results[0].content.as_deref(),
            Some("Use persisted queries.")
        );
        // Row 9 has no body anywhere and would be dropped by projection.
        assert!(rows[2].content.is_none() && rows[2].user_results.is_empty());
    }
}

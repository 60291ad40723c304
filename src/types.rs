//! Core data model for the search cache and sync pipeline.
//!
//! A conversation is a rooted tree of [`SearchResult`]s connected by
//! `parent_id`. Nodes are stored flat by id; a stored parent carries its
//! children only as denormalized [`ReplyStub`]s, which thread expansion
//! resolves back into full nodes. Wire names are camelCase to match the
//! webhook and vector-store contracts.

use serde::{Deserialize, Serialize};

use crate::util::now_ms;

/// Default time-to-live for locally stored artifacts: 24 hours.
pub const ARTIFACT_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// One node in a conversation tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    /// Unique id within the session.
    pub id: String,
    /// Id of the thread root; equals `id` for a root node.
    pub root_id: String,
    /// Parent node id; absent for a root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// The follow-up query that produced this node; absent for a root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up_query: Option<String>,
    pub title: String,
    /// Markdown body.
    pub content: String,
    /// Citation lines, in order.
    #[serde(default)]
    pub sources: Vec<String>,
    /// 0–100.
    pub confidence: u8,
    /// Short tag, e.g. "Technology" or "Cached".
    pub category: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    /// Children, in insertion order. Populated on read; stored as stubs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<Reply>,
    /// Set on results served from the similarity tier.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_cached: bool,
}

impl SearchResult {
    /// Build a root node for `query` under the given cache key.
    pub fn new_root(id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            root_id: id.clone(),
            id,
            parent_id: None,
            follow_up_query: None,
            title: title.into(),
            content: content.into(),
            sources: Vec::new(),
            confidence: 0,
            category: String::new(),
            timestamp: now_ms(),
            replies: Vec::new(),
            is_cached: false,
        }
    }

    /// Whether this node is a thread root.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// The denormalized form a parent stores for this node.
    pub fn stub(&self) -> ReplyStub {
        ReplyStub {
            id: self.id.clone(),
            follow_up_query: self.follow_up_query.clone(),
        }
    }
}

/// Denormalized child reference stored inside a parent's `replies`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyStub {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up_query: Option<String>,
}

/// A reply slot: either a fully expanded node (after thread assembly) or
/// the stored stub (on disk, or when the child is missing/expired).
///
/// Untagged so the wire shape matches the stored JSON exactly; a full node
/// is tried first since every full node also carries the stub fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Full(Box<SearchResult>),
    Stub(ReplyStub),
}

impl Reply {
    pub fn id(&self) -> &str {
        match self {
            Reply::Full(r) => &r.id,
            Reply::Stub(s) => &s.id,
        }
    }

    pub fn follow_up_query(&self) -> Option<&str> {
        match self {
            Reply::Full(r) => r.follow_up_query.as_deref(),
            Reply::Stub(s) => s.follow_up_query.as_deref(),
        }
    }

    /// The expanded node, if this slot was resolved.
    pub fn as_full(&self) -> Option<&SearchResult> {
        match self {
            Reply::Full(r) => Some(r),
            Reply::Stub(_) => None,
        }
    }
}

/// Storage envelope around a [`SearchResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub value: SearchResult,
    /// Write time, milliseconds since epoch.
    pub timestamp: i64,
    /// Write time + TTL.
    pub expires_at: i64,
}

impl CacheEntry {
    /// Wrap `value` with the given TTL, stamped now.
    pub fn new(value: SearchResult, ttl_ms: i64) -> Self {
        let timestamp = now_ms();
        Self {
            value,
            timestamp,
            expires_at: timestamp + ttl_ms,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Query index entry. The history is bounded to the most recent 50 items
/// and deduplicated by query string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHistoryItem {
    /// Mirrors the root result id.
    pub id: String,
    /// Original user text.
    pub query: String,
    /// Last access, milliseconds since epoch.
    pub timestamp: i64,
    pub result_id: String,
}

/// Body delivered to the orchestrator webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub results: Vec<SearchResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub fingerprint_id: String,
}

/// One element of the durable outbound queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSubmission {
    pub webhook_url: String,
    pub payload: SyncPayload,
    /// Milliseconds since epoch at enqueue.
    pub enqueue_time: i64,
}

impl SyncSubmission {
    pub fn new(webhook_url: impl Into<String>, payload: SyncPayload) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            payload,
            enqueue_time: now_ms(),
        }
    }
}

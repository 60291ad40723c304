//! Local Artifact Store: page-owned persistence for search result threads.
//!
//! Nodes are stored flat under `conv_<id>` keys, each wrapped in a
//! [`CacheEntry`] with a 24-hour TTL. A parent entry references its
//! children only through [`ReplyStub`]s; [`ArtifactStore::get_thread`]
//! expands stubs back into full nodes with a visit-set so a corrupt
//! back-reference can never loop the traversal.
//!
//! The store is advisory. Every read error yields an absent result and
//! every write error is logged and swallowed; absence never fails the
//! search path.

pub mod history;
pub mod kv;

use std::collections::HashSet;
use std::sync::Arc;

pub use history::SearchHistory;
pub use kv::{KvStore, MemoryKv, SqliteKv};

use crate::types::{CacheEntry, Reply, ReplyStub, SearchResult, ARTIFACT_TTL_MS};
use crate::util::now_ms;

/// Key prefix for stored conversation nodes.
pub const CONV_PREFIX: &str = "conv_";

fn conv_key(id: &str) -> String {
    format!("{CONV_PREFIX}{id}")
}

/// TTL-bounded store of conversation nodes.
pub struct ArtifactStore {
    kv: Arc<dyn KvStore>,
    ttl_ms: i64,
}

impl ArtifactStore {
    /// Store with the standard 24-hour TTL.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_ttl(kv, ARTIFACT_TTL_MS)
    }

    /// Store with a custom TTL.
    pub fn with_ttl(kv: Arc<dyn KvStore>, ttl_ms: i64) -> Self {
        Self { kv, ttl_ms }
    }

    /// Upsert `result` and, for a reply, append its stub to the parent.
    ///
    /// The node itself is written with its replies denormalized to stubs.
    /// The parent update is a single read-modify-write pass and is
    /// idempotent by child id.
    pub fn save(&self, result: &SearchResult) {
        let mut stored = result.clone();
        stored.replies = stored
            .replies
            .iter()
            .map(|reply| Reply::Stub(stub_of(reply)))
            .collect();

        let entry = CacheEntry::new(stored, self.ttl_ms);
        match serde_json::to_string(&entry) {
            Ok(json) => {
                if let Err(e) = self.kv.put(&conv_key(&result.id), &json) {
                    log::warn!("failed to persist result {}: {e}", result.id);
                    return;
                }
            }
            Err(e) => {
                log::warn!("failed to serialize result {}: {e}", result.id);
                return;
            }
        }

        if let Some(parent_id) = &result.parent_id {
            self.append_reply_stub(parent_id, result);
        }
    }

    /// The stored node, iff it has not expired. Expired entries are
    /// removed on the way out.
    pub fn get(&self, id: &str) -> Option<SearchResult> {
        let key = conv_key(id);
        let json = match self.kv.get(&key) {
            Ok(Some(json)) => json,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("failed to read entry {id}: {e}");
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&json) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("failed to parse entry {id}: {e}");
                return None;
            }
        };

        if entry.is_expired(now_ms()) {
            if let Err(e) = self.kv.delete(&key) {
                log::warn!("failed to remove expired entry {id}: {e}");
            }
            return None;
        }
        Some(entry.value)
    }

    /// The thread rooted at `root_id`, with replies recursively expanded.
    ///
    /// Missing or expired children stay as stubs and the traversal does
    /// not continue beyond them. A node is never entered twice within one
    /// expansion.
    pub fn get_thread(&self, root_id: &str) -> Option<SearchResult> {
        let root = self.get(root_id)?;
        let mut visited = HashSet::new();
        visited.insert(root.id.clone());
        Some(self.expand(root, &mut visited))
    }

    fn expand(&self, mut node: SearchResult, visited: &mut HashSet<String>) -> SearchResult {
        node.replies = node
            .replies
            .into_iter()
            .map(|reply| {
                let id = reply.id().to_string();
                if !visited.insert(id.clone()) {
                    return Reply::Stub(stub_of(&reply));
                }
                match self.get(&id) {
                    Some(child) => Reply::Full(Box::new(self.expand(child, visited))),
                    None => Reply::Stub(stub_of(&reply)),
                }
            })
            .collect();
        node
    }

    /// Every non-expired envelope. Diagnostics and the legacy sync path.
    pub fn get_all_entries(&self) -> Vec<CacheEntry> {
        let keys = match self.kv.keys_with_prefix(CONV_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                log::warn!("failed to scan stored entries: {e}");
                return Vec::new();
            }
        };

        let now = now_ms();
        let mut entries = Vec::new();
        for key in keys {
            let json = match self.kv.get(&key) {
                Ok(Some(json)) => json,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("failed to read entry {key}: {e}");
                    continue;
                }
            };
            match serde_json::from_str::<CacheEntry>(&json) {
                Ok(entry) if !entry.is_expired(now) => entries.push(entry),
                Ok(_) => {}
                Err(e) => log::warn!("failed to parse entry {key}: {e}"),
            }
        }
        entries
    }

    /// Remove one stored node.
    pub fn delete(&self, id: &str) {
        if let Err(e) = self.kv.delete(&conv_key(id)) {
            log::warn!("failed to delete entry {id}: {e}");
        }
    }

    /// Drop every stored node.
    pub fn clear(&self) {
        match self.kv.keys_with_prefix(CONV_PREFIX) {
            Ok(keys) => {
                for key in keys {
                    if let Err(e) = self.kv.delete(&key) {
                        log::warn!("failed to delete entry {key}: {e}");
                    }
                }
            }
            Err(e) => log::warn!("failed to scan stored entries: {e}"),
        }
    }

    fn append_reply_stub(&self, parent_id: &str, child: &SearchResult) {
        let key = conv_key(parent_id);
        let json = match self.kv.get(&key) {
            Ok(Some(json)) => json,
            Ok(None) => {
                log::warn!("parent {parent_id} missing while saving reply {}", child.id);
                return;
            }
            Err(e) => {
                log::warn!("failed to read parent {parent_id}: {e}");
                return;
            }
        };

        let mut entry: CacheEntry = match serde_json::from_str(&json) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("failed to parse parent {parent_id}: {e}");
                return;
            }
        };

        if entry.value.replies.iter().any(|r| r.id() == child.id) {
            return;
        }
        entry.value.replies.push(Reply::Stub(child.stub()));
        entry.timestamp = now_ms();
        entry.expires_at = entry.timestamp + self.ttl_ms;

        match serde_json::to_string(&entry) {
            Ok(json) => {
                if let Err(e) = self.kv.put(&key, &json) {
                    log::warn!("failed to update parent {parent_id}: {e}");
                }
            }
            Err(e) => log::warn!("failed to serialize parent {parent_id}: {e}"),
        }
    }
}

fn stub_of(reply: &Reply) -> ReplyStub {
    match reply {
        Reply::Full(r) => r.stub(),
        Reply::Stub(s) => s.clone(),
    }
}

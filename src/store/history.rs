//! Search history index: most-recent 50 queries, deduplicated by text.

use std::sync::Arc;

use crate::store::kv::KvStore;
use crate::types::SearchHistoryItem;

/// Storage key for the serialized history list.
pub const HISTORY_KEY: &str = "search-history";

/// Maximum number of retained entries.
pub const HISTORY_LIMIT: usize = 50;

/// Bounded, query-deduplicated history over the page store.
///
/// Like the artifact store, the history is advisory: read failures yield
/// an empty list and write failures are logged and swallowed.
pub struct SearchHistory {
    kv: Arc<dyn KvStore>,
}

impl SearchHistory {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Prepend `item`, collapsing any prior entry with the same query and
    /// truncating to [`HISTORY_LIMIT`].
    pub fn save(&self, item: SearchHistoryItem) {
        let mut items = self.get();
        items.retain(|existing| existing.query != item.query);
        items.insert(0, item);
        items.truncate(HISTORY_LIMIT);

        match serde_json::to_string(&items) {
            Ok(json) => {
                if let Err(e) = self.kv.put(HISTORY_KEY, &json) {
                    log::warn!("failed to persist search history: {e}");
                }
            }
            Err(e) => log::warn!("failed to serialize search history: {e}"),
        }
    }

    /// The history, most recent first. Empty on any read failure.
    pub fn get(&self) -> Vec<SearchHistoryItem> {
        match self.kv.get(HISTORY_KEY) {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                log::warn!("failed to parse search history, resetting: {e}");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("failed to read search history: {e}");
                Vec::new()
            }
        }
    }

    pub fn clear(&self) {
        if let Err(e) = self.kv.delete(HISTORY_KEY) {
            log::warn!("failed to clear search history: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::MemoryKv;
    use crate::util::now_ms;

    fn item(id: &str, query: &str) -> SearchHistoryItem {
        SearchHistoryItem {
            id: id.to_string(),
            query: query.to_string(),
            timestamp: now_ms(),
            result_id: id.to_string(),
        }
    }

    fn history() -> SearchHistory {
        SearchHistory::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn test_prepend_order() {
        let history = history();
        history.save(item("a", "first"));
        history.save(item("b", "second"));

        let items = history.get();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].query, "second");
        assert_eq!(items[1].query, "first");
    }

    #[test]
    fn test_dedup_by_query_keeps_latest() {
        let history = history();
        history.save(item("a", "rust async"));
        history.save(item("b", "other"));
        let mut repeat = item("c", "rust async");
        repeat.timestamp += 10;
        history.save(repeat);

        let items = history.get();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].query, "rust async");
        assert_eq!(items[0].id, "c");
        let queries: Vec<_> = items.iter().map(|i| i.query.as_str()).collect();
        assert_eq!(queries.iter().filter(|q| **q == "rust async").count(), 1);
    }

    #[test]
    fn test_truncates_to_limit() {
        let history = history();
        for i in 0..60 {
            history.save(item(&format!("id-{i}"), &format!("query {i}")));
        }
        let items = history.get();
        assert_eq!(items.len(), HISTORY_LIMIT);
        assert_eq!(items[0].query, "query 59");
        assert_eq!(items[HISTORY_LIMIT - 1].query, "query 10");
    }

    #[test]
    fn test_clear() {
        let history = history();
        history.save(item("a", "q"));
        history.clear();
        assert!(history.get().is_empty());
    }
}

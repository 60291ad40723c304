//! Environment-derived configuration.
//!
//! Every setting is optional: a missing similarity or LLM configuration
//! disables that tier instead of failing startup, and the webhook URL is
//! only ever read on the page side (the worker is parameterized per
//! submission and holds no long-lived copy).

use std::env;
use std::path::PathBuf;

/// Configuration snapshot for the sync core, read once from the process
/// environment.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    /// Vector/result store base URL (similarity tier).
    pub supabase_url: Option<String>,
    /// Vector/result store credential.
    pub supabase_key: Option<String>,
    /// LLM ingress.
    pub edge_function_url: Option<String>,
    /// Destination for sync submissions.
    pub webhook_url: Option<String>,
    /// Similarity ingress endpoint.
    pub similarity_query_url: Option<String>,
    /// Similarity ingress credential.
    pub similarity_api_key: Option<String>,
    /// Legacy periodic-sync hint in seconds. Parsed for completeness; the
    /// push-first design does not schedule on it.
    pub sync_interval: Option<u64>,
    /// Base directory for the per-context SQLite files.
    pub data_dir: PathBuf,
}

impl SyncConfig {
    /// Read configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            supabase_url: env_opt("SUPABASE_URL"),
            supabase_key: env_opt("SUPABASE_KEY"),
            edge_function_url: env_opt("SUPABASE_EDGE_FUNCTION_URL"),
            webhook_url: env_opt("CACHE_WEBHOOK_URL"),
            similarity_query_url: env_opt("CACHE_SIMILARITY_QUERY"),
            similarity_api_key: env_opt("CACHE_SIMILARITY_API_KEY"),
            sync_interval: env_opt("CACHE_SYNC_INTERVAL").and_then(|v| v.parse().ok()),
            data_dir: env_opt("CACHESYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_data_dir),
        }
    }

    /// Whether the similarity tier can run.
    pub fn similarity_enabled(&self) -> bool {
        self.supabase_url.is_some()
            && self.supabase_key.is_some()
            && self.similarity_query_url.is_some()
    }

    /// Path of the page-context store file.
    pub fn page_db_path(&self) -> PathBuf {
        self.data_dir.join("page_store.db")
    }

    /// Path of the worker-context store file.
    pub fn worker_db_path(&self) -> PathBuf {
        self.data_dir.join("worker_store.db")
    }
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Platform data directory for the crate's SQLite files.
///
/// Linux: `~/.local/share/cachesync`, macOS: `~/Library/Application
/// Support/cachesync`, Windows: `%LOCALAPPDATA%\cachesync`, else `/tmp`.
fn default_data_dir() -> PathBuf {
    let app_name = "cachesync";
    if cfg!(target_os = "linux") {
        let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".local").join("share").join(app_name)
    } else if cfg!(target_os = "macos") {
        let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home)
            .join("Library")
            .join("Application Support")
            .join(app_name)
    } else if cfg!(target_os = "windows") {
        let local = env::var("LOCALAPPDATA")
            .or_else(|_| env::var("APPDATA"))
            .unwrap_or_else(|_| "C:\\tmp".to_string());
        PathBuf::from(local).join(app_name)
    } else {
        PathBuf::from("/tmp").join(app_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_settings_disable_tiers() {
        let config = SyncConfig::default();
        assert!(!config.similarity_enabled());
        assert!(config.webhook_url.is_none());
    }

    #[test]
    fn test_db_paths_live_under_data_dir() {
        let config = SyncConfig {
            data_dir: PathBuf::from("/tmp/cachesync-test"),
            ..Default::default()
        };
        assert_eq!(
            config.page_db_path(),
            PathBuf::from("/tmp/cachesync-test/page_store.db")
        );
        assert_eq!(
            config.worker_db_path(),
            PathBuf::from("/tmp/cachesync-test/worker_store.db")
        );
    }
}

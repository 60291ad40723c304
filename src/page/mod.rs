//! The page (foreground) context.
//!
//! The page owns the artifact store, the search history, and the browser
//! fingerprint; it talks to the worker only through [`PageBus`] messages
//! and the fire-and-forget sync client. A missing or mid-upgrade worker
//! never blocks anything here: posts are held by the bus, and sync
//! submissions wait on the handshake gate off the UI path.

pub mod bus;

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::Request;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

pub use bus::PageBus;

use crate::config::SyncConfig;
use crate::messages::{ClientMessage, WorkerMessage};
use crate::store::kv::{KvStore, SqliteKv};
use crate::store::{ArtifactStore, SearchHistory};
use crate::types::SyncPayload;
use crate::worker::{SyncStatus, WorkerRegistry, SYNC_ENDPOINT, SYNC_TAG};

/// Page KV key the fingerprint lives under.
pub const FINGERPRINT_KEY: &str = "searchGptFingerprintId";

/// The stored fingerprint, created on first load.
///
/// An opaque v4 identifier for server-side session correlation; it is
/// never sent to the LLM. Storage failures fall back to a fresh value
/// per call rather than failing the page.
pub fn fingerprint_id(kv: &dyn KvStore) -> String {
    match kv.get(FINGERPRINT_KEY) {
        Ok(Some(id)) if !id.is_empty() => return id,
        Ok(_) => {}
        Err(e) => log::warn!("failed to read fingerprint: {e}"),
    }
    let id = Uuid::new_v4().to_string();
    if let Err(e) = kv.put(FINGERPRINT_KEY, &id) {
        log::warn!("failed to persist fingerprint: {e}");
    }
    id
}

/// Fire-and-forget submission client over the magic sync path.
#[derive(Clone)]
pub struct SyncClient {
    bus: PageBus,
}

impl SyncClient {
    pub fn new(bus: PageBus) -> Self {
        Self { bus }
    }

    /// Submit a payload for delivery to `webhook_url`.
    ///
    /// Waits for the handshake gate, then posts to the magic local path,
    /// which the controlling worker intercepts. The returned status text
    /// is informational; from the page's perspective this cannot fail.
    pub async fn submit(&self, webhook_url: &str, payload: &SyncPayload) -> String {
        self.bus.ready().await;
        let Some(handle) = self.bus.current_controller() else {
            log::warn!("sync submission with no controlling worker, dropping");
            return SyncStatus::Queued.message().to_string();
        };

        let body = serde_json::json!({
            "webhookUrl": webhook_url,
            "payload": payload,
        });
        let request = Request::builder()
            .method("POST")
            .uri(SYNC_ENDPOINT)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()));
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                log::error!("failed to build sync request: {e}");
                return SyncStatus::Queued.message().to_string();
            }
        };

        match handle.fetch(request).await {
            Ok(response) => parse_status(response).await,
            Err(e) => {
                log::warn!("sync fetch did not reach the worker: {e}");
                SyncStatus::Queued.message().to_string()
            }
        }
    }
}

async fn parse_status(response: axum::response::Response) -> String {
    let fallback = || SyncStatus::Queued.message().to_string();
    let bytes = match axum::body::to_bytes(response.into_body(), 64 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => return fallback(),
    };
    serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|v| v.get("status").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(fallback)
}

/// Everything a page session owns, wired together.
pub struct PageRuntime {
    pub store: Arc<ArtifactStore>,
    pub history: Arc<SearchHistory>,
    pub fingerprint_id: String,
    bus: PageBus,
}

impl PageRuntime {
    /// Bring up the page over its private KV and attach it to the worker
    /// registry. Also registers the background-sync tag, as every page
    /// load does.
    pub fn new(kv: Arc<dyn KvStore>, registry: &WorkerRegistry) -> Self {
        let store = Arc::new(ArtifactStore::new(kv.clone()));
        let history = Arc::new(SearchHistory::new(kv.clone()));
        let fingerprint_id = fingerprint_id(kv.as_ref());
        registry.register_background_sync(SYNC_TAG);
        let bus = PageBus::attach(registry);
        Self {
            store,
            history,
            fingerprint_id,
            bus,
        }
    }

    /// Bring up the page over its configured durable store.
    pub fn from_config(
        config: &SyncConfig,
        registry: &WorkerRegistry,
    ) -> Result<Self, anyhow::Error> {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::new(config.page_db_path())?);
        Ok(Self::new(kv, registry))
    }

    /// Resolve once the controlling worker has answered the handshake.
    pub async fn ready(&self) {
        self.bus.ready().await
    }

    pub fn bus(&self) -> &PageBus {
        &self.bus
    }

    pub fn sync_client(&self) -> SyncClient {
        SyncClient::new(self.bus.clone())
    }

    /// Post a message to the worker through the bus.
    pub fn post(&self, message: ClientMessage) {
        self.bus.post(message)
    }

    /// Worker-to-page notifications.
    pub fn notifications(&self) -> broadcast::Receiver<WorkerMessage> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::MemoryKv;
    use crate::types::SearchResult;
    use crate::worker::engine::testing::FakeWebhook;
    use crate::worker::{WorkerScript, WorkerState};
    use std::time::Duration;

    fn script(version: &str, dir: &std::path::Path, webhook: Arc<FakeWebhook>) -> WorkerScript {
        WorkerScript::new(version, dir.to_path_buf())
            .with_transport(webhook)
            .with_webhook_url("https://hooks.example/sync")
    }

    fn payload(marker: &str) -> SyncPayload {
        let mut result = SearchResult::new_root(marker, marker, "body");
        result.category = "Technology".to_string();
        SyncPayload {
            results: vec![result],
            user_id: Some("user-1".to_string()),
            fingerprint_id: "fp-1".to_string(),
        }
    }

    #[test]
    fn test_fingerprint_created_once() {
        let kv = MemoryKv::new();
        let first = fingerprint_id(&kv);
        let second = fingerprint_id(&kv);
        assert_eq!(first, second);
        assert_eq!(kv.get(FINGERPRINT_KEY).unwrap().as_deref(), Some(first.as_str()));
    }

    #[tokio::test]
    async fn test_from_config_opens_configured_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let registry = WorkerRegistry::new();
        let page = PageRuntime::from_config(&config, &registry).unwrap();
        assert!(!page.fingerprint_id.is_empty());
        assert!(config.page_db_path().exists());
    }

    #[tokio::test]
    async fn test_handshake_resolves_ready() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new();
        let page = PageRuntime::new(Arc::new(MemoryKv::new()), &registry);

        let webhook = Arc::new(FakeWebhook::new());
        registry.register(script("v1", dir.path(), webhook)).unwrap();

        page.ready().await;
        assert!(page.bus().is_ready());
        assert_eq!(page.bus().current_controller().unwrap().version, "v1");
    }

    #[tokio::test]
    async fn test_submit_roundtrip_reports_success() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new();
        let page = PageRuntime::new(Arc::new(MemoryKv::new()), &registry);
        let webhook = Arc::new(FakeWebhook::new());
        registry.register(script("v1", dir.path(), webhook.clone())).unwrap();

        let status = page
            .sync_client()
            .submit("https://hooks.example/sync", &payload("a"))
            .await;
        assert_eq!(status, "Sync successful");
        assert_eq!(webhook.accepted_ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_sync_success_notification_reaches_page() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new();
        let page = PageRuntime::new(Arc::new(MemoryKv::new()), &registry);
        let webhook = Arc::new(FakeWebhook::new());
        registry.register(script("v1", dir.path(), webhook)).unwrap();

        page.ready().await;
        let mut notifications = page.notifications();
        page.sync_client()
            .submit("https://hooks.example/sync", &payload("a"))
            .await;

        loop {
            match notifications.recv().await.unwrap() {
                WorkerMessage::SyncSuccess => break,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_messages_buffer_until_worker_exists() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new();
        let page = PageRuntime::new(Arc::new(MemoryKv::new()), &registry);

        let mut result = SearchResult::new_root("held-1", "t", "c");
        result.category = "Technology".to_string();
        page.post(ClientMessage::CacheNewEntry {
            results: vec![result],
        });
        assert_eq!(page.bus().pending_len(), 1);

        let webhook = Arc::new(FakeWebhook::new());
        registry.register(script("v1", dir.path(), webhook.clone())).unwrap();
        page.ready().await;

        for _ in 0..100 {
            if !webhook.accepted_ids().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(webhook.accepted_ids(), vec!["held-1"]);
        assert_eq!(page.bus().pending_len(), 0);
    }

    #[tokio::test]
    async fn test_worker_upgrade_keeps_page_working() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new();
        let page = PageRuntime::new(Arc::new(MemoryKv::new()), &registry);
        let webhook = Arc::new(FakeWebhook::new());

        let v1 = registry.register(script("v1", dir.path(), webhook.clone())).unwrap();
        page.ready().await;

        let v2 = registry.register(script("v2", dir.path(), webhook.clone())).unwrap();
        v2.wait_for(WorkerState::Activated).await;
        v1.wait_for(WorkerState::Redundant).await;

        // Ready stays resolved, and traffic now lands on the new worker.
        assert!(page.bus().is_ready());
        let status = page
            .sync_client()
            .submit("https://hooks.example/sync", &payload("after-upgrade"))
            .await;
        assert_eq!(status, "Sync successful");
        assert_eq!(page.bus().current_controller().unwrap().version, "v2");
        assert_eq!(webhook.accepted_ids(), vec!["after-upgrade"]);
    }
}

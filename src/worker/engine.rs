//! Background Sync Engine: deliver-or-enqueue and FIFO replay.
//!
//! Every submission takes the same path whether it arrived through the
//! intercepted sync route, a legacy message, or the early-submission
//! buffer: try a live POST to its webhook, and on any failure park it in
//! the durable queue. The submitting page always hears success; retries
//! are entirely the worker's problem.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SyncError;
use crate::messages::{ClientPort, WorkerMessage};
use crate::store::kv::{KvStore, SqliteKv};
use crate::types::{SyncPayload, SyncSubmission};
use crate::util::{http_client, now_ms};
use crate::worker::queue::{SyncCursor, SyncQueue};

/// Outcome reported to the intercepted sync route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// The webhook accepted the payload on the live attempt.
    Delivered,
    /// The payload is parked in the durable queue (or was dropped).
    Queued,
}

impl SyncStatus {
    /// The wire message the page sees.
    pub fn message(&self) -> &'static str {
        match self {
            SyncStatus::Delivered => "Sync successful",
            SyncStatus::Queued => "Request queued for sync",
        }
    }
}

/// Seam over the live webhook POST.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// POST `payload` as JSON to `url`. `Ok` carries the HTTP status;
    /// `Err` means the host was unreachable.
    async fn deliver(&self, url: &str, payload: &SyncPayload) -> Result<u16, SyncError>;
}

/// Production transport over the shared HTTP client.
pub struct HttpWebhook;

#[async_trait]
impl WebhookTransport for HttpWebhook {
    async fn deliver(&self, url: &str, payload: &SyncPayload) -> Result<u16, SyncError> {
        let response = http_client()
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

/// Worker-owned sync state: durable queue, delivery cursor, connected
/// clients, and the pre-activation submission buffer.
pub struct SyncEngine {
    queue: SyncQueue,
    cursor: SyncCursor,
    webhook: Arc<dyn WebhookTransport>,
    clients: Mutex<Vec<ClientPort>>,
    early: Mutex<Vec<SyncSubmission>>,
    activated: AtomicBool,
}

impl SyncEngine {
    /// Open the engine over the worker's durable storage in `data_dir`.
    pub fn new(data_dir: &Path, webhook: Arc<dyn WebhookTransport>) -> Result<Self, anyhow::Error> {
        let queue = SyncQueue::new(data_dir.join("sync_queue.db"))?;
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::new(data_dir.join("worker_store.db"))?);
        Ok(Self::with_parts(queue, SyncCursor::new(kv), webhook))
    }

    /// Assemble from explicit parts.
    pub fn with_parts(
        queue: SyncQueue,
        cursor: SyncCursor,
        webhook: Arc<dyn WebhookTransport>,
    ) -> Self {
        Self {
            queue,
            cursor,
            webhook,
            clients: Mutex::new(Vec::new()),
            early: Mutex::new(Vec::new()),
            activated: AtomicBool::new(false),
        }
    }

    /// Register a page port for broadcasts.
    pub fn add_client(&self, port: ClientPort) {
        let mut clients = self.clients.lock();
        clients.retain(|c| !c.is_closed());
        if !clients.iter().any(|c| c.same_channel(&port)) {
            clients.push(port);
        }
    }

    pub fn has_clients(&self) -> bool {
        self.clients.lock().iter().any(|c| !c.is_closed())
    }

    /// Post `message` to every connected page.
    pub fn broadcast(&self, message: WorkerMessage) {
        let mut clients = self.clients.lock();
        clients.retain(|c| c.send(message).is_ok());
    }

    /// Mark activation complete. Submissions received before this point
    /// sit in the early buffer until a client posts `CLIENT_READY`.
    pub fn set_activated(&self) {
        self.activated.store(true, Ordering::SeqCst);
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    /// Records currently parked in the durable queue.
    pub fn queue_len(&self) -> usize {
        self.queue.len().unwrap_or(0)
    }

    /// Take in one submission: buffer it pre-activation, otherwise try a
    /// live delivery and park it on failure. Never fails outward.
    pub async fn submit(&self, submission: SyncSubmission) -> SyncStatus {
        if !self.is_activated() {
            self.early.lock().push(submission);
            return SyncStatus::Queued;
        }
        self.deliver_or_enqueue(submission).await
    }

    /// Flush submissions buffered before activation.
    pub async fn drain_early(&self) {
        let buffered: Vec<SyncSubmission> = std::mem::take(&mut *self.early.lock());
        for submission in buffered {
            self.deliver_or_enqueue(submission).await;
        }
    }

    async fn deliver_or_enqueue(&self, submission: SyncSubmission) -> SyncStatus {
        match self
            .webhook
            .deliver(&submission.webhook_url, &submission.payload)
            .await
        {
            Ok(status) if (200..300).contains(&status) => {
                self.cursor.advance(&submission.payload.results);
                self.broadcast(WorkerMessage::SyncSuccess);
                SyncStatus::Delivered
            }
            Ok(status) if (400..500).contains(&status) => {
                log::warn!("webhook refused submission with {status}, queueing one retry");
                self.enqueue(submission, 1);
                SyncStatus::Queued
            }
            Ok(status) => {
                log::warn!("webhook answered {status}, queueing for replay");
                self.enqueue(submission, 0);
                SyncStatus::Queued
            }
            Err(e) => {
                log::info!("webhook unreachable, queueing for replay: {e}");
                self.enqueue(submission, 0);
                SyncStatus::Queued
            }
        }
    }

    fn enqueue(&self, submission: SyncSubmission, refusals: u32) {
        if let Err(e) = self.queue.push(&submission, refusals) {
            log::error!("failed to park sync submission, record lost: {e}");
        }
    }

    /// Replay the queue FIFO.
    ///
    /// Expired records are dropped up front. A transient failure leaves
    /// the record at the head and reports [`SyncError::ReplayInterrupted`]
    /// so the platform reschedules; a second 4xx drops the record.
    /// Returns the number of records delivered.
    pub async fn drain(&self) -> Result<usize, SyncError> {
        match self.queue.drop_expired(now_ms()) {
            Ok(0) => {}
            Ok(dropped) => log::warn!("dropped {dropped} sync records past retention"),
            Err(e) => log::warn!("failed to expire sync records: {e}"),
        }

        let mut delivered = 0usize;
        loop {
            let record = match self.queue.peek() {
                Ok(Some(record)) => record,
                Ok(None) => return Ok(delivered),
                Err(e) => return Err(SyncError::Storage(e)),
            };

            match self
                .webhook
                .deliver(&record.submission.webhook_url, &record.submission.payload)
                .await
            {
                Ok(status) if (200..300).contains(&status) => {
                    if let Err(e) = self.queue.remove(record.id) {
                        // Leave it; the webhook is expected to dedup by id.
                        return Err(SyncError::Storage(e));
                    }
                    self.cursor.advance(&record.submission.payload.results);
                    self.broadcast(WorkerMessage::SyncSuccess);
                    delivered += 1;
                }
                Ok(status) if (400..500).contains(&status) => {
                    let refusals = self.queue.record_refusal(record.id).unwrap_or(u32::MAX);
                    if refusals >= 2 {
                        log::warn!(
                            "webhook refused record {} twice ({status}), dropping it",
                            record.id
                        );
                        if let Err(e) = self.queue.remove(record.id) {
                            return Err(SyncError::Storage(e));
                        }
                    } else {
                        return Err(SyncError::ReplayInterrupted {
                            remaining: self.queue_len(),
                        });
                    }
                }
                Ok(status) => {
                    log::info!("webhook answered {status} on replay, keeping record at head");
                    return Err(SyncError::ReplayInterrupted {
                        remaining: self.queue_len(),
                    });
                }
                Err(e) => {
                    log::info!("webhook unreachable on replay: {e}");
                    return Err(SyncError::ReplayInterrupted {
                        remaining: self.queue_len(),
                    });
                }
            }
        }
    }

    /// The stored delivery watermark.
    pub fn last_sync_timestamp(&self) -> i64 {
        self.cursor.get()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeWebhook, Scripted};
    use super::*;
    use crate::store::kv::MemoryKv;
    use crate::types::SearchResult;

    fn submission(marker: &str) -> SyncSubmission {
        let mut result = SearchResult::new_root(marker, marker, "body");
        result.category = "Technology".to_string();
        SyncSubmission::new(
            "https://hooks.example/sync",
            SyncPayload {
                results: vec![result],
                user_id: Some("user-1".to_string()),
                fingerprint_id: "fp-1".to_string(),
            },
        )
    }

    fn engine_with(webhook: Arc<FakeWebhook>) -> (tempfile::TempDir, SyncEngine) {
        let dir = tempfile::tempdir().unwrap();
        let queue = SyncQueue::new(dir.path().join("queue.db")).unwrap();
        let cursor = SyncCursor::new(Arc::new(MemoryKv::new()));
        let engine = SyncEngine::with_parts(queue, cursor, webhook);
        engine.set_activated();
        (dir, engine)
    }

    #[tokio::test]
    async fn test_live_delivery_broadcasts_success() {
        let webhook = Arc::new(FakeWebhook::new());
        let (_dir, engine) = engine_with(webhook.clone());

        let (port, mut inbox) = tokio::sync::mpsc::unbounded_channel();
        engine.add_client(port);

        let status = engine.submit(submission("a")).await;
        assert_eq!(status, SyncStatus::Delivered);
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(webhook.accepted_ids(), vec!["a"]);
        assert_eq!(inbox.recv().await, Some(WorkerMessage::SyncSuccess));
    }

    #[tokio::test]
    async fn test_unreachable_webhook_parks_submission() {
        let webhook = Arc::new(FakeWebhook::new());
        webhook.script([Scripted::Unreachable]);
        let (_dir, engine) = engine_with(webhook.clone());

        let status = engine.submit(submission("a")).await;
        assert_eq!(status, SyncStatus::Queued);
        assert_eq!(engine.queue_len(), 1);
        assert!(webhook.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_drain_replays_fifo() {
        let webhook = Arc::new(FakeWebhook::new());
        webhook.script([Scripted::Unreachable, Scripted::Unreachable]);
        let (_dir, engine) = engine_with(webhook.clone());

        engine.submit(submission("first")).await;
        engine.submit(submission("second")).await;
        assert_eq!(engine.queue_len(), 2);

        let delivered = engine.drain().await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(webhook.accepted_ids(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_drain_interruption_keeps_head() {
        let webhook = Arc::new(FakeWebhook::new());
        webhook.script([
            Scripted::Unreachable, // live attempt for "a"
            Scripted::Unreachable, // live attempt for "b"
            Scripted::Status(200), // replay of "a"
            Scripted::Unreachable, // replay of "b" fails again
        ]);
        let (_dir, engine) = engine_with(webhook.clone());

        engine.submit(submission("a")).await;
        engine.submit(submission("b")).await;

        let err = engine.drain().await.unwrap_err();
        assert!(matches!(err, SyncError::ReplayInterrupted { remaining: 1 }));
        assert_eq!(engine.queue_len(), 1);
        assert_eq!(
            engine.drain().await.unwrap(),
            1,
            "head record delivers on the next drain"
        );
        assert_eq!(webhook.accepted_ids(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_second_refusal_drops_record() {
        let webhook = Arc::new(FakeWebhook::new());
        webhook.script([
            Scripted::Status(400), // live attempt: first refusal, queued
            Scripted::Status(400), // replay: second refusal, dropped
        ]);
        let (_dir, engine) = engine_with(webhook.clone());

        engine.submit(submission("a")).await;
        assert_eq!(engine.queue_len(), 1);

        let delivered = engine.drain().await.unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(engine.queue_len(), 0, "misconfigured submission dropped");
    }

    #[tokio::test]
    async fn test_server_errors_stay_transient() {
        let webhook = Arc::new(FakeWebhook::new());
        webhook.script([Scripted::Status(503), Scripted::Status(503)]);
        let (_dir, engine) = engine_with(webhook.clone());

        engine.submit(submission("a")).await;
        assert!(engine.drain().await.is_err());
        assert_eq!(engine.queue_len(), 1, "5xx never drops the record");
    }

    #[tokio::test]
    async fn test_early_submissions_wait_for_client_ready() {
        let webhook = Arc::new(FakeWebhook::new());
        let dir = tempfile::tempdir().unwrap();
        let queue = SyncQueue::new(dir.path().join("queue.db")).unwrap();
        let engine = SyncEngine::with_parts(
            queue,
            SyncCursor::new(Arc::new(MemoryKv::new())),
            webhook.clone(),
        );

        let status = engine.submit(submission("early")).await;
        assert_eq!(status, SyncStatus::Queued);
        assert!(webhook.delivered().is_empty());

        engine.set_activated();
        engine.drain_early().await;
        assert_eq!(webhook.accepted_ids(), vec!["early"]);
    }

    #[tokio::test]
    async fn test_queue_survives_engine_restart() {
        let webhook = Arc::new(FakeWebhook::new());
        webhook.script([Scripted::Unreachable]);
        let dir = tempfile::tempdir().unwrap();

        {
            let engine = SyncEngine::new(dir.path(), webhook.clone()).unwrap();
            engine.set_activated();
            engine.submit(submission("survivor")).await;
            assert_eq!(engine.queue_len(), 1);
        }

        // A fresh engine over the same directory finds and replays it.
        let engine = SyncEngine::new(dir.path(), webhook.clone()).unwrap();
        engine.set_activated();
        assert_eq!(engine.queue_len(), 1);
        assert_eq!(engine.drain().await.unwrap(), 1);
        assert_eq!(webhook.accepted_ids(), vec!["survivor"]);
    }

    #[tokio::test]
    async fn test_cursor_advances_on_acceptance() {
        let webhook = Arc::new(FakeWebhook::new());
        let (_dir, engine) = engine_with(webhook);

        let before = engine.last_sync_timestamp();
        assert_eq!(before, 0);
        engine.submit(submission("a")).await;
        assert!(engine.last_sync_timestamp() > 0);
    }
}

//! The background worker context.
//!
//! A worker is a page-independent task with its own durable storage: the
//! delivery cursor in a private KV file and the outbound submission queue
//! on disk. It owns the intercept surface for the magic sync path,
//! answers the page handshake, and replays the queue whenever the
//! platform allows. Nothing in here touches page-owned storage; data
//! arrives only by message or intercepted fetch.

pub mod engine;
pub mod lifecycle;
pub mod queue;
pub mod routes;

pub use engine::{HttpWebhook, SyncEngine, SyncStatus, WebhookTransport};
pub use lifecycle::{WorkerHandle, WorkerRegistry, WorkerScript, WorkerState, SYNC_TAG};
pub use queue::{QueueRecord, SyncCursor, SyncQueue, LAST_SYNC_KEY, QUEUE_RETENTION_MS};
pub use routes::{sync_router, SYNC_ENDPOINT};

//! # cachesync
//!
//! Offline-durable cache synchronization core for an AI search client.
//!
//! The crate captures locally-produced search artifacts, threads and
//! deduplicates them, and delivers them to a remote orchestrator webhook
//! with at-least-once semantics across offline periods, restarts, and
//! stale worker versions. It is split along the two execution contexts of
//! the client:
//!
//! - the **page** owns the artifact store, search history, and browser
//!   fingerprint, and fires submissions at a magic local path;
//! - the **background worker** intercepts that path, owns the durable
//!   outbound queue and delivery cursor, and replays the queue whenever
//!   the platform allows.
//!
//! The contexts share no state; they exchange tagged messages
//! (`PING`/`PONG`/`CLIENT_READY`/...) and intercepted requests only, and
//! all worker-bound traffic is gated on the handshake so a stale worker
//! version can never handle data meant for newer code.

pub mod config;
pub mod error;
pub mod llm;
pub mod messages;
pub mod orchestrator;
pub mod page;
pub mod similarity;
pub mod store;
pub mod types;
pub mod util;
pub mod worker;

pub use config::SyncConfig;
pub use error::{CacheError, LifecycleError, LlmError, SyncError};
pub use messages::{ClientMessage, WorkerMessage};
pub use orchestrator::SearchOrchestrator;
pub use page::{PageBus, PageRuntime, SyncClient};
pub use similarity::SimilarityGateway;
pub use store::{ArtifactStore, SearchHistory};
pub use types::{CacheEntry, SearchHistoryItem, SearchResult, SyncPayload, SyncSubmission};
pub use worker::{SyncEngine, SyncStatus, WorkerHandle, WorkerRegistry, WorkerScript, WorkerState};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

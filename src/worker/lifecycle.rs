//! Worker lifecycle: registration, activation, replacement.
//!
//! A registered worker walks `Registered → Installing → Installed →
//! Activating → Activated`, force-skipping the wait for old clients so
//! the newest code always handles the next message, and claiming the
//! controller slot so pages come under it without a reload. Registering
//! a newer script makes the previous worker `Redundant`; pages observe
//! the controller change and re-run the handshake.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};
use tower::ServiceExt;

use crate::error::LifecycleError;
use crate::messages::{ClientMessage, Envelope, WorkerMessage};
use crate::types::{SyncPayload, SyncSubmission};
use crate::worker::engine::{HttpWebhook, SyncEngine, WebhookTransport};
use crate::worker::routes::sync_router;

/// Background-sync tag registered by pages on load.
pub const SYNC_TAG: &str = "sync-cache";

/// Lifecycle states of a background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Registered,
    Installing,
    /// Installed and nominally waiting; skip-waiting moves straight on.
    Installed,
    Activating,
    /// Activated and controlling clients.
    Activated,
    /// Replaced by a newer version.
    Redundant,
}

/// The "script" a worker version is instantiated from: its version tag,
/// where its durable storage lives, and its transports. The optional
/// webhook URL is build-time configuration for the legacy message path;
/// the modern path carries the URL in every submission body.
#[derive(Clone)]
pub struct WorkerScript {
    pub version: String,
    pub data_dir: PathBuf,
    pub webhook: Arc<dyn WebhookTransport>,
    pub webhook_url: Option<String>,
}

impl WorkerScript {
    pub fn new(version: impl Into<String>, data_dir: PathBuf) -> Self {
        Self {
            version: version.into(),
            data_dir,
            webhook: Arc::new(HttpWebhook),
            webhook_url: None,
        }
    }

    pub fn with_transport(mut self, webhook: Arc<dyn WebhookTransport>) -> Self {
        self.webhook = webhook;
        self
    }

    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }
}

/// Handle to a spawned worker version.
#[derive(Clone)]
pub struct WorkerHandle {
    pub version: String,
    port: mpsc::UnboundedSender<Envelope>,
    router: axum::Router,
    state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    /// Post a message to the worker, naming the page port replies go to.
    pub fn post(
        &self,
        message: ClientMessage,
        source: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Result<(), LifecycleError> {
        self.port
            .send(Envelope { message, source })
            .map_err(|_| LifecycleError::NoController)
    }

    /// Drive the worker's intercept router with one request in-process.
    pub async fn fetch(&self, request: Request<Body>) -> Result<Response, LifecycleError> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .map_err(|_| LifecycleError::NoController)
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Wait until the worker reaches `state`.
    pub async fn wait_for(&self, state: WorkerState) {
        let mut rx = self.state.clone();
        while *rx.borrow() != state {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub(crate) struct RegistryShared {
    controller_tx: watch::Sender<Option<WorkerHandle>>,
    online_tx: watch::Sender<bool>,
    current_stop: Mutex<Option<Arc<Notify>>>,
    sync_tags: Mutex<HashSet<String>>,
}

impl RegistryShared {
    /// Hand the controller slot to `handle`, retiring the previous
    /// worker. Pages subscribed to the controller watch observe this as
    /// their controller-change event.
    fn claim(&self, handle: WorkerHandle, stop: Arc<Notify>) {
        let previous = self.current_stop.lock().replace(stop);
        let _ = self.controller_tx.send(Some(handle));
        if let Some(previous) = previous {
            previous.notify_one();
        }
    }

    pub(crate) fn has_background_sync(&self, tag: &str) -> bool {
        self.sync_tags.lock().contains(tag)
    }
}

/// Registration surface for background workers.
///
/// Registration has auto-update semantics: calling [`register`] again
/// with a newer script spawns the new version, which skip-waits and
/// claims the controller slot from the old one.
///
/// [`register`]: WorkerRegistry::register
pub struct WorkerRegistry {
    shared: Arc<RegistryShared>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        let (controller_tx, _) = watch::channel(None);
        let (online_tx, _) = watch::channel(true);
        Self {
            shared: Arc::new(RegistryShared {
                controller_tx,
                online_tx,
                current_stop: Mutex::new(None),
                sync_tags: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Instantiate and spawn a worker from `script`.
    ///
    /// Returns as soon as the worker exists; activation proceeds
    /// asynchronously and pages learn about it through the controller
    /// watch and the PING/PONG handshake.
    pub fn register(&self, script: WorkerScript) -> Result<WorkerHandle, LifecycleError> {
        let engine = Arc::new(
            SyncEngine::new(&script.data_dir, script.webhook.clone())
                .map_err(LifecycleError::Storage)?,
        );

        let (state_tx, state_rx) = watch::channel(WorkerState::Registered);
        let (port_tx, inbox) = mpsc::unbounded_channel();
        let handle = WorkerHandle {
            version: script.version.clone(),
            port: port_tx,
            router: sync_router(engine.clone()),
            state: state_rx,
        };
        let stop = Arc::new(Notify::new());

        let worker = SyncWorker {
            version: script.version,
            engine,
            inbox,
            state_tx,
            handle: handle.clone(),
            registry: self.shared.clone(),
            stop,
            online: self.shared.online_tx.subscribe(),
            legacy_webhook_url: script.webhook_url,
        };
        tokio::spawn(worker.run());

        Ok(handle)
    }

    /// Watch the controlling worker. `None` until a first activation.
    pub fn controller(&self) -> watch::Receiver<Option<WorkerHandle>> {
        self.shared.controller_tx.subscribe()
    }

    /// Feed the connectivity signal. Workers replay their queue on the
    /// offline→online transition.
    pub fn set_online(&self, online: bool) {
        let _ = self.shared.online_tx.send(online);
    }

    pub fn is_online(&self) -> bool {
        *self.shared.online_tx.subscribe().borrow()
    }

    /// Register a background-sync tag. Always supported on this
    /// platform; callers treat `false` as "replay only while a page is
    /// open".
    pub fn register_background_sync(&self, tag: &str) -> bool {
        self.shared.sync_tags.lock().insert(tag.to_string());
        true
    }
}

/// The worker task: one spawned instance per registered script version.
struct SyncWorker {
    version: String,
    engine: Arc<SyncEngine>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    state_tx: watch::Sender<WorkerState>,
    handle: WorkerHandle,
    registry: Arc<RegistryShared>,
    stop: Arc<Notify>,
    online: watch::Receiver<bool>,
    legacy_webhook_url: Option<String>,
}

impl SyncWorker {
    async fn run(mut self) {
        let _ = self.state_tx.send(WorkerState::Installing);
        tokio::task::yield_now().await;
        let _ = self.state_tx.send(WorkerState::Installed);

        // Skip-waiting is forced: a stale worker answering the handshake
        // would break every sync path built against the new code.
        let _ = self.state_tx.send(WorkerState::Activating);
        self.registry.claim(self.handle.clone(), self.stop.clone());
        self.engine.set_activated();
        let _ = self.state_tx.send(WorkerState::Activated);
        log::info!("worker {} activated and controlling clients", self.version);

        let online = *self.online.borrow();
        if online {
            self.replay_if_eligible().await;
        }

        loop {
            tokio::select! {
                maybe = self.inbox.recv() => match maybe {
                    Some(envelope) => self.handle_message(envelope).await,
                    None => break,
                },
                _ = self.stop.notified() => break,
                changed = self.online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *self.online.borrow();
                    if online {
                        self.replay_if_eligible().await;
                    }
                }
            }
        }

        let _ = self.state_tx.send(WorkerState::Redundant);
        log::info!("worker {} is redundant", self.version);
    }

    async fn handle_message(&self, envelope: Envelope) {
        match envelope.message {
            ClientMessage::Ping => {
                self.engine.add_client(envelope.source.clone());
                if envelope.source.send(WorkerMessage::Pong).is_err() {
                    log::debug!("ping source hung up before pong");
                }
            }
            ClientMessage::ClientReady => {
                self.engine.add_client(envelope.source.clone());
                self.engine.drain_early().await;
            }
            ClientMessage::SyncData { payload } => {
                let _ = envelope.source.send(WorkerMessage::SyncReceived);
                self.legacy_submit(payload).await;
            }
            ClientMessage::CacheNewEntry { results } => {
                let _ = envelope.source.send(WorkerMessage::SyncReceived);
                let payload = SyncPayload {
                    results,
                    user_id: None,
                    fingerprint_id: String::new(),
                };
                self.legacy_submit(payload).await;
            }
        }
    }

    /// Legacy messages converge on the same deliver-or-enqueue path and
    /// double as an explicit replay trigger.
    async fn legacy_submit(&self, payload: SyncPayload) {
        match &self.legacy_webhook_url {
            Some(url) => {
                self.engine
                    .submit(SyncSubmission::new(url.clone(), payload))
                    .await;
            }
            None => log::warn!("legacy sync message without a configured webhook, dropping"),
        }
        if let Err(e) = self.engine.drain().await {
            log::debug!("replay after legacy sync message: {e}");
        }
    }

    /// Replay the queue if the platform would: a sync tag is registered,
    /// or a page is open and connected.
    async fn replay_if_eligible(&self) {
        if !(self.engine.has_clients() || self.registry.has_background_sync(SYNC_TAG)) {
            return;
        }
        match self.engine.drain().await {
            Ok(0) => {}
            Ok(n) => log::info!("replayed {n} queued sync records"),
            Err(e) => log::warn!("sync replay rescheduled: {e}"),
        }
    }
}

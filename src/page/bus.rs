//! Page-side event bus and handshake gate.
//!
//! The bus posts `PING` whenever a controller first appears or changes,
//! resolves its `ready` gate on the first `PONG`, and answers every
//! `PONG` with `CLIENT_READY` so the worker can flush anything it
//! buffered before activation. Messages posted before `ready` are held
//! page-side and forwarded once the handshake completes; nothing is ever
//! dropped on the floor while a worker is missing.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

use crate::messages::{ClientMessage, ClientPort, WorkerMessage};
use crate::worker::{WorkerHandle, WorkerRegistry};

/// Shared page bus. Cloning shares the underlying channel state.
#[derive(Clone)]
pub struct PageBus {
    shared: Arc<BusShared>,
}

struct BusShared {
    controller: watch::Receiver<Option<WorkerHandle>>,
    ready_tx: watch::Sender<bool>,
    port: ClientPort,
    pending: Mutex<Vec<ClientMessage>>,
    notifications: broadcast::Sender<WorkerMessage>,
}

impl BusShared {
    fn current_controller(&self) -> Option<WorkerHandle> {
        self.controller.borrow().clone()
    }

    fn ping(&self) {
        if let Some(handle) = self.current_controller() {
            if handle.post(ClientMessage::Ping, self.port.clone()).is_err() {
                log::debug!("controller gone before ping");
            }
        }
    }

    /// `PONG` resolves the gate (idempotently) and always answers with
    /// `CLIENT_READY` plus any held messages, so a replacement worker
    /// drains its own early buffer too.
    fn on_pong(&self) {
        let _ = self.ready_tx.send(true);
        let Some(handle) = self.current_controller() else {
            return;
        };
        let _ = handle.post(ClientMessage::ClientReady, self.port.clone());
        let held: Vec<ClientMessage> = std::mem::take(&mut *self.pending.lock());
        for message in held {
            if handle.post(message.clone(), self.port.clone()).is_err() {
                self.pending.lock().push(message);
            }
        }
    }
}

impl PageBus {
    /// Attach a bus to the registry's controller watch and start its
    /// listener tasks.
    pub fn attach(registry: &WorkerRegistry) -> Self {
        let controller = registry.controller();
        let (port, port_rx) = mpsc::unbounded_channel();
        let (ready_tx, _) = watch::channel(false);
        let (notifications, _) = broadcast::channel(32);

        let shared = Arc::new(BusShared {
            controller: controller.clone(),
            ready_tx,
            port,
            pending: Mutex::new(Vec::new()),
            notifications,
        });

        tokio::spawn(listen(shared.clone(), port_rx));
        tokio::spawn(follow_controller(shared.clone(), controller));

        Self { shared }
    }

    /// Resolve once the handshake has completed. Stays resolved across
    /// controller changes.
    pub async fn ready(&self) {
        let mut rx = self.shared.ready_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // No sender left: the handshake can never complete.
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.shared.ready_tx.subscribe().borrow()
    }

    /// Post a message to the controlling worker, or hold it until the
    /// handshake completes.
    pub fn post(&self, message: ClientMessage) {
        if self.is_ready() {
            if let Some(handle) = self.shared.current_controller() {
                if handle.post(message.clone(), self.shared.port.clone()).is_ok() {
                    return;
                }
            }
        }
        self.shared.pending.lock().push(message);
    }

    /// The currently controlling worker, if any.
    pub fn current_controller(&self) -> Option<WorkerHandle> {
        self.shared.current_controller()
    }

    /// Subscribe to worker-to-page notifications (`SYNC_SUCCESS` and
    /// friends).
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerMessage> {
        self.shared.notifications.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

/// Forward worker messages into the bus: `PONG` drives the gate, and
/// every message is fanned out to subscribers.
async fn listen(shared: Arc<BusShared>, mut port_rx: mpsc::UnboundedReceiver<WorkerMessage>) {
    while let Some(message) = port_rx.recv().await {
        if message == WorkerMessage::Pong {
            shared.on_pong();
        }
        let _ = shared.notifications.send(message);
    }
}

/// Ping on the first controller and on every controller change.
async fn follow_controller(
    shared: Arc<BusShared>,
    mut controller: watch::Receiver<Option<WorkerHandle>>,
) {
    if controller.borrow().is_some() {
        shared.ping();
    }
    while controller.changed().await.is_ok() {
        if controller.borrow().is_some() {
            shared.ping();
        }
    }
}

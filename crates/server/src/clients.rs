//! Registry of connected control-channel clients.
//!
//! Each client is a live connection that can receive [`ControlReply`]
//! messages and is controlled by at most one generation. Senders are cloned
//! out of the map before delivery so a slow or closed client never holds the
//! lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, mpsc, watch};

use crate::control::ControlReply;

pub type ClientId = u64;

#[derive(Debug)]
struct ClientHandle {
    tx: mpsc::UnboundedSender<ControlReply>,
    controller: Option<String>,
}

#[derive(Debug)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
    next_id: AtomicU64,
    changes: watch::Sender<u64>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self { clients: RwLock::new(HashMap::new()), next_id: AtomicU64::new(1), changes }
    }

    /// Add a client, optionally already controlled by a generation.
    pub async fn register(&self, controller: Option<String>) -> (ClientId, mpsc::UnboundedReceiver<ControlReply>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.write().await.insert(id, ClientHandle { tx, controller: controller.clone() });
        tracing::debug!(client = id, controller = ?controller, "client connected");
        self.bump();
        (id, rx)
    }

    pub async fn unregister(&self, id: ClientId) {
        if self.clients.write().await.remove(&id).is_some() {
            tracing::debug!(client = id, "client disconnected");
            self.bump();
        }
    }

    /// Deliver to one client. Returns false if it is gone.
    pub async fn send(&self, id: ClientId, reply: ControlReply) -> bool {
        let tx = self.clients.read().await.get(&id).map(|c| c.tx.clone());
        match tx {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Deliver to every client connected at the time of the call.
    pub async fn broadcast(&self, reply: ControlReply) -> usize {
        let senders: Vec<_> = self.clients.read().await.values().map(|c| c.tx.clone()).collect();
        senders.into_iter().filter(|tx| tx.send(reply.clone()).is_ok()).count()
    }

    /// Put every connected client under `generation`. Returns how many changed.
    pub async fn claim(&self, generation: &str) -> usize {
        let mut clients = self.clients.write().await;
        let mut claimed = 0;
        for client in clients.values_mut() {
            if client.controller.as_deref() != Some(generation) {
                client.controller = Some(generation.to_string());
                claimed += 1;
            }
        }
        drop(clients);
        if claimed > 0 {
            self.bump();
        }
        claimed
    }

    /// Clients controlled by a generation other than `generation`.
    pub async fn controlled_by_other(&self, generation: &str) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.controller.as_deref().is_some_and(|g| g != generation))
            .count()
    }

    #[cfg(test)]
    pub async fn controller_of(&self, id: ClientId) -> Option<String> {
        self.clients.read().await.get(&id).and_then(|c| c.controller.clone())
    }

    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Ticks whenever a client connects, disconnects or changes controller.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }
}

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Pre-serialized envelope text. Serialized once per fan-out and shared by
/// every connection it is written to.
pub type Payload = Arc<str>;

/// Send side of one live connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<Payload>,
    evicted: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver its session drains into the socket.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Payload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: Uuid::new_v4(),
                tx,
                evicted: CancellationToken::new(),
            },
            rx,
        )
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed() && !self.evicted.is_cancelled()
    }

    /// Tell the owning session it has been replaced and must close.
    pub fn evict(&self) {
        self.evicted.cancel();
    }

    /// Resolves once this connection has been evicted.
    pub async fn evicted(&self) {
        self.evicted.cancelled().await
    }

    /// Queue a payload for this connection. `false` means it is gone.
    pub fn send(&self, payload: Payload) -> bool {
        self.tx.send(payload).is_ok()
    }
}

/// Process-local map of username -> live connection.
///
/// Last connect wins: registering a user again replaces (and thereby evicts)
/// the earlier connection. Backed by `DashMap` so the broker consumers and
/// every session can read and write concurrently.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` for `user`, returning the handle it replaced. The
    /// caller decides whether to evict the replaced one.
    pub fn register(&self, user: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections.insert(user.to_string(), handle)
    }

    pub fn lookup(&self, user: &str) -> Option<ConnectionHandle> {
        self.connections
            .get(user)
            .map(|entry| entry.value().clone())
            .filter(ConnectionHandle::is_open)
    }

    /// Remove `user`, but only if `conn_id` still owns the entry. A stale
    /// connection closing after being replaced leaves its successor alone.
    pub fn unregister(&self, user: &str, conn_id: Uuid) -> bool {
        self.connections
            .remove_if(user, |_, handle| handle.conn_id == conn_id)
            .is_some()
    }

    /// Visit every open connection. Handles that closed mid-iteration are
    /// skipped; `f` must not call back into the registry.
    pub fn for_each_open<F>(&self, mut f: F)
    where
        F: FnMut(&str, &ConnectionHandle),
    {
        for entry in self.connections.iter() {
            if entry.value().is_open() {
                f(entry.key(), entry.value());
            }
        }
    }

    pub fn users(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

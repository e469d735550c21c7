//! Connection registry with fan-out to every open connection.
//!
//! Each connection owns a bounded outbound queue drained by its socket
//! writer task. Fan-out clones the payload handle (a refcounted byte buffer)
//! into every target queue with `try_send`, so a slow or dead target never
//! blocks delivery to the others.
//!
//! ```text
//!                       ┌── OutboundQueue ── writer ── socket A
//! broadcast_except(B) ──┤
//!                       └── OutboundQueue ── writer ── socket C
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use uuid::Uuid;

/// A text frame body shared between fan-out targets without copying.
pub type Payload = Utf8Bytes;

/// Readiness of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Open,
    Closed,
}

/// Sending half of a connection, owned by the registry once registered.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    sender: mpsc::Sender<Payload>,
    open: Arc<AtomicBool>,
}

/// Receiving half of a connection, drained by the socket writer.
///
/// Dropping it marks the connection closed.
#[derive(Debug)]
pub struct OutboundQueue {
    receiver: mpsc::Receiver<Payload>,
    open: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Create a connection handle and the queue its writer drains.
    ///
    /// `capacity` is the number of payloads buffered before fan-out starts
    /// dropping messages for this connection.
    pub fn channel(id: Uuid, capacity: usize) -> (Self, OutboundQueue) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let open = Arc::new(AtomicBool::new(true));
        let handle = Self {
            id,
            sender,
            open: open.clone(),
        };
        (handle, OutboundQueue { receiver, open })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current readiness. A connection whose writer has gone away is closed.
    pub fn ready_state(&self) -> ReadyState {
        if self.open.load(Ordering::Acquire) && !self.sender.is_closed() {
            ReadyState::Open
        } else {
            ReadyState::Closed
        }
    }

    /// Mark the connection closed; fan-out skips it from now on.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl OutboundQueue {
    /// Next payload to write, or `None` once every handle is gone.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.receiver.recv().await
    }

    /// Stop accepting payloads and mark the connection closed.
    pub fn close(&mut self) {
        self.open.store(false, Ordering::Release);
        self.receiver.close();
    }
}

impl Drop for OutboundQueue {
    fn drop(&mut self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
}

/// Fan-out counters, updated without taking the registry lock for writing.
#[derive(Default)]
struct AtomicRegistryStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// The set of live connections keyed by connection id.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<Uuid, ConnectionHandle>>>,
    stats: Arc<AtomicRegistryStats>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly opened connection under its id.
    pub async fn add(&self, handle: ConnectionHandle) {
        let id = handle.id();
        let mut connections = self.connections.write().await;
        if connections.insert(id, handle).is_some() {
            log::warn!("Connection {id} registered twice, replacing previous handle");
        }
    }

    /// Remove a connection. Removing an unknown id is a no-op.
    ///
    /// Returns whether an entry was removed.
    pub async fn remove(&self, id: &Uuid) -> bool {
        let mut connections = self.connections.write().await;
        connections.remove(id).is_some()
    }

    /// Send `payload` to every open connection except `exclude`.
    ///
    /// Returns the number of connections the payload was queued for.
    pub async fn broadcast_except(&self, exclude: &Uuid, payload: &Payload) -> usize {
        self.fan_out(Some(exclude), payload).await
    }

    /// Send `payload` to every open connection.
    pub async fn broadcast_all(&self, payload: &Payload) -> usize {
        self.fan_out(None, payload).await
    }

    async fn fan_out(&self, exclude: Option<&Uuid>, payload: &Payload) -> usize {
        let connections = self.connections.read().await;
        let mut delivered = 0usize;
        let mut dropped = 0u64;

        for (id, conn) in connections.iter() {
            if exclude == Some(id) {
                continue;
            }
            if conn.ready_state() != ReadyState::Open {
                log::trace!("Skipping connection {id}: not open");
                continue;
            }
            match conn.sender.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    log::warn!("Connection {id} outbound buffer full, dropping message");
                }
                Err(TrySendError::Closed(_)) => {
                    dropped += 1;
                    conn.mark_closed();
                    log::debug!("Connection {id} writer gone, dropping message");
                }
            }
        }

        self.stats
            .messages_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        if dropped > 0 {
            self.stats
                .messages_dropped
                .fetch_add(dropped, Ordering::Relaxed);
        }
        delivered
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Check if a connection is registered.
    pub async fn contains(&self, id: &Uuid) -> bool {
        self.connections.read().await.contains_key(id)
    }

    /// Snapshot of fan-out statistics.
    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.len().await,
        }
    }
}

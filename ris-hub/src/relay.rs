//! Per-connection message relay.
//!
//! A connection is a stream of [`ConnectionEvent`]s processed strictly in
//! arrival order:
//!
//! ```text
//! Open ──► Message* ──► Close        (Error may appear anywhere before Close)
//! ```
//!
//! - `Open` registers the connection.
//! - `Message` relays the raw frame to every other open connection and, when
//!   the frame carries an operation, submits a job.
//! - `Close` removes the connection.
//! - `Error` is only logged; the transport follows it with `Close`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{Stream, StreamExt};
use uuid::Uuid;

use crate::job::JobFactory;
use crate::protocol::{InboundMessage, ProtocolError};
use crate::queue::JobQueue;
use crate::registry::{ConnectionHandle, ConnectionRegistry, Payload};

/// Lifecycle event of one connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    Open(ConnectionHandle),
    Message(Payload),
    Close,
    Error(String),
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Connections the raw frame was queued for.
    pub relayed: usize,
    pub job_submitted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub messages_relayed: u64,
    pub jobs_submitted: u64,
    pub malformed_dropped: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    messages_relayed: AtomicU64,
    jobs_submitted: AtomicU64,
    malformed_dropped: AtomicU64,
}

/// Relays inbound frames between connections and dispatches jobs.
#[derive(Clone)]
pub struct MessageRelay {
    registry: ConnectionRegistry,
    factory: JobFactory,
    queue: Arc<dyn JobQueue>,
    stats: Arc<AtomicRelayStats>,
}

impl MessageRelay {
    pub fn new(registry: ConnectionRegistry, factory: JobFactory, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            registry,
            factory,
            queue,
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Process a connection's events until `Close` or the stream ends.
    ///
    /// A stream that ends without `Close` is treated as closed, so the
    /// connection never outlives its event source in the registry.
    pub async fn drive<S>(&self, id: Uuid, events: S)
    where
        S: Stream<Item = ConnectionEvent>,
    {
        let mut events = std::pin::pin!(events);
        while let Some(event) = events.next().await {
            let closing = matches!(event, ConnectionEvent::Close);
            self.handle_event(id, event).await;
            if closing {
                return;
            }
        }
        self.handle_event(id, ConnectionEvent::Close).await;
    }

    /// Apply a single lifecycle event.
    pub async fn handle_event(&self, id: Uuid, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Open(handle) => {
                self.registry.add(handle).await;
                log::info!("Connection {id} opened");
            }
            ConnectionEvent::Message(raw) => {
                // Malformed frames are already logged and counted.
                let _ = self.on_message(id, raw).await;
            }
            ConnectionEvent::Close => {
                if self.registry.remove(&id).await {
                    log::info!("Connection {id} closed");
                }
            }
            ConnectionEvent::Error(e) => {
                log::error!("Connection {id} error: {e}");
            }
        }
    }

    /// Relay one inbound frame and submit its job, if any.
    ///
    /// The frame is forwarded exactly as received. A malformed frame is
    /// dropped: nothing is relayed and no job is created.
    pub async fn on_message(&self, id: Uuid, raw: Payload) -> Result<RelayOutcome, ProtocolError> {
        let message = match InboundMessage::parse(raw.as_str()) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping message from connection {id}: {e}");
                return Err(e);
            }
        };
        log::debug!("Connection {id} sent {} bytes", raw.len());

        let relayed = self.registry.broadcast_except(&id, &raw).await;
        self.stats.messages_relayed.fetch_add(1, Ordering::Relaxed);

        let job_submitted = match message.operation {
            Some(operation) => {
                let kind = operation.kind();
                let job = self.factory.create_job(operation, message.job_id);
                log::info!("Connection {id} submitted {kind} job {:?}", job.job_id());
                self.queue.enqueue(job);
                self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        };

        Ok(RelayOutcome {
            relayed,
            job_submitted,
        })
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            messages_relayed: self.stats.messages_relayed.load(Ordering::Relaxed),
            jobs_submitted: self.stats.jobs_submitted.load(Ordering::Relaxed),
            malformed_dropped: self.stats.malformed_dropped.load(Ordering::Relaxed),
        }
    }
}

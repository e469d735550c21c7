//! WebSocket acceptor: upgrades connections and wires them to the relay.
//!
//! Architecture:
//! ```text
//! TcpListener ── accept ── upgrade ──┬── writer task ◄── OutboundQueue ◄── registry fan-out
//!                                    │
//!                                    └── reader ── ConnectionEvent stream ── MessageRelay
//!                                                                              │
//!                                                                         JobQueue
//!
//! ResultStream ── BroadcastLoop ── registry.broadcast_all
//! ```
//!
//! Every connection runs in its own task; a failed upgrade only ends that
//! task. The acceptor and the broadcast loop both stop on the shutdown signal.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::stream::{self, Stream};
use futures_util::{future, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use uuid::Uuid;

use crate::broadcaster::BroadcastLoop;
use crate::config::ServerConfig;
use crate::job::JobFactory;
use crate::protocol::JobResult;
use crate::queue::JobQueue;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::relay::{ConnectionEvent, MessageRelay};
use crate::shutdown::ShutdownSignal;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub messages_relayed: u64,
    pub jobs_submitted: u64,
    pub malformed_messages: u64,
    pub results_broadcast: u64,
    pub messages_dropped: u64,
}

/// The broadcast hub.
pub struct HubServer {
    config: ServerConfig,
    registry: ConnectionRegistry,
    relay: MessageRelay,
    total_connections: Arc<AtomicU64>,
    results_broadcast: Arc<AtomicU64>,
}

impl HubServer {
    /// Create a hub that submits jobs built by `factory` to `queue`.
    pub fn new(config: ServerConfig, factory: JobFactory, queue: Arc<dyn JobQueue>) -> Self {
        let registry = ConnectionRegistry::new();
        let relay = MessageRelay::new(registry.clone(), factory, queue);
        Self {
            config,
            registry,
            relay,
            total_connections: Arc::new(AtomicU64::new(0)),
            results_broadcast: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Bind `config.bind_addr` and serve until shutdown.
    pub async fn run<S>(
        &self,
        results: S,
        shutdown: ShutdownSignal,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        S: Stream<Item = JobResult> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Hub listening on {}", listener.local_addr()?);
        self.serve(listener, results, shutdown).await
    }

    /// Serve on an already bound listener until shutdown.
    ///
    /// Starts the broadcast loop over `results` alongside the acceptor and
    /// waits for it to stop before returning.
    pub async fn serve<S>(
        &self,
        listener: TcpListener,
        results: S,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        S: Stream<Item = JobResult> + Send + 'static,
    {
        let broadcaster =
            BroadcastLoop::with_counter(self.registry.clone(), self.results_broadcast.clone());
        let broadcast_task = tokio::spawn(broadcaster.run(results, shutdown.clone()));

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let relay = self.relay.clone();
                        let total = self.total_connections.clone();
                        let buffer = self.config.connection_buffer;

                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_connection(stream, addr, relay, total, buffer).await {
                                log::warn!("WebSocket upgrade failed for {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("Failed to accept TCP connection: {e}");
                    }
                },
            }
        }

        log::info!("Hub acceptor stopped");
        match broadcast_task.await {
            Ok(count) => log::info!("Broadcast loop finished after {count} result(s)"),
            Err(e) => log::error!("Broadcast loop task failed: {e}"),
        }
        Ok(())
    }

    /// Upgrade one TCP stream and run its connection until it closes.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        relay: MessageRelay,
        total_connections: Arc<AtomicU64>,
        buffer: usize,
    ) -> Result<(), WsError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let id = Uuid::new_v4();
        total_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection {id} established from {addr}");

        let (mut ws_sender, ws_receiver) = ws_stream.split();
        let (handle, mut outbound) = ConnectionHandle::channel(id, buffer);

        // Writer: ends when the registry drops the handle or the socket fails.
        tokio::spawn(async move {
            while let Some(payload) = outbound.recv().await {
                if let Err(e) = ws_sender.send(Message::Text(payload)).await {
                    log::debug!("Write to connection {id} failed: {e}");
                    outbound.close();
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        relay.drive(id, connection_events(handle, ws_receiver)).await;
        log::debug!("Connection {id} from {addr} finished");
        Ok(())
    }

    /// Snapshot of hub statistics.
    pub async fn stats(&self) -> HubStats {
        let relay = self.relay.stats();
        let registry = self.registry.stats().await;
        HubStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: registry.active_connections,
            messages_relayed: relay.messages_relayed,
            jobs_submitted: relay.jobs_submitted,
            malformed_messages: relay.malformed_dropped,
            results_broadcast: self.results_broadcast.load(Ordering::Relaxed),
            messages_dropped: registry.messages_dropped,
        }
    }
}

/// Turn a socket's inbound frames into lifecycle events.
///
/// Yields `Open` first and `Close` last. A transport error yields `Error`
/// and ends the frame stream. Non-text frames are not relayed.
fn connection_events<S>(handle: ConnectionHandle, frames: S) -> impl Stream<Item = ConnectionEvent>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let id = handle.id();
    let inbound = stream::unfold(Some(frames), move |frames| async move {
        let Some(mut frames) = frames else {
            return None;
        };
        loop {
            match frames.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some((ConnectionEvent::Message(text), Some(frames)));
                }
                Some(Ok(Message::Binary(data))) => {
                    log::debug!("Ignoring {} byte binary frame from connection {id}", data.len());
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some((ConnectionEvent::Error(e.to_string()), None)),
            }
        }
    });

    stream::once(future::ready(ConnectionEvent::Open(handle)))
        .chain(inbound)
        .chain(stream::once(future::ready(ConnectionEvent::Close)))
}

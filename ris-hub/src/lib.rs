//! # ris-hub — realtime broadcast hub for surface configuration jobs
//!
//! Relays every client frame to all other clients, packages operation
//! requests into jobs for an external runner, and broadcasts job results to
//! every client.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  frames   ┌──────────────┐  fan-out (N-1)  ┌──────────┐
//! │ Client A │ ────────► │ MessageRelay │ ──────────────► │ Client B │
//! └──────────┘           └──────┬───────┘                 │ Client C │
//!                               │ operation?              └────▲─────┘
//!                               ▼                              │
//!                        ┌──────────────┐                      │ fan-out (N)
//!                        │  JobQueue    │                      │
//!                        └──────┬───────┘               ┌──────┴────────┐
//!                               ▼                       │ BroadcastLoop │
//!                        compute endpoint ──► results ─►│               │
//!                                                       └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire shapes (`Operation`, `JobResult`, inbound frames)
//! - [`registry`] — live connections and fan-out
//! - [`job`] — job descriptors and the compute endpoint seam
//! - [`queue`] — job hand-off, in-process runner, result stream
//! - [`relay`] — per-connection event handling
//! - [`broadcaster`] — result stream → every connection
//! - [`server`] — WebSocket acceptor
//! - [`shutdown`] — stop signal for the acceptor and broadcast loop
//! - [`config`] — server configuration

pub mod protocol;
pub mod registry;
pub mod job;
pub mod queue;
pub mod relay;
pub mod broadcaster;
pub mod server;
pub mod shutdown;
pub mod config;

// Re-exports for convenience
pub use protocol::{
    Configuration, InboundMessage, JobResult, ObjectPositions, Operation, Position,
    ProtocolError,
};
pub use registry::{ConnectionHandle, ConnectionRegistry, OutboundQueue, Payload, ReadyState, RegistryStats};
pub use job::{ComputeEndpoint, ComputeError, JobDescriptor, JobFactory, WsComputeEndpoint};
pub use queue::{JobQueue, JobRunner, LocalJobQueue, ResultStream};
pub use relay::{ConnectionEvent, MessageRelay, RelayOutcome, RelayStats};
pub use broadcaster::BroadcastLoop;
pub use server::{HubServer, HubStats};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use config::ServerConfig;

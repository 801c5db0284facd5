//! # tidal-server
//!
//! Real-time, bidirectional event messaging over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! client ──ws──▶ Engine ──accept──▶ Server ──spawn──▶ Socket task
//!                                                        │
//!                                              Namespace (handlers)
//!                                                        │
//!                                       BroadcastAdaptor (rooms, delivery)
//!                                          │                    │
//!                                     LocalAdaptor       ClusterAdaptor ──▶ ClusterBus
//! ```
//!
//! - **transport**: admission policy, per-connection channels, WebSocket
//!   pumps and heartbeat
//! - **socket**: per-connection session state machine and event dispatch
//! - **namespace**: session registry and handler table
//! - **adaptor**: room membership and room-scoped broadcast
//! - **bus**: node-to-node pub/sub for the cluster adaptor
//! - **server**: accept loop, namespace table, HTTP router, shutdown
//! - **bootstrap**: logging, listener and serve loop from a settings document

#![deny(unsafe_code)]

pub mod adaptor;
pub mod bootstrap;
pub mod bus;
pub mod errors;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod namespace;
pub mod server;
pub mod shutdown;
pub mod socket;
pub mod transport;

pub use adaptor::{BroadcastAdaptor, ClusterAdaptor, ClusterMessage, LocalAdaptor};
#[cfg(feature = "redis")]
pub use bus::RedisBus;
pub use bus::{ClusterBus, MemoryBus};
pub use errors::{AcceptError, BusError, ConfigurationError, SocketError, TransportError};
pub use handler::{EventHandler, handler_fn};
pub use health::HealthResponse;
pub use namespace::Namespace;
pub use server::Server;
pub use socket::{DisconnectReason, Socket, SocketState};
pub use tidal_core::{Event, NodeId, SessionId};
pub use transport::{AccessControl, Handshake, Peer, TransportKind};

//! Connection transport: admission, per-connection channels, WebSocket
//! framing and keep-alive.
//!
//! The [`Engine`] owns the policy and the accept queue. Every admitted
//! connection is split into a server half ([`Connection`], consumed by a
//! socket) and a client half ([`Peer`], driven by the WebSocket pumps or by an
//! in-process caller).

pub mod connection;
pub mod engine;
pub mod handshake;
pub mod heartbeat;
pub mod policy;
pub mod websocket;

pub use connection::{Connection, ConnectionHandle, Peer, SessionParams};
pub use engine::{Engine, NamespaceFilter};
pub use handshake::{Handshake, NAMESPACE_PARAM, normalize_namespace};
pub use heartbeat::{HeartbeatResult, Liveness, MIN_PING_INTERVAL};
pub use policy::{AccessControl, AccessControlFn, AllowRequest, TransportKind, TransportPolicy};

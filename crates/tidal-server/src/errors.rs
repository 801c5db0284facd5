//! Error types for the server, transport, sessions and cluster bus.

use thiserror::Error;

use crate::socket::SocketState;

/// Invalid server construction or configuration.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A transport name nobody recognises.
    #[error("unknown transport '{0}'")]
    UnknownTransport(String),
    /// A recognised transport this server does not offer.
    #[error("transport '{0}' is not supported by this server")]
    UnsupportedTransport(String),
    /// An empty transport list.
    #[error("at least one transport must be enabled")]
    NoTransports,
    /// Construction happened outside a tokio runtime.
    #[error("server must be created inside a tokio runtime")]
    NoRuntime,
    /// The cluster adaptor could not be set up.
    #[error("cluster broadcast unavailable: {0}")]
    Cluster(String),
    /// Settings failed validation.
    #[error(transparent)]
    Settings(#[from] tidal_settings::SettingsError),
}

/// Failure on a single transport connection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection is closed.
    #[error("connection closed")]
    Closed,
    /// The outbound buffer is full.
    #[error("outbound buffer full")]
    Backpressure,
    /// Admission refused because the server is at capacity.
    #[error("connection limit of {max} reached")]
    ConnectionLimit {
        /// Configured maximum.
        max: usize,
    },
    /// Admission refused by the request predicate.
    #[error("request rejected: {0}")]
    Rejected(String),
    /// The requested namespace has not been created by the application.
    #[error("invalid namespace '{0}'")]
    InvalidNamespace(String),
    /// The handshake request could not be built or read.
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),
}

impl TransportError {
    /// Short label used for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Backpressure => "backpressure",
            Self::ConnectionLimit { .. } => "connection_limit",
            Self::Rejected(_) => "rejected",
            Self::InvalidNamespace(_) => "invalid_namespace",
            Self::InvalidHandshake(_) => "invalid_handshake",
        }
    }
}

/// The transport can no longer produce connections.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AcceptError {
    /// The engine was closed.
    #[error("transport engine closed")]
    Closed,
}

/// Failure of a session operation.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The session has not finished connecting.
    #[error("session is {0}")]
    NotConnected(SocketState),
    /// The session is disconnecting or closed.
    #[error("session closed")]
    Closed,
    /// The underlying connection refused the frame.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The event could not be encoded.
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure talking to a cluster bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Could not reach the bus backend.
    #[error("bus connection failed: {0}")]
    Connection(String),
    /// A message could not be published.
    #[error("bus publish failed: {0}")]
    Publish(String),
    /// A subscription could not be established.
    #[error("bus subscribe failed: {0}")]
    Subscribe(String),
    /// A cluster message could not be encoded or decoded.
    #[error("cluster message codec: {0}")]
    Codec(#[from] serde_json::Error),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        Self::Connection(err.to_string())
    }
}

//! One client session attached to a namespace.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tidal_core::{Event, SessionId};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::errors::SocketError;
use crate::handler::{CLIENT_DISCONNECT_EVENT, CONNECT_EVENT, DISCONNECT_EVENT, OPEN_EVENT, is_reserved};
use crate::metrics::{
    CONNECTION_DURATION_SECONDS, SESSIONS_ACTIVE, SESSIONS_CLOSED_TOTAL, SESSIONS_OPENED_TOTAL,
};
use crate::namespace::Namespace;
use crate::transport::{ConnectionHandle, Handshake, SessionParams};

/// Session lifecycle. Moves forward only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketState {
    /// Registered, handshake not yet sent.
    Connecting,
    /// Live: events flow both ways.
    Connected,
    /// Leaving the namespace. Emits and joins fail.
    Disconnecting,
    /// Gone.
    Closed,
}

impl SocketState {
    /// Whether `self -> next` is a legal step.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Connected | Self::Disconnecting)
                | (Self::Connected, Self::Disconnecting)
                | (Self::Disconnecting, Self::Closed)
        )
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended. Passed to the disconnect handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent a `disconnect` event.
    ClientDisconnect,
    /// The server called [`Socket::disconnect`] or is shutting down.
    ServerDisconnect,
    /// The connection closed underneath the session.
    TransportClose,
}

impl DisconnectReason {
    /// Reason string handed to handlers.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientDisconnect => "client namespace disconnect",
            Self::ServerDisconnect => "server namespace disconnect",
            Self::TransportClose => "transport close",
        }
    }
}

/// A connected client within one namespace.
///
/// Created by the accept loop and driven by [`Socket::run`]. Handlers receive
/// it as `Arc<Socket>` and may emit, join rooms or disconnect through it.
pub struct Socket {
    id: SessionId,
    namespace: Arc<Namespace>,
    handle: ConnectionHandle,
    handshake: Handshake,
    state: Mutex<SocketState>,
    connected_at: Instant,
}

impl Socket {
    /// Wrap an admitted connection. The socket is `Connecting` until [`Socket::run`] starts.
    pub fn new(namespace: Arc<Namespace>, handle: ConnectionHandle, handshake: Handshake) -> Arc<Self> {
        Arc::new(Self {
            id: handle.id().clone(),
            namespace,
            handle,
            handshake,
            state: Mutex::new(SocketState::Connecting),
            connected_at: Instant::now(),
        })
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        *self.state.lock()
    }

    /// Namespace this session belongs to.
    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    /// Opening request.
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Whether the session is live.
    pub fn is_connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    fn transition(&self, next: SocketState) -> bool {
        let mut state = self.state.lock();
        if state.can_transition_to(next) {
            debug!(session_id = %self.id, from = %*state, to = %next, "socket state change");
            *state = next;
            true
        } else {
            false
        }
    }

    fn ensure_connected(&self) -> Result<(), SocketError> {
        match self.state() {
            SocketState::Connected => Ok(()),
            SocketState::Connecting => Err(SocketError::NotConnected(SocketState::Connecting)),
            SocketState::Disconnecting | SocketState::Closed => Err(SocketError::Closed),
        }
    }

    /// Send an event to this client.
    ///
    /// Never blocks: a full outbound buffer fails with backpressure.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), SocketError> {
        self.ensure_connected()?;
        let frame = Event::new(event, args).encode()?;
        self.handle.send(Arc::new(frame))?;
        Ok(())
    }

    pub(crate) fn send_frame(&self, frame: &Arc<String>) -> Result<(), SocketError> {
        self.ensure_connected()?;
        self.handle.send(Arc::clone(frame))?;
        Ok(())
    }

    /// Join `room` in this session's namespace. Joining twice is a no-op.
    ///
    /// Fails unless connected. A join that races with disconnect is undone.
    pub async fn join(&self, room: &str) -> Result<(), SocketError> {
        self.ensure_connected()?;
        let adaptor = self.namespace.adaptor();
        adaptor.join(room, self.handle.clone()).await;
        if self.state() != SocketState::Connected {
            adaptor.leave(room, &self.id).await;
            return Err(SocketError::Closed);
        }
        Ok(())
    }

    /// Leave `room`. Leaving a room the session is not in is a no-op.
    pub async fn leave(&self, room: &str) {
        self.namespace.adaptor().leave(room, &self.id).await;
    }

    /// Leave every room.
    pub async fn leave_all(&self) {
        self.namespace.adaptor().leave_all(&self.id).await;
    }

    /// Rooms this session is in.
    pub async fn rooms(&self) -> BTreeSet<String> {
        self.namespace.adaptor().rooms(&self.id).await
    }

    /// Send an event to everyone in `room` except this session.
    pub async fn broadcast_to(&self, room: &str, event: &str, args: Vec<Value>) -> usize {
        self.namespace
            .broadcast_to_except(room, event, args, &self.id)
            .await
    }

    /// End the session from the server side. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.transition(SocketState::Disconnecting);
        self.handle.close();
    }

    /// Drive the session until it ends.
    ///
    /// Registers with the namespace, sends the open frame, fires the connect
    /// handler, then dispatches inbound events one at a time in arrival order.
    /// Frames that do not decode are skipped.
    #[instrument(skip_all, fields(session_id = %self.id, namespace = %self.namespace.name()))]
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<String>, params: SessionParams) {
        counter!(SESSIONS_OPENED_TOTAL).increment(1);
        gauge!(SESSIONS_ACTIVE).increment(1.0);
        self.namespace.register(Arc::clone(&self));

        let reason = if self.transition(SocketState::Connected) {
            self.open(&params);
            info!("session connected");
            let _ = self
                .namespace
                .handlers()
                .dispatch(CONNECT_EVENT, &self, Vec::new())
                .await;
            self.read_loop(&mut inbound).await
        } else {
            DisconnectReason::ServerDisconnect
        };

        self.finish(reason).await;
    }

    fn open(&self, params: &SessionParams) {
        let payload = json!({
            "sid": self.id,
            "pingInterval": u64::try_from(params.ping_interval.as_millis()).unwrap_or(u64::MAX),
            "pingTimeout": u64::try_from(params.ping_timeout.as_millis()).unwrap_or(u64::MAX),
            "upgrades": params.upgrades,
        });
        if let Err(e) = self.emit(OPEN_EVENT, vec![payload]) {
            warn!(error = %e, "failed to send open frame");
        }
    }

    async fn read_loop(self: &Arc<Self>, inbound: &mut mpsc::Receiver<String>) -> DisconnectReason {
        loop {
            tokio::select! {
                () = self.handle.closed() => {
                    return if self.state() == SocketState::Disconnecting {
                        DisconnectReason::ServerDisconnect
                    } else {
                        DisconnectReason::TransportClose
                    };
                }
                frame = inbound.recv() => {
                    let Some(frame) = frame else {
                        return DisconnectReason::TransportClose;
                    };
                    match Event::decode(&frame) {
                        Ok(event) if event.name == CLIENT_DISCONNECT_EVENT => {
                            return DisconnectReason::ClientDisconnect;
                        }
                        Ok(event) if is_reserved(&event.name) => {
                            warn!(event = %event.name, "client sent reserved event, ignoring");
                        }
                        Ok(event) => {
                            let _ = self
                                .namespace
                                .handlers()
                                .dispatch(&event.name, self, event.args)
                                .await;
                        }
                        Err(e) => debug!(error = %e, "skipping undecodable frame"),
                    }
                }
            }
        }
    }

    async fn finish(self: &Arc<Self>, reason: DisconnectReason) {
        let _ = self.transition(SocketState::Disconnecting);
        self.namespace.unregister(&self.id).await;
        let _ = self
            .namespace
            .handlers()
            .dispatch(DISCONNECT_EVENT, self, vec![Value::from(reason.as_str())])
            .await;
        self.handle.close();
        let _ = self.transition(SocketState::Closed);

        counter!(SESSIONS_CLOSED_TOTAL, "reason" => reason.as_str()).increment(1);
        gauge!(SESSIONS_ACTIVE).decrement(1.0);
        histogram!(CONNECTION_DURATION_SECONDS).record(self.connected_at.elapsed().as_secs_f64());
        info!(reason = reason.as_str(), "session closed");
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("namespace", &self.namespace.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

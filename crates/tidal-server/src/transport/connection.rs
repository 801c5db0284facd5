//! One admitted connection: the server half, the client half, and the
//! cloneable handle used to push frames to it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tidal_core::{Event, SessionId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::Handshake;
use crate::errors::{SocketError, TransportError};

/// Keep-alive parameters announced to the client in the open frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionParams {
    /// Interval between server pings.
    pub ping_interval: Duration,
    /// Silence after which the server drops the connection.
    pub ping_timeout: Duration,
    /// Transports the client may upgrade to.
    pub upgrades: Vec<String>,
}

/// Cloneable sender for one connection's outbound frames.
///
/// Sends never block: a full buffer is reported as [`TransportError::Backpressure`].
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: SessionId,
    tx: mpsc::Sender<Arc<String>>,
    closed: CancellationToken,
    dropped: Arc<AtomicU64>,
}

impl ConnectionHandle {
    /// Session id assigned at admission.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Queue an encoded frame.
    pub fn send(&self, frame: Arc<String>) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Backpressure)
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    /// Frames refused because the buffer was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the connection has been closed from either side.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Server half of an admitted connection, handed out by the engine's accept queue.
#[derive(Debug)]
pub struct Connection {
    /// Handle for outbound frames and closing.
    pub handle: ConnectionHandle,
    /// Opening request.
    pub handshake: Handshake,
    /// Inbound text frames in arrival order. Ends when the client goes away.
    pub inbound: mpsc::Receiver<String>,
    /// Keep-alive parameters for the open frame.
    pub params: SessionParams,
}

/// Client half of a connection.
///
/// The WebSocket pumps drive one of these per socket; in-process callers
/// get one from `Server::connect_local`. Dropping it ends the session.
#[derive(Debug)]
pub struct Peer {
    pub(crate) id: SessionId,
    pub(crate) inbound: mpsc::Sender<String>,
    pub(crate) outbound: mpsc::Receiver<Arc<String>>,
    pub(crate) closed: CancellationToken,
}

impl Peer {
    /// Session id assigned at admission.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Deliver a raw text frame to the server, waiting for buffer space.
    pub async fn send_frame(&self, frame: String) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.inbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Encode and deliver an event.
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), SocketError> {
        let frame = Event::new(event, args).encode()?;
        self.send_frame(frame).await?;
        Ok(())
    }

    /// Next frame from the server.
    ///
    /// Frames queued before the connection closed are still returned;
    /// `None` once the connection is closed and drained.
    pub async fn recv_frame(&mut self) -> Option<Arc<String>> {
        let closed = self.closed.clone();
        tokio::select! {
            biased;
            frame = self.outbound.recv() => return frame,
            () = closed.cancelled() => {}
        }
        self.outbound.try_recv().ok()
    }

    /// Next decodable event from the server, skipping malformed frames.
    pub async fn recv_event(&mut self) -> Option<Event> {
        while let Some(frame) = self.recv_frame().await {
            if let Ok(event) = Event::decode(&frame) {
                return Some(event);
            }
        }
        None
    }

    /// Close the connection from the client side.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the connection has been closed from either side.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Build both halves of a connection.
///
/// `closed` should be a child of the engine's token so closing the engine
/// closes every connection.
pub(crate) fn pair(
    id: SessionId,
    handshake: Handshake,
    params: SessionParams,
    buffer: usize,
    closed: CancellationToken,
) -> (Connection, Peer) {
    let (out_tx, out_rx) = mpsc::channel(buffer.max(1));
    let (in_tx, in_rx) = mpsc::channel(buffer.max(1));
    let handle = ConnectionHandle {
        id: id.clone(),
        tx: out_tx,
        closed: closed.clone(),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let connection = Connection {
        handle,
        handshake,
        inbound: in_rx,
        params,
    };
    let peer = Peer {
        id,
        inbound: in_tx,
        outbound: out_rx,
        closed,
    };
    (connection, peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> SessionParams {
        SessionParams {
            ping_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(60),
            upgrades: Vec::new(),
        }
    }

    fn make_pair(buffer: usize) -> (Connection, Peer) {
        pair(
            SessionId::from("s1"),
            Handshake::default(),
            params(),
            buffer,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn handle_send_reaches_peer() {
        let (conn, mut peer) = make_pair(8);
        conn.handle.send(Arc::new("hello".into())).unwrap();
        assert_eq!(peer.recv_frame().await.unwrap().as_str(), "hello");
    }

    #[tokio::test]
    async fn full_buffer_is_backpressure() {
        let (conn, _peer) = make_pair(1);
        conn.handle.send(Arc::new("one".into())).unwrap();
        assert_eq!(
            conn.handle.send(Arc::new("two".into())),
            Err(TransportError::Backpressure)
        );
        assert_eq!(conn.handle.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (conn, peer) = make_pair(8);
        peer.close();
        assert!(conn.handle.is_closed());
        assert_eq!(
            conn.handle.send(Arc::new("late".into())),
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn send_after_peer_dropped_fails() {
        let (conn, peer) = make_pair(8);
        drop(peer);
        assert_eq!(
            conn.handle.send(Arc::new("late".into())),
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn peer_emit_arrives_inbound() {
        let (mut conn, peer) = make_pair(8);
        peer.emit("chat", vec![json!("hi")]).await.unwrap();
        let frame = conn.inbound.recv().await.unwrap();
        assert_eq!(frame, r#"["chat","hi"]"#);
    }

    #[tokio::test]
    async fn recv_drains_after_close() {
        let (conn, mut peer) = make_pair(8);
        conn.handle.send(Arc::new("queued".into())).unwrap();
        conn.handle.close();
        assert_eq!(peer.recv_frame().await.unwrap().as_str(), "queued");
        assert!(peer.recv_frame().await.is_none());
    }

    #[tokio::test]
    async fn recv_event_skips_garbage() {
        let (conn, mut peer) = make_pair(8);
        conn.handle.send(Arc::new("not json".into())).unwrap();
        conn.handle.send(Arc::new(r#"["ok",1]"#.into())).unwrap();
        let event = peer.recv_event().await.unwrap();
        assert_eq!(event.name, "ok");
        assert_eq!(event.args, vec![json!(1)]);
    }

    #[tokio::test]
    async fn closed_resolves_on_close() {
        let (conn, peer) = make_pair(8);
        let handle = conn.handle.clone();
        let waiter = tokio::spawn(async move { handle.closed().await });
        peer.close();
        waiter.await.unwrap();
    }
}

//! Namespaces: a session registry, a handler table and a broadcast adaptor.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tidal_core::{Event, SessionId};
use tracing::{debug, instrument, warn};

use crate::adaptor::BroadcastAdaptor;
use crate::adaptor::local::encode_frame;
use crate::handler::{CONNECT_EVENT, DISCONNECT_EVENT, EventHandler, HandlerTable};
use crate::socket::Socket;

/// A logical channel sessions attach to.
///
/// Owns the sessions currently attached, the event handlers they dispatch
/// to, and the adaptor that tracks their rooms.
pub struct Namespace {
    name: String,
    sockets: RwLock<HashMap<SessionId, Arc<Socket>>>,
    adaptor: Arc<dyn BroadcastAdaptor>,
    handlers: Arc<HandlerTable>,
}

impl Namespace {
    /// New namespace with its own handler table.
    pub fn new(name: impl Into<String>, adaptor: Arc<dyn BroadcastAdaptor>) -> Arc<Self> {
        Self::with_handlers(name, adaptor, Arc::new(HandlerTable::new()))
    }

    /// New namespace sharing an existing handler table.
    pub fn with_handlers(
        name: impl Into<String>,
        adaptor: Arc<dyn BroadcastAdaptor>,
        handlers: Arc<HandlerTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            sockets: RwLock::new(HashMap::new()),
            adaptor,
            handlers,
        })
    }

    /// Namespace name, e.g. `/` or `/chat`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The adaptor holding this namespace's rooms.
    pub fn adaptor(&self) -> Arc<dyn BroadcastAdaptor> {
        Arc::clone(&self.adaptor)
    }

    /// Event handlers.
    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub(crate) fn shared_handlers(&self) -> Arc<HandlerTable> {
        Arc::clone(&self.handlers)
    }

    /// Register a handler for a client event.
    pub fn on(&self, event: &str, handler: impl EventHandler + 'static) {
        self.handlers.register(event, handler);
    }

    /// Register the handler run when a session connects.
    pub fn on_connect(&self, handler: impl EventHandler + 'static) {
        self.handlers.register(CONNECT_EVENT, handler);
    }

    /// Register the handler run after a session leaves. It receives the reason string.
    pub fn on_disconnect(&self, handler: impl EventHandler + 'static) {
        self.handlers.register(DISCONNECT_EVENT, handler);
    }

    /// Attach a session. Re-registering the same id replaces the entry.
    pub fn register(&self, socket: Arc<Socket>) {
        let id = socket.id().clone();
        if self.sockets.write().insert(id.clone(), socket).is_some() {
            warn!(namespace = %self.name, session_id = %id, "session registered twice");
        }
    }

    /// Detach a session, purging it from every room first.
    pub async fn unregister(&self, id: &SessionId) {
        self.adaptor.leave_all(id).await;
        if self.sockets.write().remove(id).is_none() {
            debug!(namespace = %self.name, session_id = %id, "unregister of unknown session");
        }
    }

    /// Attached session by id.
    pub fn socket(&self, id: &SessionId) -> Option<Arc<Socket>> {
        self.sockets.read().get(id).cloned()
    }

    /// Snapshot of attached sessions.
    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.sockets.read().values().cloned().collect()
    }

    /// Number of attached sessions.
    pub fn len(&self) -> usize {
        self.sockets.read().len()
    }

    /// Whether no sessions are attached.
    pub fn is_empty(&self) -> bool {
        self.sockets.read().is_empty()
    }

    /// Send an event to everyone in `room`. Returns the recipient count.
    #[instrument(skip(self, args), fields(namespace = %self.name))]
    pub async fn broadcast_to(&self, room: &str, event: &str, args: Vec<Value>) -> usize {
        self.adaptor.send(room, &Event::new(event, args), None).await
    }

    /// Send an event to everyone in `room` except `exclude`.
    pub async fn broadcast_to_except(
        &self,
        room: &str,
        event: &str,
        args: Vec<Value>,
        exclude: &SessionId,
    ) -> usize {
        self.adaptor
            .send(room, &Event::new(event, args), Some(exclude))
            .await
    }

    /// Send an event to every connected session in this namespace.
    pub fn emit_all(&self, event: &str, args: Vec<Value>) -> usize {
        let Some(frame) = encode_frame(&Event::new(event, args)) else {
            return 0;
        };
        self.sockets()
            .iter()
            .filter(|socket| socket.send_frame(&frame).is_ok())
            .count()
    }

    /// Ask every attached session to disconnect.
    pub fn disconnect_all(&self) {
        for socket in self.sockets() {
            socket.disconnect();
        }
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("sessions", &self.len())
            .field("events", &self.handlers.events())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::LocalAdaptor;
    use crate::handler::handler_fn;
    use crate::transport::{Handshake, Peer, SessionParams, connection};
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn namespace() -> Arc<Namespace> {
        Namespace::new("/", Arc::new(LocalAdaptor::new()))
    }

    async fn connected(ns: &Arc<Namespace>, id: &str) -> (Arc<Socket>, Peer) {
        let (conn, mut peer) = connection::pair(
            SessionId::from(id),
            Handshake::default(),
            SessionParams {
                ping_interval: Duration::from_secs(25),
                ping_timeout: Duration::from_secs(60),
                upgrades: Vec::new(),
            },
            8,
            CancellationToken::new(),
        );
        let socket = Socket::new(Arc::clone(ns), conn.handle, conn.handshake);
        let _ = tokio::spawn(Arc::clone(&socket).run(conn.inbound, conn.params));
        let open = peer.recv_event().await.unwrap();
        assert_eq!(open.name, "open");
        (socket, peer)
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let ns = namespace();
        let (socket, _peer) = connected(&ns, "a").await;
        assert_eq!(ns.len(), 1);
        assert!(ns.socket(socket.id()).is_some());
        assert_eq!(ns.sockets().len(), 1);
    }

    #[tokio::test]
    async fn unregister_purges_rooms() {
        let ns = namespace();
        let (socket, _peer) = connected(&ns, "a").await;
        socket.join("r1").await.unwrap();
        socket.join("r2").await.unwrap();
        ns.unregister(socket.id()).await;
        assert!(ns.is_empty());
        assert!(ns.adaptor().rooms(socket.id()).await.is_empty());
        assert!(ns.adaptor().members("r1").await.is_empty());
    }

    #[tokio::test]
    async fn unregister_unknown_is_noop() {
        let ns = namespace();
        ns.unregister(&SessionId::from("ghost")).await;
        assert!(ns.is_empty());
    }

    #[tokio::test]
    async fn broadcast_to_room() {
        let ns = namespace();
        let (a, mut pa) = connected(&ns, "a").await;
        let (_b, mut pb) = connected(&ns, "b").await;
        a.join("lobby").await.unwrap();
        assert_eq!(ns.broadcast_to("lobby", "news", vec![json!(1)]).await, 1);
        assert_eq!(pa.recv_event().await.unwrap().name, "news");
        assert!(pb.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn emit_all_reaches_everyone() {
        let ns = namespace();
        let (_a, mut pa) = connected(&ns, "a").await;
        let (_b, mut pb) = connected(&ns, "b").await;
        assert_eq!(ns.emit_all("hello", vec![]), 2);
        assert_eq!(pa.recv_event().await.unwrap().name, "hello");
        assert_eq!(pb.recv_event().await.unwrap().name, "hello");
    }

    #[tokio::test]
    async fn disconnect_all_empties_namespace() {
        let ns = namespace();
        let (_a, mut pa) = connected(&ns, "a").await;
        let (_b, mut pb) = connected(&ns, "b").await;
        ns.disconnect_all();
        assert!(pa.recv_event().await.is_none());
        assert!(pb.recv_event().await.is_none());
        for _ in 0..50 {
            if ns.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(ns.is_empty());
    }

    #[test]
    fn handlers_registered_by_name() {
        let ns = namespace();
        ns.on("chat", handler_fn(|_s, _a| async { Ok(()) }));
        ns.on_connect(handler_fn(|_s, _a| async { Ok(()) }));
        ns.on_disconnect(handler_fn(|_s, _a| async { Ok(()) }));
        assert_eq!(
            ns.handlers().events(),
            vec!["chat", "connection", "disconnection"]
        );
    }
}

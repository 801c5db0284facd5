//! Adaptor that shares membership and broadcasts across nodes.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use metrics::counter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidal_core::{Event, NodeId, SessionId};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, warn};

use super::index::RoomIndex;
use super::local::{LocalAdaptor, encode_frame};
use super::BroadcastAdaptor;
use crate::bus::{BusStream, ClusterBus};
use crate::errors::BusError;
use crate::metrics::CLUSTER_PUBLISH_ERRORS_TOTAL;
use crate::transport::ConnectionHandle;

/// Wire message exchanged between nodes. Every message names its origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClusterMessage {
    /// A session on `node` joined `room`.
    Join {
        /// Origin node.
        node: NodeId,
        /// Room joined.
        room: String,
        /// Session that joined.
        session: SessionId,
    },
    /// A session on `node` left `room`.
    Leave {
        /// Origin node.
        node: NodeId,
        /// Room left.
        room: String,
        /// Session that left.
        session: SessionId,
    },
    /// A session on `node` left every room.
    LeaveAll {
        /// Origin node.
        node: NodeId,
        /// Session that left.
        session: SessionId,
    },
    /// Deliver an event to the local members of `room`.
    Send {
        /// Origin node.
        node: NodeId,
        /// Target room.
        room: String,
        /// Event name.
        event: String,
        /// Event arguments.
        args: Vec<Value>,
        /// Session to skip.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exclude: Option<SessionId>,
    },
}

impl ClusterMessage {
    /// Node the message came from.
    pub fn node(&self) -> &NodeId {
        match self {
            Self::Join { node, .. }
            | Self::Leave { node, .. }
            | Self::LeaveAll { node, .. }
            | Self::Send { node, .. } => node,
        }
    }
}

/// Membership and fan-out spanning every node on a [`ClusterBus`].
///
/// Local members are delivered to directly. Every membership change and
/// broadcast is also published so other nodes can deliver to their own
/// members and keep a view of remote membership. Remote views converge
/// eventually; local membership is always exact.
pub struct ClusterAdaptor {
    node: NodeId,
    local: Arc<LocalAdaptor>,
    remote: Arc<RwLock<RoomIndex>>,
    bus: Arc<dyn ClusterBus>,
    _listener: DropGuard,
}

impl ClusterAdaptor {
    /// Subscribe to `bus` and start applying messages from other nodes.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn new(bus: Arc<dyn ClusterBus>) -> Result<Self, BusError> {
        let stream = bus.subscribe().await?;
        let node = NodeId::new();
        let local = Arc::new(LocalAdaptor::new());
        let remote = Arc::new(RwLock::new(RoomIndex::default()));
        let shutdown = CancellationToken::new();

        let _ = tokio::spawn(listen(
            stream,
            node.clone(),
            Arc::clone(&local),
            Arc::clone(&remote),
            shutdown.clone(),
        ));
        info!(node = %node, "cluster adaptor started");

        Ok(Self {
            node,
            local,
            remote,
            bus,
            _listener: shutdown.drop_guard(),
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    /// Members of `room` on other nodes, as last reported.
    pub fn remote_members(&self, room: &str) -> BTreeSet<SessionId> {
        self.remote.read().members_of(room)
    }

    async fn publish(&self, message: &ClusterMessage) {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode cluster message");
                return;
            }
        };
        if let Err(e) = self.bus.publish(payload).await {
            counter!(CLUSTER_PUBLISH_ERRORS_TOTAL).increment(1);
            warn!(error = %e, "cluster publish failed, other nodes will miss this update");
        }
    }
}

#[instrument(skip_all, fields(node = %node))]
async fn listen(
    mut stream: BusStream,
    node: NodeId,
    local: Arc<LocalAdaptor>,
    remote: Arc<RwLock<RoomIndex>>,
    shutdown: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            () = shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(payload) => payload,
                None => {
                    warn!("cluster bus stream ended");
                    break;
                }
            },
        };
        match serde_json::from_slice::<ClusterMessage>(&payload) {
            Ok(message) if message.node() == &node => {}
            Ok(message) => apply(&local, &remote, message),
            Err(e) => warn!(error = %e, "dropping undecodable cluster message"),
        }
    }
    debug!("cluster listener stopped");
}

fn apply(local: &LocalAdaptor, remote: &RwLock<RoomIndex>, message: ClusterMessage) {
    match message {
        ClusterMessage::Join { room, session, .. } => {
            let _ = remote.write().insert(&room, &session);
        }
        ClusterMessage::Leave { room, session, .. } => {
            let _ = remote.write().remove(&room, &session);
        }
        ClusterMessage::LeaveAll { session, .. } => {
            let _ = remote.write().remove_all(&session);
        }
        ClusterMessage::Send {
            node,
            room,
            event,
            args,
            exclude,
        } => {
            if let Some(frame) = encode_frame(&Event::new(event, args)) {
                let delivered = local.deliver(&room, &frame, exclude.as_ref());
                debug!(origin = %node, room, delivered, "relayed remote broadcast");
            }
        }
    }
}

#[async_trait]
impl BroadcastAdaptor for ClusterAdaptor {
    async fn join(&self, room: &str, member: ConnectionHandle) {
        let session = member.id().clone();
        if self.local.add(room, member) {
            self.publish(&ClusterMessage::Join {
                node: self.node.clone(),
                room: room.to_owned(),
                session,
            })
            .await;
        }
    }

    async fn leave(&self, room: &str, session: &SessionId) {
        if self.local.remove(room, session) {
            self.publish(&ClusterMessage::Leave {
                node: self.node.clone(),
                room: room.to_owned(),
                session: session.clone(),
            })
            .await;
        }
    }

    async fn leave_all(&self, session: &SessionId) {
        if !self.local.remove_all(session).is_empty() {
            self.publish(&ClusterMessage::LeaveAll {
                node: self.node.clone(),
                session: session.clone(),
            })
            .await;
        }
    }

    async fn send(&self, room: &str, event: &Event, exclude: Option<&SessionId>) -> usize {
        let delivered = match encode_frame(event) {
            Some(frame) => self.local.deliver(room, &frame, exclude),
            None => return 0,
        };
        self.publish(&ClusterMessage::Send {
            node: self.node.clone(),
            room: room.to_owned(),
            event: event.name.clone(),
            args: event.args.clone(),
            exclude: exclude.cloned(),
        })
        .await;
        delivered
    }

    async fn rooms(&self, session: &SessionId) -> BTreeSet<String> {
        let mut rooms = self.local.rooms_of(session);
        rooms.extend(self.remote.read().rooms_of(session));
        rooms
    }

    async fn members(&self, room: &str) -> BTreeSet<SessionId> {
        let mut members = self.local.members_of(room);
        members.extend(self.remote.read().members_of(room));
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::transport::{Handshake, Peer, SessionParams, connection};
    use serde_json::json;
    use std::time::Duration;

    fn member(id: &str) -> (ConnectionHandle, Peer) {
        let (conn, peer) = connection::pair(
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
        (conn.handle, peer)
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn message_wire_format() {
        let msg = ClusterMessage::Join {
            node: NodeId::from("n1"),
            room: "lobby".into(),
            session: SessionId::from("s1"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "join", "node": "n1", "room": "lobby", "session": "s1"})
        );
        let back: ClusterMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn send_omits_missing_exclude() {
        let msg = ClusterMessage::Send {
            node: NodeId::from("n1"),
            room: "lobby".into(),
            event: "chat".into(),
            args: vec![json!(1)],
            exclude: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("exclude").is_none());
        assert_eq!(value["type"], "send");
    }

    #[tokio::test]
    async fn broadcast_reaches_other_node() {
        let bus = MemoryBus::new();
        let node_a = ClusterAdaptor::new(Arc::new(bus.clone())).await.unwrap();
        let node_b = ClusterAdaptor::new(Arc::new(bus.clone())).await.unwrap();
        let (a, mut pa) = member("a");
        let (b, mut pb) = member("b");
        node_a.join("lobby", a).await;
        node_b.join("lobby", b).await;

        let delivered = node_a
            .send("lobby", &Event::new("chat", vec![json!("hi")]), None)
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(pa.recv_event().await.unwrap().name, "chat");
        assert_eq!(pb.recv_event().await.unwrap().args, vec![json!("hi")]);
    }

    #[tokio::test]
    async fn own_messages_are_not_redelivered() {
        let bus = MemoryBus::new();
        let node = ClusterAdaptor::new(Arc::new(bus.clone())).await.unwrap();
        let (a, mut pa) = member("a");
        node.join("lobby", a).await;
        let _ = node.send("lobby", &Event::new("once", vec![]), None).await;
        assert_eq!(pa.recv_event().await.unwrap().name, "once");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pa.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn exclude_applies_across_nodes() {
        let bus = MemoryBus::new();
        let node_a = ClusterAdaptor::new(Arc::new(bus.clone())).await.unwrap();
        let node_b = ClusterAdaptor::new(Arc::new(bus.clone())).await.unwrap();
        let (b, mut pb) = member("b");
        let (c, mut pc) = member("c");
        node_b.join("lobby", b).await;
        node_b.join("lobby", c).await;

        let skip = SessionId::from("b");
        let _ = node_a
            .send("lobby", &Event::new("chat", vec![]), Some(&skip))
            .await;
        assert_eq!(pc.recv_event().await.unwrap().name, "chat");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pb.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn remote_membership_converges() {
        let bus = MemoryBus::new();
        let node_a = ClusterAdaptor::new(Arc::new(bus.clone())).await.unwrap();
        let node_b = ClusterAdaptor::new(Arc::new(bus.clone())).await.unwrap();
        let (a, _pa) = member("a");
        let id = a.id().clone();
        node_a.join("lobby", a.clone()).await;
        node_a.join("game", a).await;

        eventually(|| node_b.remote_members("lobby").contains(&id)).await;
        assert_eq!(node_b.rooms(&id).await.len(), 2);
        assert!(node_b.members("game").await.contains(&id));

        node_a.leave("game", &id).await;
        eventually(|| node_b.remote_members("game").is_empty()).await;

        node_a.leave_all(&id).await;
        eventually(|| node_b.remote_members("lobby").is_empty()).await;
        assert!(node_b.rooms(&id).await.is_empty());
    }

    #[tokio::test]
    async fn garbage_on_bus_is_ignored() {
        let bus = MemoryBus::new();
        let node = ClusterAdaptor::new(Arc::new(bus.clone())).await.unwrap();
        let (a, mut pa) = member("a");
        node.join("lobby", a).await;
        bus.publish(b"not json".to_vec()).await.unwrap();
        let other = ClusterMessage::Send {
            node: NodeId::from("elsewhere"),
            room: "lobby".into(),
            event: "after".into(),
            args: vec![],
            exclude: None,
        };
        bus.publish(serde_json::to_vec(&other).unwrap()).await.unwrap();
        assert_eq!(pa.recv_event().await.unwrap().name, "after");
    }

    #[tokio::test]
    async fn dropping_adaptor_stops_listener() {
        let bus = MemoryBus::new();
        let node = ClusterAdaptor::new(Arc::new(bus.clone())).await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(node);
        eventually(|| bus.subscriber_count() == 0).await;
    }
}

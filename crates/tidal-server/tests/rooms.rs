//! Room membership and broadcast behavior through in-process connections.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::timeout;

use tidal_server::{
    BroadcastAdaptor, ClusterAdaptor, LocalAdaptor, MemoryBus, Peer, Server, SessionId, Socket,
    SocketState, handler_fn,
};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn wait_for(check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Open a local client on the root namespace and return it with its socket.
async fn client(server: &Server) -> (Peer, Arc<Socket>) {
    let mut peer = server.connect_local("/").await.unwrap();
    let open = timeout(TIMEOUT, peer.recv_event()).await.unwrap().unwrap();
    assert_eq!(open.name, "open");
    let socket = server.root().socket(peer.id()).unwrap();
    (peer, socket)
}

/// Next event name, or `None` if nothing arrives shortly.
async fn next_name(peer: &mut Peer) -> Option<String> {
    timeout(Duration::from_millis(100), peer.recv_event())
        .await
        .ok()
        .flatten()
        .map(|event| event.name)
}

#[tokio::test]
async fn double_join_lists_room_once() {
    let server = Server::new(None).unwrap();
    let (mut peer, socket) = client(&server).await;

    socket.join("lobby").await.unwrap();
    socket.join("lobby").await.unwrap();
    assert_eq!(socket.rooms().await, BTreeSet::from(["lobby".to_owned()]));

    assert_eq!(server.broadcast_to("lobby", "ping", vec![]).await, 1);
    assert_eq!(next_name(&mut peer).await.as_deref(), Some("ping"));
    assert_eq!(next_name(&mut peer).await, None);
}

#[tokio::test]
async fn closed_session_leaves_every_room() {
    let server = Server::new(None).unwrap();
    let (peer, socket) = client(&server).await;
    let (mut other, other_socket) = client(&server).await;
    for room in ["a", "b"] {
        socket.join(room).await.unwrap();
        other_socket.join(room).await.unwrap();
    }

    peer.close();
    let root = server.root();
    let id = socket.id().clone();
    wait_for(|| root.socket(&id).is_none()).await;
    assert_eq!(socket.state(), SocketState::Closed);

    let adaptor = root.adaptor();
    assert!(adaptor.rooms(&id).await.is_empty());
    assert!(!adaptor.members("a").await.contains(&id));
    assert_eq!(server.broadcast_to("a", "news", vec![]).await, 1);
    assert_eq!(next_name(&mut other).await.as_deref(), Some("news"));
}

#[tokio::test]
async fn join_after_close_is_refused() {
    let server = Server::new(None).unwrap();
    let (peer, socket) = client(&server).await;
    peer.close();
    let id = socket.id().clone();
    let root = server.root();
    wait_for(|| root.socket(&id).is_none()).await;

    assert!(socket.join("lobby").await.is_err());
    assert!(root.adaptor().members("lobby").await.is_empty());
}

#[tokio::test]
async fn concurrent_join_leave_on_disjoint_rooms() {
    let server = Server::new(None).unwrap();
    let (_pa, a) = client(&server).await;
    let (_pb, b) = client(&server).await;
    b.join("stable").await.unwrap();

    let churn = |socket: Arc<Socket>, prefix: &'static str| {
        tokio::spawn(async move {
            for i in 0..50 {
                let room = format!("{prefix}-{i}");
                socket.join(&room).await.unwrap();
                socket.leave(&room).await;
            }
        })
    };
    let (ra, rb) = tokio::join!(churn(Arc::clone(&a), "a"), churn(Arc::clone(&b), "b"));
    ra.unwrap();
    rb.unwrap();

    assert!(a.rooms().await.is_empty());
    assert_eq!(b.rooms().await, BTreeSet::from(["stable".to_owned()]));
    assert_eq!(
        server.root().adaptor().members("stable").await,
        BTreeSet::from([b.id().clone()])
    );
}

#[tokio::test]
async fn adaptor_swap_starts_with_empty_membership() {
    let server = Server::new(None).unwrap();
    let adaptor = Arc::new(LocalAdaptor::new());
    server.set_adaptor(Arc::clone(&adaptor) as Arc<dyn BroadcastAdaptor>);
    assert_eq!(adaptor.room_count(), 0);

    let (_peer, socket) = client(&server).await;
    assert!(socket.rooms().await.is_empty());
    socket.join("lobby").await.unwrap();
    assert_eq!(adaptor.room_count(), 1);
}

#[tokio::test]
async fn disconnect_mid_broadcast_still_serves_the_rest() {
    let server = Server::new(None).unwrap();
    let mut peers = Vec::new();
    for _ in 0..5 {
        let (peer, socket) = client(&server).await;
        socket.join("lobby").await.unwrap();
        peers.push((peer, socket));
    }
    let (leaver, _) = peers.remove(2);

    let broadcasts = {
        let server = server.clone();
        tokio::spawn(async move {
            let mut total = 0;
            for i in 0..20 {
                total += server.broadcast_to("lobby", "tick", vec![json!(i)]).await;
                tokio::task::yield_now().await;
            }
            total
        })
    };
    leaver.close();
    let total = broadcasts.await.unwrap();
    assert!(total >= 20 * 4, "delivered {total}");

    for (peer, _) in &mut peers {
        for i in 0..20 {
            let event = timeout(TIMEOUT, peer.recv_event()).await.unwrap().unwrap();
            assert_eq!(event.name, "tick");
            assert_eq!(event.args, vec![json!(i)]);
        }
    }
}

#[tokio::test]
async fn emit_from_connect_handler_arrives_after_open() {
    let server = Server::new(None).unwrap();
    server.on_connect(handler_fn(|s: Arc<Socket>, _args: Vec<Value>| async move {
        s.emit("welcome", vec![json!(s.id().as_str())])?;
        Ok(())
    }));

    let (mut peer, socket) = client(&server).await;
    let welcome = timeout(TIMEOUT, peer.recv_event()).await.unwrap().unwrap();
    assert_eq!(welcome.name, "welcome");
    assert_eq!(welcome.args, vec![json!(socket.id().as_str())]);
}

#[tokio::test]
async fn events_dispatch_in_arrival_order() {
    let server = Server::new(None).unwrap();
    server.on(
        "n",
        handler_fn(|s: Arc<Socket>, args: Vec<Value>| async move {
            s.emit("n", args)?;
            Ok(())
        }),
    );
    let (mut peer, _socket) = client(&server).await;
    for i in 0..10 {
        peer.emit("n", vec![json!(i)]).await.unwrap();
    }
    for i in 0..10 {
        let event = timeout(TIMEOUT, peer.recv_event()).await.unwrap().unwrap();
        assert_eq!(event.args, vec![json!(i)]);
    }
}

#[tokio::test]
async fn namespaces_keep_separate_rooms() {
    let server = Server::new(None).unwrap();
    let (mut root_peer, root_socket) = client(&server).await;
    root_socket.join("lobby").await.unwrap();

    let chat = server.of("/chat");
    let mut chat_peer = server.connect_local("/chat").await.unwrap();
    assert_eq!(chat_peer.recv_event().await.unwrap().name, "open");
    let chat_socket = chat.socket(chat_peer.id()).unwrap();
    chat_socket.join("lobby").await.unwrap();

    assert_eq!(chat.broadcast_to("lobby", "chat-only", vec![]).await, 1);
    assert_eq!(next_name(&mut chat_peer).await.as_deref(), Some("chat-only"));
    assert_eq!(next_name(&mut root_peer).await, None);
}

async fn cluster_node(bus: &MemoryBus) -> Server {
    let server = Server::new(None).unwrap();
    let adaptor = ClusterAdaptor::new(Arc::new(bus.clone())).await.unwrap();
    server.set_adaptor(Arc::new(adaptor));
    server
}

#[tokio::test]
async fn cluster_broadcast_reaches_other_node() {
    let bus = MemoryBus::new();
    let node1 = cluster_node(&bus).await;
    let node2 = cluster_node(&bus).await;

    let (mut remote_peer, remote_socket) = client(&node2).await;
    remote_socket.join("lobby").await.unwrap();

    let adaptor = node1.root().adaptor();
    let remote_id: SessionId = remote_socket.id().clone();
    for _ in 0..400 {
        if adaptor.members("lobby").await.contains(&remote_id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(adaptor.members("lobby").await.contains(&remote_id));

    assert_eq!(node1.broadcast_to("lobby", "news", vec![json!("x")]).await, 0);
    let event = timeout(TIMEOUT, remote_peer.recv_event()).await.unwrap().unwrap();
    assert_eq!(event.name, "news");
    assert_eq!(event.args, vec![json!("x")]);
}

#[tokio::test]
async fn cluster_node_delivers_locally_once() {
    let bus = MemoryBus::new();
    let node1 = cluster_node(&bus).await;
    let _node2 = cluster_node(&bus).await;

    let (mut peer, socket) = client(&node1).await;
    socket.join("lobby").await.unwrap();

    assert_eq!(node1.broadcast_to("lobby", "news", vec![]).await, 1);
    assert_eq!(next_name(&mut peer).await.as_deref(), Some("news"));
    assert_eq!(next_name(&mut peer).await, None);
}

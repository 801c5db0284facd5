//! The server: transport engine, namespace table and accept loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, Uri};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::RwLock;
use serde_json::Value;
use tidal_settings::{ServerSettings, TidalSettings};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};

use crate::adaptor::{BroadcastAdaptor, LocalAdaptor};
use crate::errors::{ConfigurationError, TransportError};
use crate::handler::EventHandler;
use crate::health::{HealthResponse, health_check};
use crate::namespace::Namespace;
use crate::shutdown::ShutdownCoordinator;
use crate::socket::Socket;
use crate::transport::{
    AccessControl, Connection, Engine, Handshake, Peer, TransportKind, TransportPolicy,
    normalize_namespace, websocket,
};

/// Path the WebSocket endpoint is mounted on by default.
pub const DEFAULT_PATH: &str = "/socket.io";

/// Namespaces by name. The root namespace `/` always exists.
struct NamespaceTable {
    map: RwLock<HashMap<String, Arc<Namespace>>>,
}

impl NamespaceTable {
    fn new() -> Self {
        let root = Namespace::new("/", Arc::new(LocalAdaptor::new()));
        Self {
            map: RwLock::new(HashMap::from([("/".to_owned(), root)])),
        }
    }

    fn of(&self, name: &str) -> Arc<Namespace> {
        let name = normalize_namespace(name);
        if let Some(ns) = self.map.read().get(&name) {
            return Arc::clone(ns);
        }
        let mut map = self.map.write();
        Arc::clone(map.entry(name.clone()).or_insert_with(|| {
            info!(namespace = %name, "namespace created");
            Namespace::new(name.clone(), Arc::new(LocalAdaptor::new()))
        }))
    }

    fn get(&self, name: &str) -> Option<Arc<Namespace>> {
        self.map.read().get(name).cloned()
    }

    fn contains(&self, name: &str) -> bool {
        self.map.read().contains_key(name)
    }

    /// Swap the root for a fresh namespace on `adaptor`, keeping its handlers.
    fn replace_root(&self, adaptor: Arc<dyn BroadcastAdaptor>) -> Arc<Namespace> {
        let mut map = self.map.write();
        let handlers = map
            .get("/")
            .map(|ns| ns.shared_handlers())
            .unwrap_or_default();
        let root = Namespace::with_handlers("/", adaptor, handlers);
        map.insert("/".to_owned(), root)
            .unwrap_or_else(|| Namespace::new("/", Arc::new(LocalAdaptor::new())))
    }

    fn all(&self) -> Vec<Arc<Namespace>> {
        self.map.read().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }
}

struct ServerInner {
    engine: Arc<Engine>,
    namespaces: Arc<NamespaceTable>,
    shutdown: ShutdownCoordinator,
    sessions: TaskTracker,
    path: String,
    started: Instant,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        self.engine.close();
    }
}

/// Real-time event server.
///
/// Cheap to clone; clones share one engine and namespace table. Dropping the
/// last clone stops the accept loop and closes every connection.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Server on the named transports (default: websocket), default policy.
    ///
    /// Starts the accept loop, so it must be called inside a tokio runtime.
    pub fn new(transports: Option<&[&str]>) -> Result<Self, ConfigurationError> {
        let engine = Engine::new(transports)?;
        Self::with_engine(engine, DEFAULT_PATH)
    }

    /// Server configured from loaded settings. Cluster settings are ignored;
    /// use [`Server::from_settings`] for those.
    pub fn with_settings(settings: &ServerSettings) -> Result<Self, ConfigurationError> {
        settings.validate()?;
        let transports = TransportKind::parse_all(Some(settings.transports.as_slice()))?;
        let engine = Engine::with_policy(transports, TransportPolicy::from_settings(settings));
        Self::with_engine(engine, &settings.path)
    }

    /// Server configured from the full settings document, attaching the
    /// cluster adaptor to the root namespace when clustering is enabled.
    pub async fn from_settings(settings: &TidalSettings) -> Result<Self, ConfigurationError> {
        settings.validate()?;
        let server = Self::with_settings(&settings.server)?;
        if settings.cluster.enabled {
            let adaptor = cluster_adaptor(settings).await?;
            server.set_adaptor(adaptor);
        }
        Ok(server)
    }

    fn with_engine(engine: Engine, path: &str) -> Result<Self, ConfigurationError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ConfigurationError::NoRuntime)?;
        let namespaces = Arc::new(NamespaceTable::new());
        let table = Arc::clone(&namespaces);
        engine.set_namespace_filter(move |name| table.contains(name));
        let inner = Arc::new(ServerInner {
            engine: Arc::new(engine),
            namespaces,
            shutdown: ShutdownCoordinator::new(),
            sessions: TaskTracker::new(),
            path: path.to_owned(),
            started: Instant::now(),
        });
        let _ = runtime.spawn(accept_loop(
            Arc::clone(&inner.engine),
            Arc::clone(&inner.namespaces),
            inner.sessions.clone(),
            inner.shutdown.token(),
        ));
        info!(
            path = %inner.path,
            transports = ?inner.engine.transports(),
            "server started"
        );
        Ok(Self { inner })
    }

    /// The transport engine.
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Set how long a connection may stay silent before it is dropped.
    pub fn set_ping_timeout(&self, timeout: Duration) {
        self.inner.engine.set_ping_timeout(timeout);
    }

    /// Set the keep-alive ping interval.
    pub fn set_ping_interval(&self, interval: Duration) {
        self.inner.engine.set_ping_interval(interval);
    }

    /// Cap concurrently open connections. Existing connections are kept.
    pub fn set_max_connection(&self, max: usize) {
        self.inner.engine.set_max_connections(max);
    }

    /// Install an admission predicate run for every new connection.
    pub fn set_allow_request<F>(&self, allow: F)
    where
        F: Fn(&Handshake) -> Result<(), String> + Send + Sync + 'static,
    {
        self.inner.engine.set_allow_request(allow);
    }

    /// Toggle advertising transport upgrades in the open frame.
    pub fn set_allow_upgrades(&self, allow: bool) {
        self.inner.engine.set_allow_upgrades(allow);
    }

    /// Install a hook producing CORS headers for handshake responses.
    pub fn set_access_control<F>(&self, access: F)
    where
        F: Fn(&Handshake) -> AccessControl + Send + Sync + 'static,
    {
        self.inner.engine.set_access_control(access);
    }

    /// Set the session cookie name. Empty disables the cookie.
    pub fn set_cookie(&self, name: impl Into<String>) {
        self.inner.engine.set_cookie(name);
    }

    /// Replace the root namespace with a fresh one on `adaptor`.
    ///
    /// Handlers carry over; sessions and room membership of the old root do
    /// not. Call before accepting connections.
    pub fn set_adaptor(&self, adaptor: Arc<dyn BroadcastAdaptor>) {
        let previous = self.inner.namespaces.replace_root(adaptor);
        if previous.is_empty() {
            info!("root namespace adaptor replaced");
        } else {
            warn!(
                sessions = previous.len(),
                "root adaptor replaced while sessions are attached, their rooms are discarded"
            );
        }
    }

    /// The root namespace.
    pub fn root(&self) -> Arc<Namespace> {
        self.inner.namespaces.of("/")
    }

    /// Namespace by name, created on first use.
    ///
    /// Clients can only attach to namespaces that exist; a handshake naming
    /// any other namespace is refused.
    pub fn of(&self, name: &str) -> Arc<Namespace> {
        self.inner.namespaces.of(name)
    }

    /// Register a root namespace handler.
    pub fn on(&self, event: &str, handler: impl EventHandler + 'static) {
        self.root().on(event, handler);
    }

    /// Register the root namespace connect handler.
    pub fn on_connect(&self, handler: impl EventHandler + 'static) {
        self.root().on_connect(handler);
    }

    /// Register the root namespace disconnect handler.
    pub fn on_disconnect(&self, handler: impl EventHandler + 'static) {
        self.root().on_disconnect(handler);
    }

    /// Send an event to every session in `room` of the root namespace.
    ///
    /// Returns the number of local recipients the event was queued for.
    pub async fn broadcast_to(&self, room: &str, event: &str, args: Vec<Value>) -> usize {
        self.root().broadcast_to(room, event, args).await
    }

    /// Open an in-process connection to `namespace`.
    ///
    /// Goes through the same admission checks as a WebSocket client.
    pub async fn connect_local(&self, namespace: &str) -> Result<Peer, TransportError> {
        let handshake = Handshake::for_namespace(namespace)?;
        self.inner.engine.open(handshake).await
    }

    /// Open transport connections.
    pub fn connection_count(&self) -> usize {
        self.inner.engine.active_connections()
    }

    /// Sessions attached across all namespaces.
    pub fn session_count(&self) -> usize {
        self.inner.namespaces.all().iter().map(|ns| ns.len()).sum()
    }

    /// Current health snapshot.
    pub fn health(&self) -> HealthResponse {
        health_check(
            self.inner.started,
            self.inner.shutdown.is_shutting_down(),
            self.connection_count(),
            self.session_count(),
            self.inner.namespaces.len(),
        )
    }

    /// HTTP routes: the WebSocket endpoint and `/health`.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.inner.path, get(upgrade_handler))
            .route("/health", get(health_handler))
            .with_state(self.clone())
    }

    /// Serve [`Server::router`] on `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let stop = self.inner.shutdown.token();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, path = %self.inner.path, "listening");
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(stop.cancelled_owned())
            .await
    }

    /// Stop accepting, disconnect every session and wait for them to finish.
    ///
    /// Returns `false` if sessions were still running after `timeout`.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> bool {
        info!("server shutting down");
        self.inner.shutdown.shutdown();
        for ns in self.inner.namespaces.all() {
            ns.disconnect_all();
        }
        self.inner.engine.close();
        self.inner
            .shutdown
            .drain(&self.inner.sessions, timeout)
            .await
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("path", &self.inner.path)
            .field("engine", &self.inner.engine)
            .field("namespaces", &self.inner.namespaces.len())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "redis")]
async fn cluster_adaptor(
    settings: &TidalSettings,
) -> Result<Arc<dyn BroadcastAdaptor>, ConfigurationError> {
    use crate::adaptor::ClusterAdaptor;
    use crate::bus::RedisBus;

    let url = settings
        .cluster
        .redis_url
        .as_deref()
        .ok_or_else(|| ConfigurationError::Cluster("cluster.redisUrl is not set".into()))?;
    let bus = RedisBus::connect(url, settings.cluster.channel.clone())
        .await
        .map_err(|e| ConfigurationError::Cluster(e.to_string()))?;
    let adaptor = ClusterAdaptor::new(Arc::new(bus))
        .await
        .map_err(|e| ConfigurationError::Cluster(e.to_string()))?;
    Ok(Arc::new(adaptor))
}

#[cfg(not(feature = "redis"))]
async fn cluster_adaptor(
    _settings: &TidalSettings,
) -> Result<Arc<dyn BroadcastAdaptor>, ConfigurationError> {
    Err(ConfigurationError::Cluster(
        "built without the `redis` feature".into(),
    ))
}

async fn upgrade_handler(
    State(server): State<Server>,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    websocket::handle_upgrade(&server.inner.engine, ws, uri, headers).await
}

async fn health_handler(State(server): State<Server>) -> Json<HealthResponse> {
    Json(server.health())
}

/// Hand each admitted connection to a new session task until the engine
/// fails or shutdown is signalled.
#[instrument(skip_all, name = "accept_loop")]
async fn accept_loop(
    engine: Arc<Engine>,
    namespaces: Arc<NamespaceTable>,
    sessions: TaskTracker,
    stop: CancellationToken,
) {
    loop {
        let connection = tokio::select! {
            () = stop.cancelled() => {
                info!("accept loop stopped");
                break;
            }
            accepted = engine.accept() => match accepted {
                Ok(connection) => connection,
                Err(e) => {
                    error!(error = %e, "accept failed, no longer accepting connections");
                    break;
                }
            },
        };
        let Connection {
            handle,
            handshake,
            inbound,
            params,
        } = connection;
        let name = handshake.namespace();
        let Some(namespace) = namespaces.get(&name) else {
            warn!(namespace = %name, session_id = %handle.id(), "namespace vanished before attach");
            handle.close();
            continue;
        };
        let socket = Socket::new(namespace, handle, handshake);
        let _ = sessions.spawn(socket.run(inbound, params));
    }
}

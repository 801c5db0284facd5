//! Connection admission and the accept queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use metrics::counter;
use parking_lot::RwLock;
use tidal_core::SessionId;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{self, Connection, Peer, SessionParams};
use super::heartbeat::MIN_PING_INTERVAL;
use super::policy::{AccessControl, TransportKind, TransportPolicy};
use super::Handshake;
use crate::errors::{AcceptError, ConfigurationError, TransportError};
use crate::metrics::{CONNECTIONS_ADMITTED_TOTAL, CONNECTIONS_REJECTED_TOTAL};

/// Admitted connections waiting for the accept loop.
const ACCEPT_BACKLOG: usize = 1024;

/// Whether a requested namespace may be attached to.
pub type NamespaceFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Admits connections under the current [`TransportPolicy`] and queues them
/// for [`Engine::accept`].
///
/// Each admitted connection holds one slot of `max_connections` until it closes.
pub struct Engine {
    transports: Vec<TransportKind>,
    policy: RwLock<TransportPolicy>,
    namespace_filter: RwLock<Option<NamespaceFilter>>,
    queue_tx: mpsc::Sender<Connection>,
    queue_rx: Mutex<mpsc::Receiver<Connection>>,
    active: Arc<AtomicUsize>,
    closed: CancellationToken,
}

impl Engine {
    /// Engine for the named transports (default: websocket) with default policy.
    pub fn new<S: AsRef<str>>(transports: Option<&[S]>) -> Result<Self, ConfigurationError> {
        let transports = TransportKind::parse_all(transports)?;
        Ok(Self::with_policy(transports, TransportPolicy::default()))
    }

    /// Engine with an explicit policy.
    pub fn with_policy(transports: Vec<TransportKind>, policy: TransportPolicy) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(ACCEPT_BACKLOG);
        Self {
            transports,
            policy: RwLock::new(policy),
            namespace_filter: RwLock::new(None),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            active: Arc::new(AtomicUsize::new(0)),
            closed: CancellationToken::new(),
        }
    }

    /// Enabled transports.
    pub fn transports(&self) -> &[TransportKind] {
        &self.transports
    }

    /// Snapshot of the current policy.
    pub fn policy(&self) -> TransportPolicy {
        self.policy.read().clone()
    }

    /// Mutate the policy in place.
    pub fn update_policy(&self, f: impl FnOnce(&mut TransportPolicy)) {
        f(&mut self.policy.write());
    }

    /// Set how long a connection may stay silent.
    pub fn set_ping_timeout(&self, timeout: Duration) {
        self.update_policy(|p| p.ping_timeout = timeout);
    }

    /// Set the keep-alive ping interval, raised to [`MIN_PING_INTERVAL`].
    pub fn set_ping_interval(&self, interval: Duration) {
        if interval < MIN_PING_INTERVAL {
            warn!(?interval, min = ?MIN_PING_INTERVAL, "ping interval too short, clamping");
        }
        let interval = interval.max(MIN_PING_INTERVAL);
        self.update_policy(|p| p.ping_interval = interval);
    }

    /// Set the open-connection cap. Already open connections are kept.
    pub fn set_max_connections(&self, max: usize) {
        self.update_policy(|p| p.max_connections = max);
    }

    /// Install an admission predicate.
    pub fn set_allow_request<F>(&self, allow: F)
    where
        F: Fn(&Handshake) -> Result<(), String> + Send + Sync + 'static,
    {
        self.update_policy(|p| p.allow_request = Some(Arc::new(allow)));
    }

    /// Toggle advertising transport upgrades.
    pub fn set_allow_upgrades(&self, allow: bool) {
        self.update_policy(|p| p.allow_upgrades = allow);
    }

    /// Install a CORS header hook.
    pub fn set_access_control<F>(&self, access: F)
    where
        F: Fn(&Handshake) -> AccessControl + Send + Sync + 'static,
    {
        self.update_policy(|p| p.access_control = Some(Arc::new(access)));
    }

    /// Set the session cookie name. Empty disables the cookie.
    pub fn set_cookie(&self, name: impl Into<String>) {
        let name = name.into();
        self.update_policy(|p| p.cookie = name);
    }

    /// Refuse connections whose requested namespace fails `filter`.
    ///
    /// Without a filter every namespace is admitted.
    pub fn set_namespace_filter<F>(&self, filter: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        *self.namespace_filter.write() = Some(Arc::new(filter));
    }

    /// Connections currently holding a slot.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Admit a connection and queue its server half for [`Engine::accept`].
    ///
    /// The requested namespace is checked first, then the connection cap,
    /// then the admission predicate.
    #[instrument(skip_all, fields(path = %handshake.uri().path()))]
    pub async fn open(&self, handshake: Handshake) -> Result<Peer, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let filter = self.namespace_filter.read().clone();
        if let Some(filter) = filter {
            let namespace = handshake.namespace();
            if !filter(&namespace) {
                debug!(namespace = %namespace, "connection for unknown namespace refused");
                counter!(CONNECTIONS_REJECTED_TOTAL, "reason" => "invalid_namespace").increment(1);
                return Err(TransportError::InvalidNamespace(namespace));
            }
        }
        let policy = self.policy();

        let max = policy.max_connections;
        if self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            warn!(max, "connection limit reached");
            counter!(CONNECTIONS_REJECTED_TOTAL, "reason" => "connection_limit").increment(1);
            return Err(TransportError::ConnectionLimit { max });
        }

        if let Err(reason) = policy.admit(&handshake) {
            let _ = self.active.fetch_sub(1, Ordering::AcqRel);
            debug!(reason = %reason, "connection rejected by request predicate");
            counter!(CONNECTIONS_REJECTED_TOTAL, "reason" => "rejected").increment(1);
            return Err(TransportError::Rejected(reason));
        }

        let token = self.closed.child_token();
        let release = {
            let token = token.clone();
            let active = Arc::clone(&self.active);
            async move {
                token.cancelled().await;
                let _ = active.fetch_sub(1, Ordering::AcqRel);
            }
        };
        let _ = tokio::spawn(release);

        let params = SessionParams {
            ping_interval: policy.ping_interval,
            ping_timeout: policy.ping_timeout,
            upgrades: self.upgrades(&policy, TransportKind::WebSocket),
        };
        let (connection, peer) = connection::pair(
            SessionId::new(),
            handshake,
            params,
            policy.outbound_buffer,
            token.clone(),
        );

        if self.queue_tx.send(connection).await.is_err() {
            token.cancel();
            return Err(TransportError::Closed);
        }
        counter!(CONNECTIONS_ADMITTED_TOTAL).increment(1);
        debug!(session_id = %peer.id(), "connection admitted");
        Ok(peer)
    }

    /// Next admitted connection.
    ///
    /// Fails once the engine is closed; the accept loop treats that as terminal.
    pub async fn accept(&self) -> Result<Connection, AcceptError> {
        let mut queue = self.queue_rx.lock().await;
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(AcceptError::Closed),
            next = queue.recv() => next.ok_or(AcceptError::Closed),
        }
    }

    /// Stop admitting, fail [`Engine::accept`] and close every open connection.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            info!(active = self.active_connections(), "transport engine closing");
        }
        self.closed.cancel();
    }

    /// Whether [`Engine::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn upgrades(&self, policy: &TransportPolicy, current: TransportKind) -> Vec<String> {
        if !policy.allow_upgrades {
            return Vec::new();
        }
        self.transports
            .iter()
            .filter(|&&t| t != current)
            .map(|t| t.as_str().to_owned())
            .collect()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("transports", &self.transports)
            .field("active", &self.active_connections())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

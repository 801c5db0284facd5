//! Event handler registry and dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::metrics::{EVENTS_RECEIVED_TOTAL, HANDLER_DURATION_SECONDS, HANDLER_ERRORS_TOTAL};
use crate::socket::Socket;

/// Fired once a session is connected. Called with no arguments.
pub const CONNECT_EVENT: &str = "connection";
/// Fired after a session leaves its namespace. Called with the reason string.
pub const DISCONNECT_EVENT: &str = "disconnection";
/// Inbound event a client sends to end its session.
pub const CLIENT_DISCONNECT_EVENT: &str = "disconnect";
/// First frame a client receives.
pub const OPEN_EVENT: &str = "open";

/// Metric label for events with no registered handler.
pub const UNKNOWN_EVENT_LABEL: &str = "unknown";

/// Event names clients may not trigger.
pub fn is_reserved(name: &str) -> bool {
    matches!(name, CONNECT_EVENT | DISCONNECT_EVENT | OPEN_EVENT)
}

/// Callback for one event name.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event received by `socket`.
    async fn handle(&self, socket: Arc<Socket>, args: Vec<Value>) -> anyhow::Result<()>;
}

/// [`EventHandler`] backed by an async closure. Build with [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arc<Socket>, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Socket>, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, socket: Arc<Socket>, args: Vec<Value>) -> anyhow::Result<()> {
        (self.0)(socket, args).await
    }
}

/// What happened to a dispatched event.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The handler ran to completion.
    Handled,
    /// No handler is registered for the event.
    NoHandler,
    /// The handler returned an error.
    Failed(anyhow::Error),
    /// The handler exceeded the dispatch timeout.
    TimedOut,
}

/// Handlers for one namespace, keyed by event name.
///
/// Shared by reference so a replacement namespace can keep the same handlers.
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
    timeout: Duration,
}

impl HandlerTable {
    /// Maximum time a single handler is allowed to run.
    pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

    /// Empty table with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(Self::HANDLER_TIMEOUT)
    }

    /// Empty table with a custom handler timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Register `handler` for `event`, replacing any previous one.
    pub fn register(&self, event: &str, handler: impl EventHandler + 'static) {
        if self
            .handlers
            .write()
            .insert(event.to_owned(), Arc::new(handler))
            .is_some()
        {
            debug!(event, "replaced event handler");
        }
    }

    /// Remove the handler for `event`.
    pub fn unregister(&self, event: &str) -> bool {
        self.handlers.write().remove(event).is_some()
    }

    /// Whether a handler exists for `event`.
    pub fn has_handler(&self, event: &str) -> bool {
        self.handlers.read().contains_key(event)
    }

    /// Registered event names, sorted.
    pub fn events(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the handler for `event`, bounded by the table's timeout.
    ///
    /// Handler errors and timeouts are logged and counted, never propagated.
    /// Metrics carry the event name only for registered events; anything
    /// else is counted under [`UNKNOWN_EVENT_LABEL`].
    pub async fn dispatch(
        &self,
        event: &str,
        socket: &Arc<Socket>,
        args: Vec<Value>,
    ) -> DispatchOutcome {
        let handler = self.handlers.read().get(event).cloned();
        let Some(handler) = handler else {
            counter!(EVENTS_RECEIVED_TOTAL, "event" => UNKNOWN_EVENT_LABEL).increment(1);
            debug!(event, session_id = %socket.id(), "no handler for event");
            return DispatchOutcome::NoHandler;
        };
        counter!(EVENTS_RECEIVED_TOTAL, "event" => event.to_owned()).increment(1);

        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, handler.handle(Arc::clone(socket), args)).await;
        let duration = start.elapsed();
        histogram!(HANDLER_DURATION_SECONDS, "event" => event.to_owned()).record(duration.as_secs_f64());

        match result {
            Ok(Ok(())) => {
                if duration.as_secs() >= 5 {
                    warn!(event, duration_secs = duration.as_secs_f64(), "slow event handler");
                }
                DispatchOutcome::Handled
            }
            Ok(Err(err)) => {
                counter!(HANDLER_ERRORS_TOTAL, "event" => event.to_owned(), "error_type" => "failed").increment(1);
                warn!(event, session_id = %socket.id(), error = %err, "event handler failed");
                DispatchOutcome::Failed(err)
            }
            Err(_elapsed) => {
                counter!(HANDLER_ERRORS_TOTAL, "event" => event.to_owned(), "error_type" => "timeout").increment(1);
                error!(event, session_id = %socket.id(), "event handler timed out after {:?}", self.timeout);
                DispatchOutcome::TimedOut
            }
        }
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

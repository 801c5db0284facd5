//! Transport selection and the tunable connection policy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, header};
use tidal_settings::ServerSettings;
use tracing::warn;

use super::Handshake;
use super::heartbeat::MIN_PING_INTERVAL;
use crate::errors::ConfigurationError;

/// A transport a client may connect with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Full-duplex WebSocket frames.
    WebSocket,
}

impl TransportKind {
    /// Transports used when the caller names none.
    pub const DEFAULT: &'static [&'static str] = &["websocket"];

    /// Resolve a transport name.
    ///
    /// `polling` is recognised but not offered by this server.
    pub fn parse(name: &str) -> Result<Self, ConfigurationError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "websocket" => Ok(Self::WebSocket),
            "polling" => Err(ConfigurationError::UnsupportedTransport(name.to_owned())),
            _ => Err(ConfigurationError::UnknownTransport(name.to_owned())),
        }
    }

    /// Resolve a transport list, falling back to [`Self::DEFAULT`] when absent.
    pub fn parse_all<S: AsRef<str>>(names: Option<&[S]>) -> Result<Vec<Self>, ConfigurationError> {
        let kinds = match names {
            Some(names) => names
                .iter()
                .map(|n| Self::parse(n.as_ref()))
                .collect::<Result<Vec<_>, _>>()?,
            None => Self::DEFAULT
                .iter()
                .map(|n| Self::parse(n))
                .collect::<Result<Vec<_>, _>>()?,
        };
        if kinds.is_empty() {
            return Err(ConfigurationError::NoTransports);
        }
        let mut unique = Vec::with_capacity(kinds.len());
        for kind in kinds {
            if !unique.contains(&kind) {
                unique.push(kind);
            }
        }
        Ok(unique)
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
        }
    }
}

/// Admission predicate. `Err` carries the rejection reason.
pub type AllowRequest = Arc<dyn Fn(&Handshake) -> Result<(), String> + Send + Sync>;

/// Computes the CORS headers for a handshake.
pub type AccessControlFn = Arc<dyn Fn(&Handshake) -> AccessControl + Send + Sync>;

/// Cross-origin response headers attached to the handshake response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessControl {
    /// `Access-Control-Allow-Origin`.
    pub allow_origin: Option<String>,
    /// `Access-Control-Allow-Credentials: true` when set.
    pub allow_credentials: bool,
    /// `Access-Control-Allow-Methods`.
    pub allow_methods: Option<String>,
    /// `Access-Control-Allow-Headers`.
    pub allow_headers: Option<String>,
    /// `Access-Control-Max-Age`, in seconds.
    pub max_age: Option<u32>,
}

impl AccessControl {
    /// Allow any origin.
    pub fn permissive() -> Self {
        Self {
            allow_origin: Some("*".into()),
            ..Self::default()
        }
    }

    /// Header pairs to attach. Values that are not valid header text are skipped.
    pub fn headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        let mut out = Vec::new();
        let mut push = |name: HeaderName, value: &str| match HeaderValue::from_str(value) {
            Ok(v) => out.push((name, v)),
            Err(_) => warn!(header = %name, value, "skipping invalid access control header"),
        };
        if let Some(origin) = &self.allow_origin {
            push(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        if self.allow_credentials {
            push(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
        }
        if let Some(methods) = &self.allow_methods {
            push(header::ACCESS_CONTROL_ALLOW_METHODS, methods);
        }
        if let Some(headers) = &self.allow_headers {
            push(header::ACCESS_CONTROL_ALLOW_HEADERS, headers);
        }
        if let Some(max_age) = self.max_age {
            push(header::ACCESS_CONTROL_MAX_AGE, &max_age.to_string());
        }
        out
    }
}

/// Tunables consulted when a connection is admitted.
///
/// Changes apply to connections opened after the change.
#[derive(Clone)]
pub struct TransportPolicy {
    /// Interval between keep-alive pings.
    pub ping_interval: Duration,
    /// Close a connection after this long without a pong.
    pub ping_timeout: Duration,
    /// Maximum concurrently open connections.
    pub max_connections: usize,
    /// Optional admission predicate.
    pub allow_request: Option<AllowRequest>,
    /// Advertise transport upgrades in the handshake.
    pub allow_upgrades: bool,
    /// Optional CORS header hook.
    pub access_control: Option<AccessControlFn>,
    /// Session cookie name. Empty disables the cookie.
    pub cookie: String,
    /// Per-connection outbound frame buffer.
    pub outbound_buffer: usize,
    /// Largest inbound frame, in bytes.
    pub max_message_size: usize,
}

impl TransportPolicy {
    /// Build a policy from loaded settings.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            ping_interval: Duration::from_millis(settings.ping_interval_ms).max(MIN_PING_INTERVAL),
            ping_timeout: Duration::from_millis(settings.ping_timeout_ms),
            max_connections: settings.max_connections,
            allow_request: None,
            allow_upgrades: settings.allow_upgrades,
            access_control: None,
            cookie: settings.cookie.clone(),
            outbound_buffer: settings.outbound_buffer.max(1),
            max_message_size: settings.max_message_size,
        }
    }

    /// Run the admission predicate, if any.
    pub fn admit(&self, handshake: &Handshake) -> Result<(), String> {
        match &self.allow_request {
            Some(allow) => allow(handshake),
            None => Ok(()),
        }
    }

    /// CORS headers for this handshake, if a hook is set.
    pub fn access_control_headers(&self, handshake: &Handshake) -> Vec<(HeaderName, HeaderValue)> {
        self.access_control
            .as_ref()
            .map(|f| f(handshake).headers())
            .unwrap_or_default()
    }
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

impl fmt::Debug for TransportPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportPolicy")
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("max_connections", &self.max_connections)
            .field("allow_request", &self.allow_request.is_some())
            .field("allow_upgrades", &self.allow_upgrades)
            .field("access_control", &self.access_control.is_some())
            .field("cookie", &self.cookie)
            .field("outbound_buffer", &self.outbound_buffer)
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

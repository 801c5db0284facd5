//! Settings type definitions.
//!
//! Field names are camelCase in JSON. Every struct is `#[serde(default)]`,
//! so a partial settings file only needs the keys it changes.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TidalSettings {
    /// Listener, transport and keep-alive settings.
    pub server: ServerSettings,
    /// Cross-process broadcast settings.
    pub cluster: ClusterSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl TidalSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        if self.cluster.enabled && self.cluster.redis_url.is_none() {
            return Err(SettingsError::InvalidValue(
                "cluster.redisUrl is required when cluster.enabled is true".into(),
            ));
        }
        Ok(())
    }
}

impl ServerSettings {
    /// Check the server section on its own.
    pub fn validate(&self) -> Result<()> {
        let server = self;
        if server.transports.is_empty() {
            return Err(SettingsError::InvalidValue(
                "server.transports must name at least one transport".into(),
            ));
        }
        if server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be positive".into(),
            ));
        }
        if server.outbound_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "server.outboundBuffer must be positive".into(),
            ));
        }
        if server.ping_interval_ms == 0 || server.ping_timeout_ms < server.ping_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "server.pingTimeoutMs ({}) must be >= server.pingIntervalMs ({}) > 0",
                server.ping_timeout_ms, server.ping_interval_ms
            )));
        }
        if !server.path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.path must start with '/': {}",
                server.path
            )));
        }
        Ok(())
    }
}

/// Server network, transport and keep-alive settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` lets the OS pick).
    pub port: u16,
    /// HTTP path the WebSocket endpoint is mounted on.
    pub path: String,
    /// Enabled transport names.
    pub transports: Vec<String>,
    /// Interval between keep-alive pings, in milliseconds.
    pub ping_interval_ms: u64,
    /// Close a connection after this long without a pong, in milliseconds.
    pub ping_timeout_ms: u64,
    /// Maximum concurrently open connections.
    pub max_connections: usize,
    /// Whether clients are told they may upgrade transports.
    pub allow_upgrades: bool,
    /// Name of the session cookie set on the handshake response. Empty disables it.
    pub cookie: String,
    /// Per-connection outbound frame buffer.
    pub outbound_buffer: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            path: "/socket.io".into(),
            transports: vec!["websocket".into()],
            ping_interval_ms: 25_000,
            ping_timeout_ms: 60_000,
            max_connections: 1000,
            allow_upgrades: true,
            cookie: "io".into(),
            outbound_buffer: 1024,
            max_message_size: 1024 * 1024,
        }
    }
}

/// Cross-process broadcast settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    /// Use the Redis-backed cluster adaptor for the root namespace.
    pub enabled: bool,
    /// Redis connection URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// Pub/sub channel prefix; the namespace name is appended.
    pub channel: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: None,
            channel: "tidal".into(),
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn server_defaults() {
        let s = ServerSettings::default();
        assert_eq!(s.host, "127.0.0.1");
        assert_eq!(s.port, 0);
        assert_eq!(s.path, "/socket.io");
        assert_eq!(s.transports, vec!["websocket".to_string()]);
        assert_eq!(s.ping_interval_ms, 25_000);
        assert_eq!(s.ping_timeout_ms, 60_000);
        assert_eq!(s.max_connections, 1000);
        assert!(s.allow_upgrades);
        assert_eq!(s.cookie, "io");
    }

    #[test]
    fn server_serde_camel_case() {
        let json = serde_json::to_value(ServerSettings::default()).unwrap();
        assert!(json.get("pingIntervalMs").is_some());
        assert!(json.get("maxConnections").is_some());
        assert!(json.get("allowUpgrades").is_some());
        assert!(json.get("outboundBuffer").is_some());
    }

    #[test]
    fn cluster_omits_missing_url() {
        let json = serde_json::to_value(ClusterSettings::default()).unwrap();
        assert!(json.get("redisUrl").is_none());
        assert_eq!(json["channel"], "tidal");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: TidalSettings =
            serde_json::from_str(r#"{"server": {"maxConnections": 2}}"#).unwrap();
        assert_eq!(s.server.max_connections, 2);
        assert_eq!(s.server.cookie, "io");
        assert!(!s.cluster.enabled);
        assert_eq!(s.logging.level, "info");
    }

    #[test]
    fn defaults_validate() {
        assert!(TidalSettings::default().validate().is_ok());
    }

    #[test]
    fn zero_max_connections_invalid() {
        let mut s = TidalSettings::default();
        s.server.max_connections = 0;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn timeout_shorter_than_interval_invalid() {
        let mut s = TidalSettings::default();
        s.server.ping_interval_ms = 10_000;
        s.server.ping_timeout_ms = 5_000;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("pingTimeoutMs"));
    }

    #[test]
    fn zero_ping_interval_invalid_on_its_own() {
        let s = ServerSettings {
            ping_interval_ms: 0,
            ..ServerSettings::default()
        };
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn empty_transports_invalid() {
        let mut s = TidalSettings::default();
        s.server.transports.clear();
        assert!(s.validate().is_err());
    }

    #[test]
    fn relative_path_invalid() {
        let mut s = TidalSettings::default();
        s.server.path = "socket.io".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn cluster_requires_url() {
        let mut s = TidalSettings::default();
        s.cluster.enabled = true;
        assert!(s.validate().is_err());
        s.cluster.redis_url = Some("redis://127.0.0.1/".into());
        assert!(s.validate().is_ok());
    }
}

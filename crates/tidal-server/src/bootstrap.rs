//! Process startup from a settings document: logging, listener, serve loop.

use std::future::Future;

use anyhow::{Context, Result};
use tidal_settings::{LoggingSettings, ServerSettings, TidalSettings};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::Server;
use crate::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;

/// Install the global log subscriber described by `logging`.
///
/// `RUST_LOG` still wins over the configured level. Only the first call in a
/// process has any effect.
pub fn init_logging(logging: &LoggingSettings) {
    if logging.json {
        tidal_core::logging::init_json_subscriber(&logging.level);
    } else {
        tidal_core::logging::init_subscriber(&logging.level);
    }
}

/// Bind the configured `host:port`. Port 0 picks a free port.
pub async fn bind(settings: &ServerSettings) -> std::io::Result<TcpListener> {
    TcpListener::bind((settings.host.as_str(), settings.port)).await
}

/// Build, bind and serve until ctrl-c, then drain sessions.
pub async fn run(settings: &TidalSettings, configure: impl FnOnce(&Server)) -> Result<()> {
    run_until(settings, configure, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c, shutting down");
        }
    })
    .await
}

/// Like [`run`], but stops when `signal` resolves.
///
/// `configure` sees the server before the listener is bound, so handlers are
/// in place before the first client can connect.
pub async fn run_until(
    settings: &TidalSettings,
    configure: impl FnOnce(&Server),
    signal: impl Future<Output = ()>,
) -> Result<()> {
    init_logging(&settings.logging);
    let server = Server::from_settings(settings)
        .await
        .context("Failed to build server")?;
    configure(&server);

    let listener = bind(&settings.server).await.with_context(|| {
        format!(
            "Failed to bind {}:{}",
            settings.server.host, settings.server.port
        )
    })?;
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    signal.await;
    info!("shutdown signal received");
    if !server.shutdown(Some(DEFAULT_SHUTDOWN_TIMEOUT)).await {
        warn!("sessions still running after shutdown timeout");
    }
    serving
        .await
        .context("Serve task panicked")?
        .context("Server stopped with an I/O error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn bind_uses_configured_host_and_port() {
        let settings = ServerSettings {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerSettings::default()
        };
        let listener = bind(&settings).await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);

        let taken = ServerSettings {
            port: addr.port(),
            ..settings
        };
        assert!(bind(&taken).await.is_err());
    }

    #[tokio::test]
    async fn invalid_settings_stop_before_binding() {
        let mut settings = TidalSettings::default();
        settings.server.ping_interval_ms = 0;
        let configured = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&configured);
        let err = run_until(
            &settings,
            move |_| flag.store(true, Ordering::SeqCst),
            async {},
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Failed to build server"));
        assert!(!configured.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn serves_until_signalled() {
        let settings = TidalSettings::default();
        let configured = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&configured);
        run_until(
            &settings,
            move |server| flag.store(server.session_count() == 0, Ordering::SeqCst),
            tokio::time::sleep(std::time::Duration::from_millis(20)),
        )
        .await
        .unwrap();
        assert!(configured.load(Ordering::SeqCst));
    }
}

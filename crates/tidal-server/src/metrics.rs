//! Prometheus recorder and metric names.

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global metrics recorder.
///
/// Call once at startup, before anything is recorded. Fails if a recorder
/// is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render the Prometheus text exposition.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// `GET /metrics` serving the Prometheus text exposition of `handle`.
pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(handle)
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    render(&handle)
}

/// Connections admitted by the transport (counter).
pub const CONNECTIONS_ADMITTED_TOTAL: &str = "tidal_connections_admitted_total";
/// Connections refused at admission (counter, labels: reason).
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tidal_connections_rejected_total";
/// Sessions started (counter).
pub const SESSIONS_OPENED_TOTAL: &str = "tidal_sessions_opened_total";
/// Sessions ended (counter, labels: reason).
pub const SESSIONS_CLOSED_TOTAL: &str = "tidal_sessions_closed_total";
/// Live sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "tidal_sessions_active";
/// Session lifetime in seconds (histogram).
pub const CONNECTION_DURATION_SECONDS: &str = "tidal_connection_duration_seconds";
/// Events dispatched to handlers (counter, labels: event).
pub const EVENTS_RECEIVED_TOTAL: &str = "tidal_events_received_total";
/// Handler failures (counter, labels: event, error_type).
pub const HANDLER_ERRORS_TOTAL: &str = "tidal_handler_errors_total";
/// Handler run time in seconds (histogram, labels: event).
pub const HANDLER_DURATION_SECONDS: &str = "tidal_handler_duration_seconds";
/// Frames queued by room broadcasts (counter).
pub const BROADCAST_RECIPIENTS_TOTAL: &str = "tidal_broadcast_recipients_total";
/// Broadcast frames dropped on full buffers (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "tidal_broadcast_drops_total";
/// Failed cluster bus publishes (counter).
pub const CLUSTER_PUBLISH_ERRORS_TOTAL: &str = "tidal_cluster_publish_errors_total";

//! WebSocket handshake and the per-socket frame pumps.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, instrument, warn};

use super::heartbeat::{HeartbeatResult, Liveness, MIN_PING_INTERVAL, run_heartbeat};
use super::{Engine, Handshake, Peer};
use crate::errors::TransportError;

/// Admit a WebSocket upgrade request and hand the socket to the pumps.
///
/// Refusals map to `503` for the connection cap, `403` for the predicate
/// and `400` for an unknown namespace.
/// The session cookie and CORS headers are attached either way.
pub async fn handle_upgrade(
    engine: &Engine,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let handshake = Handshake::new(uri, headers);
    let policy = engine.policy();
    let access_headers = policy.access_control_headers(&handshake);

    let mut response = match engine.open(handshake).await {
        Ok(peer) => {
            let cookie = session_cookie(&policy.cookie, peer.id().as_str());
            let (interval, timeout) = (policy.ping_interval, policy.ping_timeout);
            let closed = peer.closed.clone();
            let mut response = ws
                .max_message_size(policy.max_message_size)
                .on_failed_upgrade(move |e| {
                    debug!(error = %e, "websocket upgrade failed");
                    closed.cancel();
                })
                .on_upgrade(move |socket| run_socket(socket, peer, interval, timeout));
            if let Some(cookie) = cookie {
                let _ = response.headers_mut().insert(header::SET_COOKIE, cookie);
            }
            response
        }
        Err(err) => {
            let status = match &err {
                TransportError::ConnectionLimit { .. } => StatusCode::SERVICE_UNAVAILABLE,
                TransportError::Rejected(_) => StatusCode::FORBIDDEN,
                TransportError::InvalidNamespace(_) | TransportError::InvalidHandshake(_) => {
                    StatusCode::BAD_REQUEST
                }
                TransportError::Closed | TransportError::Backpressure => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            };
            (status, err.to_string()).into_response()
        }
    };

    for (name, value) in access_headers {
        let _ = response.headers_mut().insert(name, value);
    }
    response
}

fn session_cookie(name: &str, sid: &str) -> Option<HeaderValue> {
    if name.is_empty() {
        return None;
    }
    HeaderValue::from_str(&format!("{name}={sid}; Path=/; HttpOnly; SameSite=Lax")).ok()
}

/// Shuttle frames between a WebSocket and its [`Peer`] until either side closes.
///
/// Pings go out every `ping_interval`; the connection is dropped after
/// `ping_timeout` without a pong or inbound frame. Inbound frames are handed
/// over without waiting: a client that outruns its session's inbound buffer
/// is disconnected, so a slow handler never stalls outbound frames or pings.
#[instrument(skip_all, fields(session_id = %peer.id()))]
pub async fn run_socket(
    socket: WebSocket,
    peer: Peer,
    ping_interval: Duration,
    ping_timeout: Duration,
) {
    let ping_interval = ping_interval.max(MIN_PING_INTERVAL);
    let Peer {
        id: _,
        inbound,
        mut outbound,
        closed,
    } = peer;
    let (mut sink, mut stream) = socket.split();
    let liveness = Arc::new(Liveness::new());

    let heartbeat = {
        let liveness = Arc::clone(&liveness);
        let closed = closed.clone();
        tokio::spawn(async move {
            let result = run_heartbeat(&liveness, ping_interval, ping_timeout, closed.clone()).await;
            if result == HeartbeatResult::TimedOut {
                info!(idle_ms = liveness.idle_for().as_millis(), "ping timeout, closing connection");
                closed.cancel();
            }
        })
    };

    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval,
    );

    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::Text(String::clone(&frame).into())).await.is_err() {
                    debug!("websocket write failed");
                    break;
                }
            }
            message = stream.next() => {
                let Some(Ok(message)) = message else { break };
                liveness.mark_alive();
                let text = match message {
                    Message::Text(text) => text.as_str().to_owned(),
                    Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                match inbound.try_send(text) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("inbound buffer full, closing connection");
                        break;
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    closed.cancel();
    while let Ok(frame) = outbound.try_recv() {
        if sink.send(Message::Text(String::clone(&frame).into())).await.is_err() {
            break;
        }
    }
    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!(error = %e, "close frame not delivered");
    }
    heartbeat.abort();
    debug!("websocket pumps stopped");
}

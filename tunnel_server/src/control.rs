//! Control-channel endpoint, server side.
//!
//! Drives each client's control connection through
//! `CONNECTING -> AUTHENTICATING -> REGISTERED -> CLOSED`, with a
//! dedicated send task and receive task per connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tunnel_common::{ControlAction, ControlPayload, Envelope, EnvelopeType, Payload};

use crate::allocator;
use crate::registry::Tunnel;
use crate::wsproxy::WsProxyRegistry;
use crate::AppState;

/// `secret`/`subdomain` from the control endpoint's query string.
/// Parsed by hand in [`parse_query`] rather than via axum's `Query`
/// extractor, which would otherwise pull in `serde` for a single
/// two-field struct only used here.
#[derive(Debug, Default)]
pub struct ControlQuery {
    pub secret: Option<String>,
    pub subdomain: Option<String>,
}

pub async fn control_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    uri: axum::http::Uri,
) -> Response {
    let query = parse_query(uri.query().unwrap_or(""));
    ws.on_upgrade(move |socket| handle_control_socket(socket, state, query))
}

fn parse_query(raw: &str) -> ControlQuery {
    let mut secret = None;
    let mut subdomain = None;
    for pair in raw.split('&') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        let value = parts.next().unwrap_or("");
        let decoded = percent_decode(value);
        match key {
            "secret" => secret = Some(decoded),
            "subdomain" => subdomain = Some(decoded),
            _ => {}
        }
    }
    ControlQuery { secret, subdomain }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

async fn handle_control_socket(socket: WebSocket, state: AppState, query: ControlQuery) {
    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));

    // AUTHENTICATING: reject before any registration happens (§4.5, close
    // code 1008 = policy violation).
    let secret = match &query.secret {
        Some(s) => s,
        None => {
            close_with(&sender, 1008, "missing secret").await;
            return;
        }
    };
    if !state.config.accepts_secret(secret) {
        close_with(&sender, 1008, "invalid secret").await;
        return;
    }

    let subdomain = match assign_subdomain(&state, query.subdomain.as_deref()) {
        Ok(s) => s,
        Err(reason) => {
            close_with(&sender, 1008, reason).await;
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let pending = Arc::new(crate::pending::PendingTable::new());
    let ws_proxies = Arc::new(WsProxyRegistry::new());

    let tunnel = Arc::new(Tunnel {
        outbound: outbound_tx,
        pending: pending.clone(),
        ws_proxies: ws_proxies.clone(),
        shutdown: Arc::new(tokio::sync::Notify::new()),
        last_seen_ms: std::sync::atomic::AtomicI64::new(now_ms()),
    });

    if state.registry.register_replacing_stale(subdomain.clone(), tunnel.clone()).is_err() {
        close_with(&sender, 1008, "subdomain already in use").await;
        return;
    }

    let full_url = state.config.full_url(&subdomain);
    let registered = Envelope::control(
        tunnel_common::new_correlation_id(),
        now_ms(),
        ControlPayload {
            action: Some(ControlAction::Registered),
            subdomain: Some(subdomain.clone()),
            public_url: Some(full_url.clone()),
        },
    );
    if send_envelope(&sender, &registered).await.is_err() {
        state.registry.unregister(&subdomain);
        return;
    }

    tracing::info!(subdomain = %subdomain, public_url = %full_url, "tunnel registered");

    let sender_for_writer = sender.clone();
    let mut writer_task = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            if send_envelope(&sender_for_writer, &envelope).await.is_err() {
                break;
            }
        }
    });

    let reader_pending = pending.clone();
    let reader_proxies = ws_proxies.clone();
    let reader_sender = sender.clone();
    let reader_tunnel = tunnel.clone();
    let mut reader_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            let data = match message {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Ping(data)) => {
                    let mut guard = reader_sender.lock().await;
                    let _ = guard.send(Message::Pong(data)).await;
                    continue;
                }
                Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(Message::Text(_)) => continue,
            };

            let envelope = match Envelope::from_bytes(&data) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed envelope from client, closing tunnel");
                    break;
                }
            };

            route_inbound_envelope(envelope, &reader_pending, &reader_proxies, &reader_tunnel);
        }
    });

    tokio::select! {
        _ = &mut writer_task => {}
        _ = &mut reader_task => {}
        _ = tunnel.shutdown.notified() => {
            close_with(&sender, 1001, "server shutting down").await;
        }
    }
    writer_task.abort();
    reader_task.abort();

    state.registry.unregister(&subdomain);
    tracing::info!(subdomain = %subdomain, "tunnel closed");
}

/// Routes an envelope received from the client, per §4.5's dispatch
/// table: RESPONSE -> pending.complete or WS proxy delivery, ERROR ->
/// pending.fail, CONTROL{HEARTBEAT|STATUS} -> bookkeeping, REQUEST ->
/// protocol error (ignored, not expected from a client).
fn route_inbound_envelope(
    envelope: Envelope,
    pending: &crate::pending::PendingTable,
    ws_proxies: &WsProxyRegistry,
    tunnel: &Tunnel,
) {
    match (&envelope.envelope_type, envelope.payload) {
        (EnvelopeType::Response, Payload::Response(response)) => {
            if !pending.complete(&envelope.correlation_id, response) {
                tracing::debug!(correlation_id = %envelope.correlation_id, "response for unknown or already-resolved request, dropped");
            }
        }
        (EnvelopeType::Response, Payload::WebSocketFrame(frame)) => {
            if !ws_proxies.deliver(&envelope.correlation_id, frame) {
                tracing::debug!(correlation_id = %envelope.correlation_id, "ws frame for unknown proxy, dropped");
            }
        }
        (EnvelopeType::Error, Payload::Error(error)) => {
            if !pending.fail(&envelope.correlation_id, error) {
                tracing::debug!(correlation_id = %envelope.correlation_id, "error for unknown or already-resolved request, dropped");
            }
        }
        (EnvelopeType::Control, Payload::Control(control)) => match control.action {
            Some(ControlAction::Heartbeat) | Some(ControlAction::Status) => {
                tunnel.touch();
                tracing::debug!(correlation_id = %envelope.correlation_id, "heartbeat received");
            }
            _ => {}
        },
        (EnvelopeType::Request, _) => {
            tracing::warn!("unexpected REQUEST from client, ignored");
        }
        _ => {
            tracing::debug!("envelope type/payload mismatch, dropped");
        }
    }
}

fn assign_subdomain(state: &AppState, requested: Option<&str>) -> Result<String, &'static str> {
    match requested {
        Some(label) => {
            allocator::validate_requested(label, |s| state.registry.is_taken(s))
                .map(|_| label.to_string())
                .map_err(|_| "requested subdomain is invalid or already taken")
        }
        None => allocator::allocate(|s| state.registry.is_taken(s)).map_err(|_| "subdomain allocation exhausted"),
    }
}

async fn send_envelope(
    sender: &Arc<Mutex<futures_util::stream::SplitSink<WebSocket, Message>>>,
    envelope: &Envelope,
) -> Result<(), axum::Error> {
    let bytes = envelope.to_bytes();
    let mut guard = sender.lock().await;
    guard.send(Message::Binary(bytes.into())).await
}

async fn close_with(sender: &Arc<Mutex<futures_util::stream::SplitSink<WebSocket, Message>>>, code: u16, reason: &str) {
    use axum::extract::ws::CloseFrame;
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let mut guard = sender.lock().await;
    let _ = guard.send(Message::Close(Some(frame))).await;
    let _ = tokio::time::timeout(Duration::from_millis(100), guard.close()).await;
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::PendingTable;
    use crate::wsproxy::WsProxyRegistry;
    use std::sync::atomic::AtomicI64;
    use tunnel_common::ControlPayload;

    fn test_tunnel() -> Tunnel {
        let (tx, _rx) = mpsc::unbounded_channel();
        Tunnel {
            outbound: tx,
            pending: Arc::new(PendingTable::new()),
            ws_proxies: Arc::new(WsProxyRegistry::new()),
            shutdown: Arc::new(tokio::sync::Notify::new()),
            last_seen_ms: AtomicI64::new(0),
        }
    }

    #[test]
    fn heartbeat_updates_last_seen() {
        let pending = PendingTable::new();
        let ws_proxies = WsProxyRegistry::new();
        let tunnel = test_tunnel();
        assert_eq!(tunnel.last_seen_ms(), 0);

        let envelope = Envelope::control(
            tunnel_common::new_correlation_id(),
            now_ms(),
            ControlPayload {
                action: Some(ControlAction::Heartbeat),
                subdomain: None,
                public_url: None,
            },
        );
        route_inbound_envelope(envelope, &pending, &ws_proxies, &tunnel);
        assert!(tunnel.last_seen_ms() > 0);
    }
}

//! Public HTTP(S)/WebSocket ingress: entry point that turns an external
//! request into a forwarder call, keyed by the subdomain in the Host
//! header.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum_extra::extract::Host;
use futures_util::{SinkExt, StreamExt};
use tunnel_common::{constants, new_correlation_id, Envelope, RequestPayload, WsFrameType};

use crate::forwarder;
use crate::AppState;

const SUBDOMAIN_HEADER: &str = "x-relay-subdomain";

pub async fn handle_ingress(
    State(state): State<AppState>,
    Host(host): Host,
    ws_upgrade: Option<WebSocketUpgrade>,
    request: Request<Body>,
) -> Response<Body> {
    let subdomain = match extract_subdomain(&host, request.headers(), &state) {
        Some(s) => s,
        None => return (StatusCode::NOT_FOUND, "subdomain not found").into_response(),
    };

    if !state.registry.is_taken(&subdomain) {
        return (StatusCode::SERVICE_UNAVAILABLE, "tunnel not found").into_response();
    }

    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, state.config.max_body_size).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response(),
    };

    let query = parts
        .uri
        .query()
        .map(parse_query_string)
        .unwrap_or_default();
    let headers = collect_headers(&parts.headers);
    let websocket_upgrade = ws_upgrade.is_some();

    let payload = RequestPayload {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query,
        headers,
        body: if body_bytes.is_empty() { None } else { Some(body_bytes.to_vec()) },
        websocket_upgrade,
    };

    let correlation_id = new_correlation_id();
    let result = forwarder::forward(&state.registry, &subdomain, &correlation_id, payload, state.config.request_timeout).await;

    match (result, ws_upgrade) {
        (Ok(response), Some(upgrade)) if response.status_code == 101 => {
            bridge_external_websocket(upgrade, state, subdomain, correlation_id).await
        }
        (Ok(response), _) => {
            let mut builder = Response::builder().status(
                StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::BAD_GATEWAY),
            );
            for (key, value) in &response.headers {
                if constants::is_hop_by_hop(key) {
                    continue;
                }
                builder = builder.header(key.as_str(), value.as_str());
            }
            builder
                .body(Body::from(response.body.unwrap_or_default()))
                .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "response build failed").into_response())
        }
        (Err(error), _) => {
            let status = StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, error.to_string()).into_response()
        }
    }
}

/// Establishes the WS proxy for an already-upgraded request, keyed by the
/// same correlation id the upgrade REQUEST/RESPONSE pair used, and
/// bridges frames bidirectionally until either side closes.
async fn bridge_external_websocket(
    upgrade: WebSocketUpgrade,
    state: AppState,
    subdomain: String,
    correlation_id: String,
) -> Response<Body> {
    let Some(tunnel) = state.registry.lookup(&subdomain) else {
        return (StatusCode::SERVICE_UNAVAILABLE, "tunnel gone").into_response();
    };
    let (to_external_tx, mut to_external_rx) = tokio::sync::mpsc::unbounded_channel();
    tunnel
        .ws_proxies
        .register(correlation_id.clone(), crate::wsproxy::WsProxy { to_external: to_external_tx });

    upgrade.on_upgrade(move |socket| async move {
        let (mut sender, mut receiver) = socket.split();

        let tunnel_for_reader = tunnel.clone();
        let correlation_for_reader = correlation_id.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = receiver.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => ws_frame(WsFrameType::Text, Some(text.as_bytes().to_vec()), None, None),
                    Ok(Message::Binary(data)) => ws_frame(WsFrameType::Binary, Some(data.to_vec()), None, None),
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (Some(f.code), Some(f.reason.to_string())))
                            .unwrap_or((None, None));
                        let close = ws_frame(WsFrameType::Close, None, code, reason);
                        let envelope = Envelope::ws_frame(correlation_for_reader.clone(), now_ms(), true, close);
                        let _ = send_to_tunnel(&tunnel_for_reader, envelope);
                        break;
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                    Err(_) => break,
                };
                let envelope = Envelope::ws_frame(correlation_for_reader.clone(), now_ms(), true, frame);
                if send_to_tunnel(&tunnel_for_reader, envelope).is_err() {
                    break;
                }
            }
            tunnel_for_reader.ws_proxies.unregister(&correlation_for_reader);
        });

        while let Some(frame) = to_external_rx.recv().await {
            let message = match frame.frame_type {
                Some(WsFrameType::Text) => Message::Text(
                    String::from_utf8_lossy(&frame.data.unwrap_or_default()).into_owned().into(),
                ),
                Some(WsFrameType::Binary) => Message::Binary(frame.data.unwrap_or_default().into()),
                Some(WsFrameType::Close) => {
                    let close_frame = frame.close_code.map(|code| axum::extract::ws::CloseFrame {
                        code,
                        reason: frame.close_reason.unwrap_or_default().into(),
                    });
                    let _ = sender.send(Message::Close(close_frame)).await;
                    break;
                }
                _ => continue,
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }

        reader.abort();
    })
}

fn send_to_tunnel(tunnel: &crate::registry::Tunnel, envelope: Envelope) -> Result<(), ()> {
    tunnel.outbound.send(envelope).map_err(|_| ())
}

fn ws_frame(
    frame_type: WsFrameType,
    data: Option<Vec<u8>>,
    close_code: Option<u16>,
    close_reason: Option<String>,
) -> tunnel_common::WebSocketFramePayload {
    tunnel_common::WebSocketFramePayload {
        frame_type: Some(frame_type),
        data,
        close_code,
        close_reason,
    }
}

fn extract_subdomain(host: &str, headers: &HeaderMap, state: &AppState) -> Option<String> {
    let host_without_port = host.split(':').next().unwrap_or(host);
    let tunnel_domain = &state.config.tunnel_domain;

    if let Some(stripped) = host_without_port.strip_suffix(tunnel_domain) {
        if let Some(subdomain) = stripped.strip_suffix('.') {
            if !subdomain.is_empty() {
                return Some(subdomain.to_string());
            }
        }
    }

    if state.config.allow_subdomain_header {
        if let Some(value) = headers.get(SUBDOMAIN_HEADER).and_then(|v| v.to_str().ok()) {
            return Some(value.to_string());
        }
    }

    None
}

fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str();
            if constants::is_hop_by_hop(name) {
                return None;
            }
            value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

fn parse_query_string(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.to_string();
            let value = parts.next().unwrap_or("").to_string();
            Some((key, value))
        })
        .collect()
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
    use crate::config::Config;
    use crate::registry::Registry;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_state() -> AppState {
        AppState {
            config: Arc::new(Config {
                host: "0.0.0.0".to_string(),
                port: 8080,
                tunnel_domain: "tunnel.example".to_string(),
                public_scheme: "https".to_string(),
                secret_keys: ["k".to_string()].into_iter().collect(),
                request_timeout: Duration::from_secs(5),
                max_body_size: 1024,
                allow_subdomain_header: true,
            }),
            registry: Arc::new(Registry::new()),
        }
    }

    #[test]
    fn extract_subdomain_from_host() {
        let state = test_state();
        let headers = HeaderMap::new();
        assert_eq!(
            extract_subdomain("foo.tunnel.example", &headers, &state),
            Some("foo".to_string())
        );
        assert_eq!(extract_subdomain("unrelated.example", &headers, &state), None);
    }

    #[test]
    fn extract_subdomain_falls_back_to_header_when_enabled() {
        let state = test_state();
        let mut headers = HeaderMap::new();
        headers.insert(SUBDOMAIN_HEADER, "foo".parse().unwrap());
        assert_eq!(extract_subdomain("localhost", &headers, &state), Some("foo".to_string()));
    }

    #[test]
    fn parse_query_string_splits_pairs() {
        let parsed = parse_query_string("a=1&b=2&flag");
        assert_eq!(parsed.get("a"), Some(&"1".to_string()));
        assert_eq!(parsed.get("b"), Some(&"2".to_string()));
        assert_eq!(parsed.get("flag"), Some(&"".to_string()));
    }

    #[test]
    fn collect_headers_strips_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("x-custom", "value".parse().unwrap());
        let collected = collect_headers(&headers);
        assert!(!collected.contains_key("connection"));
        assert_eq!(collected.get("x-custom"), Some(&"value".to_string()));
    }
}

//! Control-channel endpoint, client side.
//!
//! Owns the outbound WebSocket connection to the tunnel server: connect,
//! wait for registration, then a send/receive loop with a heartbeat task
//! alongside it. Wraps the whole thing in a reconnect-with-backoff loop
//! so transient disconnects after a successful registration don't kill
//! the process.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tunnel_common::{ControlAction, Envelope, EnvelopeType, Payload, ResponsePayload};

use crate::cli::Cli;
use crate::dispatcher;
use crate::wsproxy::WsProxyRegistry;

/// Why [`run`] stopped retrying.
#[derive(Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// A clean shutdown was requested (Ctrl+C) and propagated in.
    ShuttingDown,
    /// The server rejected the control connection's credentials. Terminal
    /// per §4.8: "reconnection is not attempted".
    AuthFailed,
    /// The very first connection attempt failed before ever registering.
    /// Distinguished from a mid-session disconnect (which feeds the
    /// reconnect loop) because the user is waiting synchronously for
    /// startup confirmation.
    ConnectFailed,
}

#[derive(Debug)]
enum ConnectOutcome {
    /// The connection was registered at least once and later dropped for
    /// a non-auth reason; worth retrying with backoff.
    Disconnected,
    AuthFailed,
    ConnectFailed,
}

struct ReconnectPolicy {
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter_fraction: f64,
}

impl ReconnectPolicy {
    fn from_env() -> Self {
        Self {
            initial_delay: Duration::from_millis(env_u64("RECONNECT_INITIAL_MS", 250)),
            multiplier: env_f64("RECONNECT_MULTIPLIER", 2.0),
            max_delay: Duration::from_millis(env_u64("RECONNECT_MAX_MS", 30_000)),
            jitter_fraction: env_f64("RECONNECT_JITTER", 0.2),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let jitter = capped * self.jitter_fraction * rand::random::<f64>();
        Duration::from_millis((capped + jitter) as u64)
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Runs the control connection until a terminal condition is reached:
/// auth failure, a failed first connection attempt, or the provided
/// `shutdown` future resolving (Ctrl+C).
pub async fn run(cli: &Cli, shutdown: impl std::future::Future<Output = ()>) -> ExitReason {
    tokio::pin!(shutdown);
    let policy = ReconnectPolicy::from_env();
    let local_url = cli.local_url();
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .expect("reqwest client build");

    let mut attempt = 0u32;
    let mut ever_registered = false;

    loop {
        let outcome = tokio::select! {
            outcome = connect_and_serve(cli, &local_url, &http_client, &mut ever_registered) => outcome,
            _ = &mut shutdown => return ExitReason::ShuttingDown,
        };

        match outcome {
            ConnectOutcome::AuthFailed => return ExitReason::AuthFailed,
            ConnectOutcome::ConnectFailed if !ever_registered => return ExitReason::ConnectFailed,
            ConnectOutcome::ConnectFailed | ConnectOutcome::Disconnected => {
                let delay = policy.delay_for(attempt);
                attempt = attempt.saturating_add(1);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "tunnel disconnected, reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = &mut shutdown => return ExitReason::ShuttingDown,
                }
            }
        }

        if ever_registered {
            attempt = 0;
        }
    }
}

fn build_url(cli: &Cli) -> String {
    let scheme = if cli.insecure { "ws" } else { "wss" };
    let mut url = format!("{scheme}://{}/ws?secret={}", cli.server, percent_encode(&cli.key));
    if let Some(subdomain) = &cli.subdomain {
        url.push_str("&subdomain=");
        url.push_str(&percent_encode(subdomain));
    }
    url
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

async fn connect_and_serve(
    cli: &Cli,
    local_url: &str,
    http_client: &reqwest::Client,
    ever_registered: &mut bool,
) -> ConnectOutcome {
    let url = build_url(cli);
    let connect_result = tokio_tungstenite::connect_async(&url).await;

    let (ws_stream, _response) = match connect_result {
        Ok(pair) => pair,
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                return ConnectOutcome::AuthFailed;
            }
            return ConnectOutcome::ConnectFailed;
        }
        Err(error) => {
            tracing::error!(error = %error, "failed to connect to tunnel server");
            return ConnectOutcome::ConnectFailed;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    let registered = match wait_for_registration(&mut read).await {
        Ok(info) => info,
        Err(RegistrationError::Closed(code)) if code == 1008 => return ConnectOutcome::AuthFailed,
        Err(_) => return ConnectOutcome::ConnectFailed,
    };

    *ever_registered = true;
    if !cli.quiet {
        print_tunnel_banner(&registered, cli);
    }
    tracing::info!(subdomain = %registered.subdomain, public_url = %registered.public_url, "tunnel registered");

    let ws_proxies = Arc::new(WsProxyRegistry::new());
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();

    let heartbeat_tx = outbound_tx.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(tunnel_common::constants::HEARTBEAT_INTERVAL_SECS));
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            let envelope = Envelope::control(
                tunnel_common::new_correlation_id(),
                now_ms(),
                tunnel_common::ControlPayload {
                    action: Some(ControlAction::Heartbeat),
                    subdomain: None,
                    public_url: None,
                },
            );
            if heartbeat_tx.send(envelope).is_err() {
                break;
            }
        }
    });

    let outcome = loop {
        tokio::select! {
            maybe_envelope = outbound_rx.recv() => {
                match maybe_envelope {
                    Some(envelope) => {
                        if write.send(WsMessage::Binary(envelope.to_bytes().into())).await.is_err() {
                            break ConnectOutcome::Disconnected;
                        }
                    }
                    None => break ConnectOutcome::Disconnected,
                }
            }
            message = read.next() => {
                let message = match message {
                    Some(Ok(m)) => m,
                    Some(Err(error)) => {
                        tracing::warn!(error = %error, "control socket error");
                        break ConnectOutcome::Disconnected;
                    }
                    None => break ConnectOutcome::Disconnected,
                };

                match message {
                    WsMessage::Binary(data) => {
                        let envelope = match Envelope::from_bytes(&data) {
                            Ok(e) => e,
                            Err(error) => {
                                tracing::warn!(error = %error, "malformed envelope from server, closing tunnel");
                                break ConnectOutcome::Disconnected;
                            }
                        };
                        handle_inbound_envelope(envelope, local_url, http_client, &ws_proxies, &outbound_tx).await;
                    }
                    WsMessage::Ping(payload) => {
                        if write.send(WsMessage::Pong(payload)).await.is_err() {
                            break ConnectOutcome::Disconnected;
                        }
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => break ConnectOutcome::Disconnected,
                    WsMessage::Text(_) | WsMessage::Frame(_) => {}
                }
            }
        }
    };

    heartbeat_task.abort();
    ws_proxies.close_all();
    outcome
}

struct Registration {
    subdomain: String,
    public_url: String,
}

enum RegistrationError {
    Closed(u16),
    Other,
}

async fn wait_for_registration(
    read: &mut futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>>,
) -> Result<Registration, RegistrationError> {
    let message = tokio::time::timeout(Duration::from_secs(tunnel_common::constants::HANDSHAKE_TIMEOUT_SECS), read.next())
        .await
        .map_err(|_| RegistrationError::Other)?
        .ok_or(RegistrationError::Other)?
        .map_err(|_| RegistrationError::Other)?;

    match message {
        WsMessage::Binary(data) => {
            let envelope = Envelope::from_bytes(&data).map_err(|_| RegistrationError::Other)?;
            match (envelope.envelope_type, envelope.payload) {
                (EnvelopeType::Control, Payload::Control(control)) if control.action == Some(ControlAction::Registered) => {
                    Ok(Registration {
                        subdomain: control.subdomain.unwrap_or_default(),
                        public_url: control.public_url.unwrap_or_default(),
                    })
                }
                _ => Err(RegistrationError::Other),
            }
        }
        WsMessage::Close(frame) => Err(RegistrationError::Closed(frame.map(|f| f.code.into()).unwrap_or(1000))),
        _ => Err(RegistrationError::Other),
    }
}

/// Routes an envelope received from the server: a plain `REQUEST` is
/// applied to the local app; a `REQUEST` carrying a
/// `WebSocketFramePayload` is delivered to the matching local WS proxy;
/// `CONTROL{HEARTBEAT|STATUS}` is bookkeeping.
async fn handle_inbound_envelope(
    envelope: Envelope,
    local_url: &str,
    http_client: &reqwest::Client,
    ws_proxies: &Arc<WsProxyRegistry>,
    outbound: &mpsc::UnboundedSender<Envelope>,
) {
    match (&envelope.envelope_type, envelope.payload) {
        (EnvelopeType::Request, Payload::Request(request)) => {
            let correlation_id = envelope.correlation_id.clone();
            if request.websocket_upgrade {
                handle_upgrade_request(correlation_id, &request, local_url, ws_proxies.clone(), outbound.clone()).await;
            } else {
                let response = dispatcher::dispatch(http_client, local_url, &request).await;
                let reply = Envelope::response(correlation_id, now_ms(), response);
                let _ = outbound.send(reply);
            }
        }
        (EnvelopeType::Request, Payload::WebSocketFrame(frame)) => {
            if !ws_proxies.deliver(&envelope.correlation_id, frame) {
                tracing::debug!(correlation_id = %envelope.correlation_id, "ws frame for unknown local proxy, dropped");
            }
        }
        (EnvelopeType::Control, Payload::Control(control)) => match control.action {
            Some(ControlAction::Heartbeat) | Some(ControlAction::Status) => {
                tracing::debug!("heartbeat acknowledged by server");
            }
            _ => {}
        },
        _ => {
            tracing::debug!("envelope type/payload mismatch from server, dropped");
        }
    }
}

async fn handle_upgrade_request(
    correlation_id: String,
    request: &tunnel_common::RequestPayload,
    local_url: &str,
    ws_proxies: Arc<WsProxyRegistry>,
    outbound: mpsc::UnboundedSender<Envelope>,
) {
    let local_ws_url = build_local_ws_url(local_url, &request.path, &request.query);
    match crate::wsproxy::connect_and_bridge(correlation_id.clone(), &local_ws_url, ws_proxies, outbound.clone()).await {
        Ok(()) => {
            let reply = Envelope::response(
                correlation_id,
                now_ms(),
                ResponsePayload {
                    status_code: 101,
                    headers: std::collections::HashMap::new(),
                    body: None,
                },
            );
            let _ = outbound.send(reply);
        }
        Err(error) => {
            tracing::warn!(error = %error, "local websocket upgrade failed");
            let reply = Envelope::response(
                correlation_id,
                now_ms(),
                ResponsePayload {
                    status_code: 502,
                    headers: std::collections::HashMap::new(),
                    body: Some(b"Bad Gateway".to_vec()),
                },
            );
            let _ = outbound.send(reply);
        }
    }
}

fn build_local_ws_url(local_url: &str, path: &str, query: &std::collections::HashMap<String, String>) -> String {
    let ws_base = local_url.replacen("http://", "ws://", 1).replacen("https://", "wss://", 1);
    let mut url = format!("{}{}", ws_base.trim_end_matches('/'), path);
    if !query.is_empty() {
        url.push('?');
        let pairs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
        url.push_str(&pairs.join("&"));
    }
    url
}

fn print_tunnel_banner(registration: &Registration, cli: &Cli) {
    use console::style;
    println!();
    println!(
        "{} {}",
        style("Forwarding").dim(),
        style(format!("{} -> 127.0.0.1:{}", registration.public_url, cli.port)).green().bold(),
    );
    println!("{}", style("Press Ctrl+C to stop").dim());
    println!();
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

    fn cli(insecure: bool, subdomain: Option<&str>) -> Cli {
        Cli {
            port: 8080,
            server: "tunnel.example".to_string(),
            key: "se cret".to_string(),
            subdomain: subdomain.map(str::to_string),
            insecure,
            quiet: true,
            verbose: false,
        }
    }

    #[test]
    fn build_url_uses_wss_by_default_and_encodes_secret() {
        let url = build_url(&cli(false, None));
        assert_eq!(url, "wss://tunnel.example/ws?secret=se%20cret");
    }

    #[test]
    fn build_url_uses_ws_when_insecure_and_includes_subdomain() {
        let url = build_url(&cli(true, Some("foo")));
        assert_eq!(url, "ws://tunnel.example/ws?secret=se%20cret&subdomain=foo");
    }

    #[test]
    fn reconnect_policy_delay_grows_and_is_capped() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(1000),
            jitter_fraction: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(10), Duration::from_millis(1000));
    }

    #[test]
    fn build_local_ws_url_swaps_scheme_and_keeps_query() {
        let mut query = std::collections::HashMap::new();
        query.insert("room".to_string(), "1".to_string());
        let url = build_local_ws_url("http://127.0.0.1:8080", "/socket", &query);
        assert_eq!(url, "ws://127.0.0.1:8080/socket?room=1");
    }
}

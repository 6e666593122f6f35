//! Request forwarder.
//!
//! Hands a `RequestPayload` to the owning tunnel's control connection and
//! waits on the pending table for the matching `RESPONSE`/`ERROR`.

use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tunnel_common::{Envelope, ErrorCode, RequestPayload, ResponsePayload};

use crate::pending::Outcome;
use crate::registry::Registry;

/// Outcome of forwarding a request to a tunnel, already mapped onto the
/// HTTP status codes named in §4.6/§7.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no tunnel registered for this subdomain")]
    TunnelNotFound,
    #[error("failed to send the request on the control socket")]
    SendFailed,
    #[error("request timed out waiting for a response")]
    Timeout,
    #[error("the tunnel disconnected while the request was in flight")]
    TunnelDisconnected,
    #[error("the client reported an error: {0}")]
    Upstream(String),
}

impl ForwardError {
    /// Maps a forward failure onto the HTTP status the public ingress
    /// returns to the external requester (§4.6, §7).
    pub fn http_status(&self) -> u16 {
        match self {
            ForwardError::TunnelNotFound => 503,
            ForwardError::SendFailed => 502,
            ForwardError::Timeout => 504,
            ForwardError::TunnelDisconnected => 503,
            ForwardError::Upstream(_) => 502,
        }
    }
}

/// Forwards a single request envelope to the tunnel owning `subdomain`
/// and awaits its correlated response, bounded by `timeout_duration`.
///
/// `correlation_id` is supplied by the caller rather than minted here so
/// that, for a WebSocket upgrade, the same id can be reused afterwards to
/// register the frame-carrier proxy — the external socket and the
/// REQUEST that upgraded it must share one correlation id end to end.
pub async fn forward(
    registry: &Registry,
    subdomain: &str,
    correlation_id: &str,
    payload: RequestPayload,
    timeout_duration: Duration,
) -> Result<ResponsePayload, ForwardError> {
    let tunnel = registry.lookup(subdomain).ok_or(ForwardError::TunnelNotFound)?;

    let correlation_id = correlation_id.to_string();
    let envelope = Envelope::request(correlation_id.clone(), now_ms(), payload);

    let rx = tunnel
        .pending
        .put(correlation_id.clone())
        .map_err(|_| ForwardError::SendFailed)?;

    // Backpressure: a send that cannot progress within the bounded window
    // resolves the request as BAD_GATEWAY (§5 "Backpressure").
    let send_result = timeout(
        Duration::from_secs(tunnel_common::constants::SEND_WINDOW_SECS),
        send_envelope(&tunnel.outbound, envelope),
    )
    .await;

    match send_result {
        Ok(Ok(())) => {}
        Ok(Err(())) | Err(_) => {
            tunnel.pending.remove(&correlation_id);
            return Err(ForwardError::SendFailed);
        }
    }

    match timeout(timeout_duration, rx).await {
        Ok(Ok(Outcome::Response(response))) => Ok(response),
        Ok(Ok(Outcome::Error(error))) => Err(ForwardError::Upstream(error.message)),
        Ok(Err(_)) => {
            // Sender dropped without resolving: tunnel torn down mid-flight.
            Err(ForwardError::TunnelDisconnected)
        }
        Err(_) => {
            tunnel.pending.remove(&correlation_id);
            Err(ForwardError::Timeout)
        }
    }
}

async fn send_envelope(
    sender: &tokio::sync::mpsc::UnboundedSender<Envelope>,
    envelope: Envelope,
) -> Result<(), ()> {
    sender.send(envelope).map_err(|_| ())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Maps an [`ErrorCode`] produced server-side (allocator exhaustion,
/// oversize body) onto [`ForwardError`]'s HTTP mapping for a uniform
/// response path in the ingress handler.
pub fn error_code_http_status(code: ErrorCode) -> u16 {
    code.http_status()
}

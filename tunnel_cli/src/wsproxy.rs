//! WebSocket proxy manager, client half.
//!
//! On receipt of an upgrade request, establishes a local WebSocket to
//! the mapped local URL and relays frames bidirectionally keyed by
//! correlation id. Mirrors the server-side proxy registry's shape.

use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tunnel_common::{Envelope, WebSocketFramePayload, WsFrameType};

/// A single proxied local WebSocket session, registered once the local
/// upgrade succeeds.
pub struct WsClientProxy {
    /// Frames arriving from the server (over the tunnel) are forwarded
    /// here for the local-socket writer task to relay onward.
    pub to_local: mpsc::UnboundedSender<WebSocketFramePayload>,
}

/// Registry of open local WS proxies for this control connection, keyed
/// by correlation id.
pub struct WsProxyRegistry {
    proxies: Mutex<HashMap<String, WsClientProxy>>,
}

impl WsProxyRegistry {
    pub fn new() -> Self {
        Self {
            proxies: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, correlation_id: String, proxy: WsClientProxy) {
        self.proxies.lock().unwrap().insert(correlation_id, proxy);
    }

    /// Routes a server-originated frame (arrived wrapped in a REQUEST
    /// envelope, §4.7 step 3) to the matching local socket. Returns
    /// `false` if no such proxy is registered.
    pub fn deliver(&self, correlation_id: &str, frame: WebSocketFramePayload) -> bool {
        let guard = self.proxies.lock().unwrap();
        match guard.get(correlation_id) {
            Some(proxy) => proxy.to_local.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn unregister(&self, correlation_id: &str) {
        self.proxies.lock().unwrap().remove(correlation_id);
    }

    /// Closes every open proxy, used when the control connection drops.
    pub fn close_all(&self) {
        self.proxies.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.proxies.lock().unwrap().len()
    }
}

impl Default for WsProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Connects to the local app's WebSocket endpoint and spawns the two
/// tasks that bridge it to the control tunnel: a reader that wraps local
/// frames in `RESPONSE` envelopes back to the server, and a feeder that
/// applies frames arriving from the server (via `to_local_rx`) to the
/// local socket. Returns once the local connection is established; the
/// bridge runs until either side closes.
pub async fn connect_and_bridge(
    correlation_id: String,
    local_ws_url: &str,
    registry: std::sync::Arc<WsProxyRegistry>,
    outbound: mpsc::UnboundedSender<Envelope>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (stream, _response) = tokio_tungstenite::connect_async(local_ws_url).await?;
    let (mut local_write, mut local_read) = stream.split();

    let (to_local_tx, mut to_local_rx) = mpsc::unbounded_channel();
    registry.register(correlation_id.clone(), WsClientProxy { to_local: to_local_tx });

    let reader_registry = registry.clone();
    let reader_cid = correlation_id.clone();
    let reader_outbound = outbound.clone();
    tokio::spawn(async move {
        while let Some(message) = local_read.next().await {
            let frame = match message {
                Ok(WsMessage::Text(text)) => ws_frame(WsFrameType::Text, Some(text.as_bytes().to_vec()), None, None),
                Ok(WsMessage::Binary(data)) => ws_frame(WsFrameType::Binary, Some(data.to_vec()), None, None),
                Ok(WsMessage::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|f| (Some(f.code.into()), Some(f.reason.to_string())))
                        .unwrap_or((None, None));
                    let close = ws_frame(WsFrameType::Close, None, code, reason);
                    let envelope = Envelope::ws_frame(reader_cid.clone(), now_ms(), false, close);
                    let _ = reader_outbound.send(envelope);
                    break;
                }
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => continue,
                Err(_) => break,
            };
            let envelope = Envelope::ws_frame(reader_cid.clone(), now_ms(), false, frame);
            if reader_outbound.send(envelope).is_err() {
                break;
            }
        }
        reader_registry.unregister(&reader_cid);
    });

    tokio::spawn(async move {
        while let Some(frame) = to_local_rx.recv().await {
            let message = match frame.frame_type {
                Some(WsFrameType::Text) => {
                    WsMessage::Text(String::from_utf8_lossy(&frame.data.unwrap_or_default()).into_owned().into())
                }
                Some(WsFrameType::Binary) => WsMessage::Binary(frame.data.unwrap_or_default().into()),
                Some(WsFrameType::Close) => {
                    let close_frame = frame.close_code.map(|code| tokio_tungstenite::tungstenite::protocol::CloseFrame {
                        code: code.into(),
                        reason: frame.close_reason.unwrap_or_default().into(),
                    });
                    let _ = local_write.send(WsMessage::Close(close_frame)).await;
                    break;
                }
                _ => continue,
            };
            if local_write.send(message).await.is_err() {
                break;
            }
        }
    });

    Ok(())
}

fn ws_frame(frame_type: WsFrameType, data: Option<Vec<u8>>, close_code: Option<u16>, close_reason: Option<String>) -> WebSocketFramePayload {
    WebSocketFramePayload {
        frame_type: Some(frame_type),
        data,
        close_code,
        close_reason,
    }
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

    fn text_frame(s: &str) -> WebSocketFramePayload {
        WebSocketFramePayload {
            frame_type: Some(WsFrameType::Text),
            data: Some(s.as_bytes().to_vec()),
            close_code: None,
            close_reason: None,
        }
    }

    #[test]
    fn register_then_deliver_reaches_the_local_writer() {
        let registry = WsProxyRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("c1".to_string(), WsClientProxy { to_local: tx });
        assert!(registry.deliver("c1", text_frame("hi")));
        let received = rx.try_recv().unwrap();
        assert_eq!(received.data.as_deref(), Some(b"hi".as_slice()));
    }

    #[test]
    fn deliver_to_unknown_correlation_id_returns_false() {
        let registry = WsProxyRegistry::new();
        assert!(!registry.deliver("missing", text_frame("x")));
    }

    #[test]
    fn close_all_drops_every_sender() {
        let registry = WsProxyRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register("a".to_string(), WsClientProxy { to_local: tx });
        registry.close_all();
        assert_eq!(registry.len(), 0);
        drop(rx);
    }
}

//! WebSocket proxy manager, server half.
//!
//! Bridges an external WebSocket session to the frame-carrier envelopes
//! that ride the control tunnel, keyed by the correlation id the upgrade
//! REQUEST/RESPONSE pair established.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tunnel_common::WebSocketFramePayload;

/// A single proxied external WebSocket session, registered once the
/// upgrade handshake completes with a `101` response (§4.7 step 2).
pub struct WsProxy {
    /// Frames arriving from the client (over the tunnel) are forwarded
    /// here for the external-socket writer task to relay onward.
    pub to_external: mpsc::UnboundedSender<WebSocketFramePayload>,
}

/// Registry of open WS proxies for one tunnel, keyed by correlation id.
/// Lives alongside a [`crate::pending::PendingTable`] on each
/// [`crate::registry::Tunnel`].
pub struct WsProxyRegistry {
    proxies: Mutex<HashMap<String, WsProxy>>,
}

impl WsProxyRegistry {
    pub fn new() -> Self {
        Self {
            proxies: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, correlation_id: String, proxy: WsProxy) {
        self.proxies.lock().unwrap().insert(correlation_id, proxy);
    }

    pub fn is_open(&self, correlation_id: &str) -> bool {
        self.proxies.lock().unwrap().contains_key(correlation_id)
    }

    /// Routes a client-originated frame (arrived wrapped in a RESPONSE
    /// envelope, §4.7 step 3) to the matching external socket. Returns
    /// `false` if no such proxy is registered (already closed, or an
    /// unknown correlation id — logged and dropped by the caller).
    pub fn deliver(&self, correlation_id: &str, frame: WebSocketFramePayload) -> bool {
        let guard = self.proxies.lock().unwrap();
        match guard.get(correlation_id) {
            Some(proxy) => proxy.to_external.send(frame).is_ok(),
            None => false,
        }
    }

    /// Unregisters a single proxy (either side closed, §4.7 step 4).
    pub fn unregister(&self, correlation_id: &str) {
        self.proxies.lock().unwrap().remove(correlation_id);
    }

    /// Closes every open proxy, used on tunnel teardown (§4.4, §4.5) —
    /// the external-socket writer tasks observe their receiver dropped
    /// and close with code 1001.
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

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_common::WsFrameType;

    fn text_frame(s: &str) -> WebSocketFramePayload {
        WebSocketFramePayload {
            frame_type: Some(WsFrameType::Text),
            data: Some(s.as_bytes().to_vec()),
            close_code: None,
            close_reason: None,
        }
    }

    #[test]
    fn register_then_deliver_reaches_the_external_writer() {
        let registry = WsProxyRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("c1".to_string(), WsProxy { to_external: tx });
        assert!(registry.is_open("c1"));
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
    fn unregister_removes_the_proxy() {
        let registry = WsProxyRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register("c1".to_string(), WsProxy { to_external: tx });
        registry.unregister("c1");
        assert!(!registry.is_open("c1"));
    }

    #[test]
    fn close_all_drops_every_sender() {
        let registry = WsProxyRegistry::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        registry.register("a".to_string(), WsProxy { to_external: tx1 });
        registry.register("b".to_string(), WsProxy { to_external: tx2 });
        registry.close_all();
        assert_eq!(registry.len(), 0);
        drop(rx1);
        drop(rx2);
    }
}

//! Tunnel registry: the live subdomain -> tunnel map shared across the
//! control, ingress, and forwarder modules.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tunnel_common::Envelope;

use crate::pending::PendingTable;
use crate::wsproxy::WsProxyRegistry;

/// A single connected client's control channel, keyed by subdomain.
pub struct Tunnel {
    /// Sends envelopes down to the client over its control WebSocket.
    pub outbound: mpsc::UnboundedSender<Envelope>,

    /// Requests in flight on this tunnel, awaiting a RESPONSE/ERROR.
    pub pending: Arc<PendingTable>,

    /// Open WebSocket proxy sessions bridged through this tunnel.
    pub ws_proxies: Arc<WsProxyRegistry>,

    /// Signals the control connection's task to close the socket with a
    /// going-away (1001) frame, used by [`Registry::shutdown`].
    pub shutdown: Arc<Notify>,

    /// Unix millis of the last envelope observed on this tunnel's control
    /// socket, updated on every inbound `CONTROL{HEARTBEAT|STATUS}`.
    pub last_seen_ms: AtomicI64,
}

impl Tunnel {
    pub fn touch(&self) {
        self.last_seen_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Concurrent subdomain → tunnel registry. One entry per connected
/// client; subdomains are unique by construction (§4.2 invariant).
pub struct Registry {
    tunnels: DashMap<String, Arc<Tunnel>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
        }
    }

    pub fn is_taken(&self, subdomain: &str) -> bool {
        self.tunnels.contains_key(subdomain)
    }

    /// Registers a new tunnel under `subdomain`. Returns the previous
    /// tunnel, if any, so the caller can decide whether to tear it down
    /// (the allocator should have prevented this; client-requested
    /// subdomains are re-checked right before insertion).
    pub fn register(&self, subdomain: String, tunnel: Arc<Tunnel>) -> Option<Arc<Tunnel>> {
        self.tunnels.insert(subdomain, tunnel)
    }

    /// Registers `tunnel` under `subdomain` unless a live tunnel already
    /// holds it (§9 Open Question 1: reconnect with the same requested
    /// subdomain replaces a stale entry but never a live one). Returns
    /// `Err(tunnel)` handing the caller's tunnel back when registration is
    /// refused, so it can be torn down without ever becoming visible in
    /// the map.
    pub fn register_replacing_stale(&self, subdomain: String, tunnel: Arc<Tunnel>) -> Result<(), Arc<Tunnel>> {
        if let Some(existing) = self.lookup(&subdomain) {
            if !existing.outbound.is_closed() {
                return Err(tunnel);
            }
        }
        self.tunnels.insert(subdomain, tunnel);
        Ok(())
    }

    pub fn lookup(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(subdomain).map(|entry| entry.value().clone())
    }

    /// Removes a tunnel and drains its pending requests / WS proxies, so
    /// that outstanding awaiters observe disconnection rather than
    /// hanging until their own timeout (§4.5 close handling).
    pub fn unregister(&self, subdomain: &str) {
        if let Some((_, tunnel)) = self.tunnels.remove(subdomain) {
            tunnel.pending.drain();
            tunnel.ws_proxies.close_all();
        }
    }

    pub fn size(&self) -> usize {
        self.tunnels.len()
    }

    /// Closes every live tunnel with a going-away indication: drains its
    /// pending requests and WS proxies the same way `unregister` does,
    /// then wakes its control task to send a 1001 close frame.
    pub fn shutdown(&self) {
        for entry in self.tunnels.iter() {
            let tunnel = entry.value();
            tunnel.pending.drain();
            tunnel.ws_proxies.close_all();
            tunnel.shutdown.notify_one();
        }
    }

    #[cfg(test)]
    pub fn clear(&self) {
        for entry in self.tunnels.iter() {
            entry.value().pending.drain();
            entry.value().ws_proxies.close_all();
        }
        self.tunnels.clear();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a tunnel together with the receiving half of its outbound
    /// channel. The receiver must stay alive for the tunnel's sender to
    /// report as open (`outbound.is_closed() == false`).
    fn make_tunnel_with_receiver() -> (Arc<Tunnel>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Tunnel {
                outbound: tx,
                pending: Arc::new(PendingTable::new()),
                ws_proxies: Arc::new(WsProxyRegistry::new()),
                shutdown: Arc::new(Notify::new()),
                last_seen_ms: AtomicI64::new(0),
            }),
            rx,
        )
    }

    fn make_tunnel() -> Arc<Tunnel> {
        make_tunnel_with_receiver().0
    }

    #[test]
    fn register_then_lookup_roundtrips() {
        let registry = Registry::new();
        assert!(!registry.is_taken("foo"));
        registry.register("foo".to_string(), make_tunnel());
        assert!(registry.is_taken("foo"));
        assert!(registry.lookup("foo").is_some());
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn unregister_drains_pending_and_removes_entry() {
        let registry = Registry::new();
        let tunnel = make_tunnel();
        let rx = tunnel.pending.put("c1".to_string()).unwrap();
        registry.register("foo".to_string(), tunnel);
        registry.unregister("foo");
        assert!(!registry.is_taken("foo"));
        assert!(rx.blocking_recv().is_err());
    }

    #[test]
    fn unregister_unknown_subdomain_is_a_noop() {
        let registry = Registry::new();
        registry.unregister("nonexistent");
        assert_eq!(registry.size(), 0);
    }

    #[test]
    fn register_replacing_stale_rejects_a_live_tunnel() {
        let registry = Registry::new();
        let (live, _rx) = make_tunnel_with_receiver();
        registry.register("foo".to_string(), live);
        let incoming = make_tunnel();
        let rejected = registry.register_replacing_stale("foo".to_string(), incoming);
        assert!(rejected.is_err());
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn register_replacing_stale_replaces_a_closed_tunnel() {
        let registry = Registry::new();
        registry.register("foo".to_string(), make_tunnel());
        let incoming = make_tunnel();
        assert!(registry.register_replacing_stale("foo".to_string(), incoming).is_ok());
        assert_eq!(registry.size(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_pending_and_notifies_every_tunnel() {
        let registry = Registry::new();
        let (tunnel, _rx) = make_tunnel_with_receiver();
        let pending_rx = tunnel.pending.put("c1".to_string()).unwrap();
        let shutdown_notified = tunnel.shutdown.clone();
        registry.register("foo".to_string(), tunnel);

        registry.shutdown();

        assert!(pending_rx.await.is_err());
        // notify_one() was called before any waiter registered, so the
        // next `notified()` call resolves immediately (permit semantics).
        shutdown_notified.notified().await;
    }
}

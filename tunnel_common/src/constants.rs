//! Protocol-wide constants

/// Wire protocol version. Field tags below are stable for this version;
/// bumping it is a signal that a receiver should not assume unknown tags
/// are safe to ignore.
pub const PROTOCOL_VERSION: &str = "v2";

/// Default request timeout if not overridden by configuration.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default maximum request body size (10 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Client heartbeat interval.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Bounded window for a send on the control socket before it is treated as
/// a stalled peer (resolves the pending request as BAD_GATEWAY).
pub const SEND_WINDOW_SECS: u64 = 5;

/// Timeout waiting for the client's initial CONTROL{REGISTERED} handshake.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Length of generated subdomain labels.
pub const SUBDOMAIN_LABEL_LEN: usize = 12;

/// Retry budget for subdomain allocation collisions.
pub const SUBDOMAIN_ALLOCATE_RETRIES: u32 = 10;

/// Headers stripped before a request/response crosses the tunnel boundary.
/// Comparison is case-insensitive.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "transfer-encoding",
    "upgrade",
];

/// Returns true if `name` is a hop-by-hop header that must not be relayed.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

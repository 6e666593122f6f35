//! Tunnel common — shared wire protocol for the tunneling service.
//!
//! This crate contains the envelope protocol (§3) and its binary codec
//! (§4.1), used by both the server and the CLI client.

pub mod codec;
pub mod constants;
mod envelope;
mod error;

pub use envelope::{
    new_correlation_id, ControlAction, ControlPayload, Envelope, EnvelopeType, ErrorCode,
    ErrorPayload, Payload, RequestPayload, ResponsePayload, WebSocketFramePayload, WsFrameType,
};
pub use error::{ParseError, ProtocolError};

impl Envelope {
    /// Serialize to the binary wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        codec::encode(self)
    }

    /// Parse from the binary wire format.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        codec::decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn envelope_to_bytes_from_bytes_roundtrip() {
        let env = Envelope::request(
            new_correlation_id(),
            42,
            RequestPayload {
                method: "POST".to_string(),
                path: "/api/data".to_string(),
                query: HashMap::new(),
                headers: HashMap::new(),
                body: Some(b"{\"k\":\"v\"}".to_vec()),
                websocket_upgrade: false,
            },
        );
        let bytes = env.to_bytes();
        let decoded = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn hop_by_hop_headers_are_recognized_case_insensitively() {
        assert!(constants::is_hop_by_hop("Connection"));
        assert!(constants::is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!constants::is_hop_by_hop("Content-Type"));
    }

    #[test]
    fn error_codes_map_to_expected_http_statuses() {
        assert_eq!(ErrorCode::Timeout.http_status(), 504);
        assert_eq!(ErrorCode::UpstreamError.http_status(), 502);
        assert_eq!(ErrorCode::InvalidRequest.http_status(), 400);
        assert_eq!(ErrorCode::ServerError.http_status(), 500);
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
    }
}

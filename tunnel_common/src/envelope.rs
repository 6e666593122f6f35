//! The wire envelope and its payload variants.

use std::collections::HashMap;

use uuid::Uuid;

/// Generate a new opaque correlation id.
///
/// Callers never parse this string, it only needs to be unique and
/// echoed back verbatim.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// The four envelope kinds that appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeType {
    Request,
    Response,
    Error,
    Control,
}

impl EnvelopeType {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            EnvelopeType::Request => 1,
            EnvelopeType::Response => 2,
            EnvelopeType::Error => 3,
            EnvelopeType::Control => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(EnvelopeType::Request),
            2 => Some(EnvelopeType::Response),
            3 => Some(EnvelopeType::Error),
            4 => Some(EnvelopeType::Control),
            _ => None,
        }
    }
}

/// A request to forward to the local application.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestPayload {
    pub method: String,
    /// Path only, no scheme/host. Always starts with `/`.
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub websocket_upgrade: bool,
}

/// A response to an external request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponsePayload {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

/// Error codes surfaced on the wire; each maps to an HTTP status at the
/// ingress boundary (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Timeout,
    UpstreamError,
    InvalidRequest,
    ServerError,
    RateLimited,
}

impl ErrorCode {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ErrorCode::Timeout => 1,
            ErrorCode::UpstreamError => 2,
            ErrorCode::InvalidRequest => 3,
            ErrorCode::ServerError => 4,
            ErrorCode::RateLimited => 5,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ErrorCode::Timeout),
            2 => Some(ErrorCode::UpstreamError),
            3 => Some(ErrorCode::InvalidRequest),
            4 => Some(ErrorCode::ServerError),
            5 => Some(ErrorCode::RateLimited),
            _ => None,
        }
    }

    /// The HTTP status this error code surfaces as at the public ingress.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::Timeout => 504,
            ErrorCode::UpstreamError => 502,
            ErrorCode::InvalidRequest => 400,
            ErrorCode::ServerError => 500,
            ErrorCode::RateLimited => 429,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Control-channel bookkeeping actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Registered,
    Heartbeat,
    Status,
    Unregister,
}

impl ControlAction {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ControlAction::Registered => 1,
            ControlAction::Heartbeat => 2,
            ControlAction::Status => 3,
            ControlAction::Unregister => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ControlAction::Registered),
            2 => Some(ControlAction::Heartbeat),
            3 => Some(ControlAction::Status),
            4 => Some(ControlAction::Unregister),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlPayload {
    pub action: Option<ControlAction>,
    pub subdomain: Option<String>,
    pub public_url: Option<String>,
}

/// WebSocket frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsFrameType {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl WsFrameType {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            WsFrameType::Text => 1,
            WsFrameType::Binary => 2,
            WsFrameType::Close => 3,
            WsFrameType::Ping => 4,
            WsFrameType::Pong => 5,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(WsFrameType::Text),
            2 => Some(WsFrameType::Binary),
            3 => Some(WsFrameType::Close),
            4 => Some(WsFrameType::Ping),
            5 => Some(WsFrameType::Pong),
            _ => None,
        }
    }
}

/// A single WebSocket frame, carried inside a REQUEST or RESPONSE envelope
/// for a correlation id that has already completed its upgrade handshake
/// (§4.7). `data` encodes UTF-8 text for `Text` frames.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WebSocketFramePayload {
    pub frame_type: Option<WsFrameType>,
    pub data: Option<Vec<u8>>,
    pub close_code: Option<u16>,
    pub close_reason: Option<String>,
}

/// The tagged union of everything an envelope can carry.
///
/// `WebSocketFrame` is the fifth practical shape mentioned in §3/§4.7: it
/// rides inside an envelope whose `type` is `Request` or `Response`
/// depending on which direction the frame is travelling, rather than having
/// its own envelope type. [`Envelope::is_consistent`] encodes exactly which
/// `(EnvelopeType, Payload)` pairings are legal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Request(RequestPayload),
    Response(ResponsePayload),
    Error(ErrorPayload),
    Control(ControlPayload),
    WebSocketFrame(WebSocketFramePayload),
}

/// The only object that travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub correlation_id: String,
    pub envelope_type: EnvelopeType,
    /// Sender's clock, milliseconds since epoch. Advisory only.
    pub timestamp_ms: i64,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(correlation_id: impl Into<String>, envelope_type: EnvelopeType, timestamp_ms: i64, payload: Payload) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            envelope_type,
            timestamp_ms,
            payload,
        }
    }

    pub fn request(correlation_id: impl Into<String>, timestamp_ms: i64, payload: RequestPayload) -> Self {
        Self::new(correlation_id, EnvelopeType::Request, timestamp_ms, Payload::Request(payload))
    }

    pub fn response(correlation_id: impl Into<String>, timestamp_ms: i64, payload: ResponsePayload) -> Self {
        Self::new(correlation_id, EnvelopeType::Response, timestamp_ms, Payload::Response(payload))
    }

    pub fn error(correlation_id: impl Into<String>, timestamp_ms: i64, payload: ErrorPayload) -> Self {
        Self::new(correlation_id, EnvelopeType::Error, timestamp_ms, Payload::Error(payload))
    }

    pub fn control(correlation_id: impl Into<String>, timestamp_ms: i64, payload: ControlPayload) -> Self {
        Self::new(correlation_id, EnvelopeType::Control, timestamp_ms, Payload::Control(payload))
    }

    /// Build a WebSocket frame-carrier envelope. `outbound_to_client` is
    /// true when the frame travels server→client (wire type `Request`,
    /// mirroring the direction of the original upgrade request) and false
    /// when it travels client→server (wire type `Response`).
    pub fn ws_frame(correlation_id: impl Into<String>, timestamp_ms: i64, outbound_to_client: bool, payload: WebSocketFramePayload) -> Self {
        let envelope_type = if outbound_to_client { EnvelopeType::Request } else { EnvelopeType::Response };
        Self::new(correlation_id, envelope_type, timestamp_ms, Payload::WebSocketFrame(payload))
    }

    /// Checks the invariant from §3: `type` must match the variant of
    /// `payload`, with the WebSocket frame-carrier exception from §4.7.
    pub fn is_consistent(&self) -> bool {
        if self.correlation_id.is_empty() {
            return false;
        }
        match (&self.envelope_type, &self.payload) {
            (EnvelopeType::Request, Payload::Request(_)) => true,
            (EnvelopeType::Request, Payload::WebSocketFrame(_)) => true,
            (EnvelopeType::Response, Payload::Response(_)) => true,
            (EnvelopeType::Response, Payload::WebSocketFrame(_)) => true,
            (EnvelopeType::Error, Payload::Error(_)) => true,
            (EnvelopeType::Control, Payload::Control(_)) => true,
            _ => false,
        }
    }
}

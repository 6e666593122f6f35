//! Hand-written tag/length/value binary codec for [`Envelope`] (§4.1).
//!
//! Every field carries an explicit `u8` tag followed by a `u32` (little
//! endian) length and that many bytes of value. A decoder that doesn't
//! recognize a tag simply skips the value using the length prefix, which is
//! what makes the format forward-compatible across protocol evolutions —
//! no reflection, no schema registry, just tags agreed on out of band.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::envelope::{
    ControlAction, ControlPayload, Envelope, EnvelopeType, ErrorCode, ErrorPayload, Payload,
    RequestPayload, ResponsePayload, WebSocketFramePayload, WsFrameType,
};
use crate::error::ParseError;

// Envelope-level tags.
const TAG_CORRELATION_ID: u8 = 1;
const TAG_ENVELOPE_TYPE: u8 = 2;
const TAG_TIMESTAMP_MS: u8 = 3;
const TAG_PAYLOAD: u8 = 4;

// Payload-kind discriminant, shared by every payload variant's blob.
const TAG_PAYLOAD_KIND: u8 = 0;
const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;
const KIND_ERROR: u8 = 3;
const KIND_CONTROL: u8 = 4;
const KIND_WS_FRAME: u8 = 5;

// RequestPayload tags.
const REQ_METHOD: u8 = 1;
const REQ_PATH: u8 = 2;
const REQ_QUERY_ENTRY: u8 = 3;
const REQ_HEADER_ENTRY: u8 = 4;
const REQ_BODY: u8 = 5;
const REQ_WS_UPGRADE: u8 = 6;

// ResponsePayload tags.
const RESP_STATUS_CODE: u8 = 1;
const RESP_HEADER_ENTRY: u8 = 2;
const RESP_BODY: u8 = 3;

// ErrorPayload tags.
const ERR_CODE: u8 = 1;
const ERR_MESSAGE: u8 = 2;

// ControlPayload tags.
const CTRL_ACTION: u8 = 1;
const CTRL_SUBDOMAIN: u8 = 2;
const CTRL_PUBLIC_URL: u8 = 3;

// WebSocketFramePayload tags.
const WS_FRAME_TYPE: u8 = 1;
const WS_DATA: u8 = 2;
const WS_CLOSE_CODE: u8 = 3;
const WS_CLOSE_REASON: u8 = 4;

// Map-entry tags, reused for every key/value pair regardless of which map
// it belongs to.
const KV_KEY: u8 = 1;
const KV_VALUE: u8 = 2;

fn write_field(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// Reads one `(tag, value)` pair off the front of `buf`, or `None` if the
/// buffer is exhausted.
fn read_field(buf: &mut Bytes, field: &'static str) -> Result<Option<(u8, Bytes)>, ParseError> {
    if !buf.has_remaining() {
        return Ok(None);
    }
    if buf.remaining() < 1 {
        return Err(ParseError::Truncated { field });
    }
    let tag = buf.get_u8();
    if buf.remaining() < 4 {
        return Err(ParseError::Truncated { field });
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(ParseError::Truncated { field });
    }
    let value = buf.copy_to_bytes(len);
    Ok(Some((tag, value)))
}

/// Collects every `(tag, value)` pair in `bytes` into a list, tolerating any
/// field order.
fn collect_fields(bytes: &Bytes, field: &'static str) -> Result<Vec<(u8, Bytes)>, ParseError> {
    let mut cursor = bytes.clone();
    let mut out = Vec::new();
    while let Some(pair) = read_field(&mut cursor, field)? {
        out.push(pair);
    }
    Ok(out)
}

fn utf8(value: Bytes, field: &'static str) -> Result<String, ParseError> {
    String::from_utf8(value.to_vec()).map_err(|_| ParseError::InvalidUtf8 { field })
}

fn encode_kv(key: &str, value: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_field(&mut buf, KV_KEY, key.as_bytes());
    write_field(&mut buf, KV_VALUE, value.as_bytes());
    buf.to_vec()
}

fn decode_kv(bytes: Bytes, field: &'static str) -> Result<(String, String), ParseError> {
    let mut key = None;
    let mut value = None;
    for (tag, v) in collect_fields(&bytes, field)? {
        match tag {
            KV_KEY => key = Some(utf8(v, field)?),
            KV_VALUE => value = Some(utf8(v, field)?),
            _ => {}
        }
    }
    Ok((
        key.ok_or(ParseError::MissingField { field })?,
        value.ok_or(ParseError::MissingField { field })?,
    ))
}

fn encode_bool(v: bool) -> [u8; 1] {
    [if v { 1 } else { 0 }]
}

fn decode_bool(value: &Bytes, field: &'static str) -> Result<bool, ParseError> {
    if value.len() != 1 {
        return Err(ParseError::Truncated { field });
    }
    Ok(value[0] != 0)
}

fn decode_u16(value: &Bytes, field: &'static str) -> Result<u16, ParseError> {
    if value.len() != 2 {
        return Err(ParseError::Truncated { field });
    }
    Ok(u16::from_le_bytes([value[0], value[1]]))
}

fn encode_request(buf: &mut BytesMut, req: &RequestPayload) {
    write_field(buf, TAG_PAYLOAD_KIND, &[KIND_REQUEST]);
    write_field(buf, REQ_METHOD, req.method.as_bytes());
    write_field(buf, REQ_PATH, req.path.as_bytes());
    for (k, v) in &req.query {
        write_field(buf, REQ_QUERY_ENTRY, &encode_kv(k, v));
    }
    for (k, v) in &req.headers {
        write_field(buf, REQ_HEADER_ENTRY, &encode_kv(k, v));
    }
    if let Some(body) = &req.body {
        write_field(buf, REQ_BODY, body);
    }
    write_field(buf, REQ_WS_UPGRADE, &encode_bool(req.websocket_upgrade));
}

fn decode_request(fields: Vec<(u8, Bytes)>) -> Result<RequestPayload, ParseError> {
    let mut out = RequestPayload::default();
    let mut method = None;
    let mut path = None;
    for (tag, value) in fields {
        match tag {
            REQ_METHOD => method = Some(utf8(value, "request.method")?),
            REQ_PATH => path = Some(utf8(value, "request.path")?),
            REQ_QUERY_ENTRY => {
                let (k, v) = decode_kv(value, "request.query")?;
                out.query.insert(k, v);
            }
            REQ_HEADER_ENTRY => {
                let (k, v) = decode_kv(value, "request.headers")?;
                out.headers.insert(k, v);
            }
            REQ_BODY => out.body = Some(value.to_vec()),
            REQ_WS_UPGRADE => out.websocket_upgrade = decode_bool(&value, "request.websocket_upgrade")?,
            _ => {}
        }
    }
    out.method = method.ok_or(ParseError::MissingField { field: "request.method" })?;
    out.path = path.ok_or(ParseError::MissingField { field: "request.path" })?;
    Ok(out)
}

fn encode_response(buf: &mut BytesMut, resp: &ResponsePayload) {
    write_field(buf, TAG_PAYLOAD_KIND, &[KIND_RESPONSE]);
    write_field(buf, RESP_STATUS_CODE, &resp.status_code.to_le_bytes());
    for (k, v) in &resp.headers {
        write_field(buf, RESP_HEADER_ENTRY, &encode_kv(k, v));
    }
    if let Some(body) = &resp.body {
        write_field(buf, RESP_BODY, body);
    }
}

fn decode_response(fields: Vec<(u8, Bytes)>) -> Result<ResponsePayload, ParseError> {
    let mut out = ResponsePayload::default();
    let mut status_code = None;
    for (tag, value) in fields {
        match tag {
            RESP_STATUS_CODE => status_code = Some(decode_u16(&value, "response.status_code")?),
            RESP_HEADER_ENTRY => {
                let (k, v) = decode_kv(value, "response.headers")?;
                out.headers.insert(k, v);
            }
            RESP_BODY => out.body = Some(value.to_vec()),
            _ => {}
        }
    }
    out.status_code = status_code.ok_or(ParseError::MissingField { field: "response.status_code" })?;
    Ok(out)
}

fn encode_error(buf: &mut BytesMut, err: &ErrorPayload) {
    write_field(buf, TAG_PAYLOAD_KIND, &[KIND_ERROR]);
    write_field(buf, ERR_CODE, &[err.code.to_u8()]);
    write_field(buf, ERR_MESSAGE, err.message.as_bytes());
}

fn decode_error(fields: Vec<(u8, Bytes)>) -> Result<ErrorPayload, ParseError> {
    let mut code = None;
    let mut message = None;
    for (tag, value) in fields {
        match tag {
            ERR_CODE => {
                if value.len() != 1 {
                    return Err(ParseError::Truncated { field: "error.code" });
                }
                code = Some(ErrorCode::from_u8(value[0]).ok_or(ParseError::UnknownDiscriminant {
                    field: "error.code",
                    value: value[0],
                })?);
            }
            ERR_MESSAGE => message = Some(utf8(value, "error.message")?),
            _ => {}
        }
    }
    Ok(ErrorPayload {
        code: code.ok_or(ParseError::MissingField { field: "error.code" })?,
        message: message.ok_or(ParseError::MissingField { field: "error.message" })?,
    })
}

fn encode_control(buf: &mut BytesMut, ctrl: &ControlPayload) {
    write_field(buf, TAG_PAYLOAD_KIND, &[KIND_CONTROL]);
    if let Some(action) = ctrl.action {
        write_field(buf, CTRL_ACTION, &[action.to_u8()]);
    }
    if let Some(subdomain) = &ctrl.subdomain {
        write_field(buf, CTRL_SUBDOMAIN, subdomain.as_bytes());
    }
    if let Some(public_url) = &ctrl.public_url {
        write_field(buf, CTRL_PUBLIC_URL, public_url.as_bytes());
    }
}

fn decode_control(fields: Vec<(u8, Bytes)>) -> Result<ControlPayload, ParseError> {
    let mut out = ControlPayload::default();
    for (tag, value) in fields {
        match tag {
            CTRL_ACTION => {
                if value.len() != 1 {
                    return Err(ParseError::Truncated { field: "control.action" });
                }
                out.action = Some(ControlAction::from_u8(value[0]).ok_or(ParseError::UnknownDiscriminant {
                    field: "control.action",
                    value: value[0],
                })?);
            }
            CTRL_SUBDOMAIN => out.subdomain = Some(utf8(value, "control.subdomain")?),
            CTRL_PUBLIC_URL => out.public_url = Some(utf8(value, "control.public_url")?),
            _ => {}
        }
    }
    Ok(out)
}

fn encode_ws_frame(buf: &mut BytesMut, frame: &WebSocketFramePayload) {
    write_field(buf, TAG_PAYLOAD_KIND, &[KIND_WS_FRAME]);
    if let Some(frame_type) = frame.frame_type {
        write_field(buf, WS_FRAME_TYPE, &[frame_type.to_u8()]);
    }
    if let Some(data) = &frame.data {
        write_field(buf, WS_DATA, data);
    }
    if let Some(code) = frame.close_code {
        write_field(buf, WS_CLOSE_CODE, &code.to_le_bytes());
    }
    if let Some(reason) = &frame.close_reason {
        write_field(buf, WS_CLOSE_REASON, reason.as_bytes());
    }
}

fn decode_ws_frame(fields: Vec<(u8, Bytes)>) -> Result<WebSocketFramePayload, ParseError> {
    let mut out = WebSocketFramePayload::default();
    for (tag, value) in fields {
        match tag {
            WS_FRAME_TYPE => {
                if value.len() != 1 {
                    return Err(ParseError::Truncated { field: "ws_frame.frame_type" });
                }
                out.frame_type = Some(WsFrameType::from_u8(value[0]).ok_or(ParseError::UnknownDiscriminant {
                    field: "ws_frame.frame_type",
                    value: value[0],
                })?);
            }
            WS_DATA => out.data = Some(value.to_vec()),
            WS_CLOSE_CODE => out.close_code = Some(decode_u16(&value, "ws_frame.close_code")?),
            WS_CLOSE_REASON => out.close_reason = Some(utf8(value, "ws_frame.close_reason")?),
            _ => {}
        }
    }
    Ok(out)
}

fn encode_payload(payload: &Payload) -> Vec<u8> {
    let mut buf = BytesMut::new();
    match payload {
        Payload::Request(r) => encode_request(&mut buf, r),
        Payload::Response(r) => encode_response(&mut buf, r),
        Payload::Error(e) => encode_error(&mut buf, e),
        Payload::Control(c) => encode_control(&mut buf, c),
        Payload::WebSocketFrame(f) => encode_ws_frame(&mut buf, f),
    }
    buf.to_vec()
}

fn decode_payload(bytes: Bytes) -> Result<Payload, ParseError> {
    let fields = collect_fields(&bytes, "payload")?;
    let kind = fields
        .iter()
        .find(|(tag, _)| *tag == TAG_PAYLOAD_KIND)
        .map(|(_, v)| v.clone())
        .ok_or(ParseError::MissingField { field: "payload.kind" })?;
    if kind.len() != 1 {
        return Err(ParseError::Truncated { field: "payload.kind" });
    }
    let rest: Vec<(u8, Bytes)> = fields.into_iter().filter(|(tag, _)| *tag != TAG_PAYLOAD_KIND).collect();
    match kind[0] {
        KIND_REQUEST => Ok(Payload::Request(decode_request(rest)?)),
        KIND_RESPONSE => Ok(Payload::Response(decode_response(rest)?)),
        KIND_ERROR => Ok(Payload::Error(decode_error(rest)?)),
        KIND_CONTROL => Ok(Payload::Control(decode_control(rest)?)),
        KIND_WS_FRAME => Ok(Payload::WebSocketFrame(decode_ws_frame(rest)?)),
        other => Err(ParseError::UnknownDiscriminant { field: "payload.kind", value: other }),
    }
}

/// Serializes `envelope` to its binary wire form.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_field(&mut buf, TAG_CORRELATION_ID, envelope.correlation_id.as_bytes());
    write_field(&mut buf, TAG_ENVELOPE_TYPE, &[envelope.envelope_type.to_u8()]);
    write_field(&mut buf, TAG_TIMESTAMP_MS, &envelope.timestamp_ms.to_le_bytes());
    write_field(&mut buf, TAG_PAYLOAD, &encode_payload(&envelope.payload));
    buf.to_vec()
}

/// Parses a binary frame into an [`Envelope`]. Rejects empty input and
/// surfaces a structured [`ParseError`] naming the field that failed.
pub fn decode(bytes: &[u8]) -> Result<Envelope, ParseError> {
    if bytes.is_empty() {
        return Err(ParseError::EmptyInput);
    }
    let mut cursor = Bytes::copy_from_slice(bytes);
    let mut correlation_id = None;
    let mut envelope_type = None;
    let mut timestamp_ms = None;
    let mut payload_bytes = None;

    while let Some((tag, value)) = read_field(&mut cursor, "envelope")? {
        match tag {
            TAG_CORRELATION_ID => correlation_id = Some(utf8(value, "correlation_id")?),
            TAG_ENVELOPE_TYPE => {
                if value.len() != 1 {
                    return Err(ParseError::Truncated { field: "envelope_type" });
                }
                envelope_type = Some(EnvelopeType::from_u8(value[0]).ok_or(ParseError::UnknownDiscriminant {
                    field: "envelope_type",
                    value: value[0],
                })?);
            }
            TAG_TIMESTAMP_MS => {
                if value.len() != 8 {
                    return Err(ParseError::Truncated { field: "timestamp_ms" });
                }
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&value);
                timestamp_ms = Some(i64::from_le_bytes(arr));
            }
            TAG_PAYLOAD => payload_bytes = Some(value),
            _ => {}
        }
    }

    let correlation_id = correlation_id.ok_or(ParseError::MissingField { field: "correlation_id" })?;
    if correlation_id.is_empty() {
        return Err(ParseError::EmptyCorrelationId);
    }
    let envelope_type = envelope_type.ok_or(ParseError::MissingField { field: "envelope_type" })?;
    let timestamp_ms = timestamp_ms.ok_or(ParseError::MissingField { field: "timestamp_ms" })?;
    let payload_bytes = payload_bytes.ok_or(ParseError::MissingField { field: "payload" })?;
    let payload = decode_payload(payload_bytes)?;

    let envelope = Envelope { correlation_id, envelope_type, timestamp_ms, payload };
    if !envelope.is_consistent() {
        return Err(ParseError::TypeMismatch);
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::*;

    #[test]
    fn roundtrip_request() {
        let mut headers = std::collections::HashMap::new();
        headers.insert("A".to_string(), "a".to_string());
        let env = Envelope::request(
            "cid-1",
            1234,
            RequestPayload {
                method: "GET".to_string(),
                path: "/api/x".to_string(),
                query: [("y".to_string(), "1".to_string())].into_iter().collect(),
                headers,
                body: Some(b"hello".to_vec()),
                websocket_upgrade: false,
            },
        );
        let bytes = encode(&env);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn roundtrip_response_no_body() {
        let env = Envelope::response(
            "cid-2",
            1,
            ResponsePayload { status_code: 204, headers: Default::default(), body: None },
        );
        let bytes = encode(&env);
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn roundtrip_error() {
        let env = Envelope::error("cid-3", 0, ErrorPayload::new(ErrorCode::Timeout, "too slow"));
        let bytes = encode(&env);
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn roundtrip_control() {
        let env = Envelope::control(
            "cid-4",
            0,
            ControlPayload {
                action: Some(ControlAction::Registered),
                subdomain: Some("foo".to_string()),
                public_url: Some("https://foo.example.com".to_string()),
            },
        );
        let bytes = encode(&env);
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn roundtrip_ws_frame_both_directions() {
        let outbound = Envelope::ws_frame(
            "cid-5",
            0,
            true,
            WebSocketFramePayload { frame_type: Some(WsFrameType::Text), data: Some(b"hi".to_vec()), close_code: None, close_reason: None },
        );
        assert_eq!(outbound.envelope_type, EnvelopeType::Request);
        assert_eq!(decode(&encode(&outbound)).unwrap(), outbound);

        let inbound = Envelope::ws_frame(
            "cid-5",
            0,
            false,
            WebSocketFramePayload { frame_type: Some(WsFrameType::Close), data: None, close_code: Some(1000), close_reason: Some("bye".to_string()) },
        );
        assert_eq!(inbound.envelope_type, EnvelopeType::Response);
        assert_eq!(decode(&encode(&inbound)).unwrap(), inbound);
    }

    #[test]
    fn decode_rejects_empty_input() {
        assert_eq!(decode(&[]).unwrap_err(), ParseError::EmptyInput);
    }

    #[test]
    fn decode_rejects_empty_correlation_id() {
        let env = Envelope::control("", 0, ControlPayload::default());
        // Encoding doesn't validate; decode must reject it.
        let bytes = encode(&env);
        assert_eq!(decode(&bytes).unwrap_err(), ParseError::EmptyCorrelationId);
    }

    #[test]
    fn decode_skips_unknown_tags() {
        let env = Envelope::error("cid-6", 0, ErrorPayload::new(ErrorCode::ServerError, "boom"));
        let mut bytes = encode(&env);
        // Append a bogus top-level field with a tag no current version uses.
        let mut extra = BytesMut::new();
        write_field(&mut extra, 200, b"from-the-future");
        bytes.extend_from_slice(&extra);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn decode_rejects_type_mismatch() {
        // A Control payload wrapped in a Request-typed envelope is invalid.
        let mismatched = Envelope {
            correlation_id: "cid-7".to_string(),
            envelope_type: EnvelopeType::Request,
            timestamp_ms: 0,
            payload: Payload::Control(ControlPayload::default()),
        };
        let bytes = encode(&mismatched);
        assert_eq!(decode(&bytes).unwrap_err(), ParseError::TypeMismatch);
    }
}

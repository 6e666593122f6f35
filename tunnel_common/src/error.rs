//! Protocol-level error types

use thiserror::Error;

/// Errors raised while decoding a frame off the wire.
///
/// Carries which field the parser was working on when it gave up, per the
/// codec's contract that a `ParseError` must be structured enough for the
/// caller to know what went wrong without re-parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty input")]
    EmptyInput,

    #[error("truncated frame while reading field {field}")]
    Truncated { field: &'static str },

    #[error("invalid UTF-8 in field {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("unknown discriminant {value} for field {field}")]
    UnknownDiscriminant { field: &'static str, value: u8 },

    #[error("missing required field {field}")]
    MissingField { field: &'static str },

    #[error("envelope type does not match payload variant")]
    TypeMismatch,

    #[error("correlation id must be non-empty")]
    EmptyCorrelationId,
}

/// Errors surfaced by the protocol layer above raw (de)serialization.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to parse envelope: {0}")]
    Parse(#[from] ParseError),

    #[error("duplicate correlation id")]
    DuplicateCorrelationId,
}

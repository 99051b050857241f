//! Protocol-level errors.

use thiserror::Error;

/// Errors raised while parsing or building wire traffic.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Unterminated quoted string")]
    UnterminatedQuote,
    #[error("Missing parameter: expected {0}")]
    MissingParam(&'static str),
    #[error("Invalid parameter {name}: {value:?}")]
    InvalidParam { name: &'static str, value: String },
    #[error("Trailing parameters after {0}")]
    TrailingParams(&'static str),
    #[error("Invalid completion line: {0:?}")]
    InvalidCompletion(String),
    #[error("Malformed binary header: {0:?}")]
    BadBinaryHeader(String),
    #[error("Binary data for unknown channel {0}")]
    UnknownChannel(u16),
    #[error("Unknown value type tag {0:#06x}")]
    UnknownValueType(u32),
    #[error("Unknown device type {0}")]
    UnknownDeviceType(u16),
    #[error("Operation {op} not supported for {kind} values")]
    UnsupportedOp { op: &'static str, kind: &'static str },
    #[error("Line exceeds maximum length ({0} bytes)")]
    LineTooLong(usize),
}

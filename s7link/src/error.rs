use crate::frame::types::ReturnCode;
use crate::tag::TagParseState;
use std::result::Result as StdResult;
use thiserror::Error as ThisError;

/// Unified result type for this crate
pub type Result<T> = StdResult<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Operation invoked while the connection is not `Opened`, or the peer
    /// dropped the connection while the call was in flight.
    #[error("connection is not open")]
    NotConnected,

    #[error("request timed out (pdu ref {pdu_ref:?})")]
    Timeout { pdu_ref: Option<u16> },

    #[error("invalid tag '{tag}': rejected in state {state:?} at '{fragment}'")]
    TagParse {
        state: TagParseState,
        fragment: String,
        tag: String,
    },

    /// A single minimal item does not fit an empty package; the negotiated
    /// PDU size is too small to carry any request.
    #[error("cannot place a minimal item into an empty package (pdu size too small)")]
    CouldNotAddPackage,

    /// Per-item failure reported by the PLC inside an otherwise valid Ack.
    #[error("item {item_index} failed: {return_code:?}")]
    ProtocolContent {
        return_code: ReturnCode,
        item_index: usize,
    },

    /// Header-level error class/code in an Ack or AckData PDU.
    #[error("{} (class {class:#04x}, code {code:#04x})", class_name(.class))]
    ProtocolError { class: u8, code: u8 },

    #[error("request of {attempted} bytes exceeds the per-call limit of {limit} bytes")]
    ToMuchDataPerCall { limit: usize, attempted: usize },

    #[error("invalid frame")]
    InvalidFrame,

    #[error("insufficient data: needed {needed} bytes, available {available} bytes")]
    InsufficientData { needed: usize, available: usize },

    #[error("decode error: {context}")]
    Decode { context: &'static str },

    #[error("unexpected PDU or function")]
    UnexpectedPdu,

    #[error("invalid configuration for {0}")]
    InvalidConfiguration(&'static str),
}

#[inline]
fn class_name(class: &u8) -> &'static str {
    error_class_name(*class)
}

/// Human-readable name for the S7 header error class octet.
pub fn error_class_name(class: u8) -> &'static str {
    match class {
        0x00 => "no error",
        0x81 => "application relationship error",
        0x82 => "object definition error",
        0x83 => "no resources available",
        0x84 => "error on service processing",
        0x85 => "error on supplies",
        0x87 => "access error",
        _ => "unknown error class",
    }
}

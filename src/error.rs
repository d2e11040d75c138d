//! Error types for jt808-core.

use thiserror::Error;

use crate::session::SessionId;

/// Main error type for all codec, reassembly and session operations.
#[derive(Debug, Error)]
pub enum Jt808Error {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Missing or misplaced delimiter, truncated frame.
    #[error("Framing error: {0}")]
    Framing(String),

    /// XOR checksum did not match the payload.
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    /// Payload ended before the header fields implied by its flags.
    #[error("Header too short: need {needed} bytes, have {available}")]
    HeaderTooShort { needed: usize, available: usize },

    /// A registered body codec ran out of bytes.
    #[error("Body of message {message_id:#06x} too short: need {needed} bytes, have {available}")]
    BodyTooShort {
        message_id: u16,
        needed: usize,
        available: usize,
    },

    /// Encoded body does not fit the 10-bit length field.
    #[error("Body length {0} exceeds the 1023-byte limit of a single frame")]
    BodyTooLong(usize),

    /// Fixed-width body field given a longer value.
    #[error("Field {field} holds {max} bytes, got {actual}")]
    FieldTooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },

    /// Device id is not a decimal string of acceptable width.
    #[error("Invalid device id: {0}")]
    InvalidDeviceId(String),

    /// Nibble outside 0-9 in a BCD field.
    #[error("Invalid BCD byte: {0:#04x}")]
    InvalidBcd(u8),

    /// Fragment descriptor out of range.
    #[error("Invalid fragment {index}/{total}")]
    InvalidFragment { index: u16, total: u16 },

    /// Fragment group discarded after receiving no part within the timeout.
    #[error("Fragment group {message_id:#06x} from {device_id} timed out with {received}/{total} parts")]
    FragmentTimeout {
        device_id: String,
        message_id: u16,
        total: u16,
        received: usize,
    },

    /// Session id unknown or already evicted.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Typed body has no codec registered for its message id.
    #[error("No body codec registered for message {0:#06x}")]
    UnregisteredMessage(u16),

    /// Body codec was handed a body of a different type.
    #[error("Body does not match the codec for message {0:#06x}")]
    BodyMismatch(u16),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound queue full beyond the backpressure timeout.
    #[error("Backpressure timeout")]
    Backpressure,
}

impl Jt808Error {
    /// Whether the error only invalidates the frame that produced it.
    ///
    /// The dispatcher keeps the connection open for these.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            Jt808Error::Framing(_)
                | Jt808Error::Checksum { .. }
                | Jt808Error::HeaderTooShort { .. }
                | Jt808Error::BodyTooShort { .. }
                | Jt808Error::InvalidDeviceId(_)
                | Jt808Error::InvalidBcd(_)
                | Jt808Error::InvalidFragment { .. }
        )
    }
}

/// Result type alias using Jt808Error.
pub type Result<T> = std::result::Result<T, Jt808Error>;

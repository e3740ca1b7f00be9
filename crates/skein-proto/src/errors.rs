//! Codec errors.

use thiserror::Error;

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Failure to encode or decode a frame or payload.
///
/// Any of these surfaces as a serialization error at the session layer:
/// inbound frames are dropped and logged, outbound errors go back to the
/// caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer bytes than a header.
    #[error("frame truncated: need at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum number of bytes required
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Header does not start with the protocol magic.
    #[error("invalid magic 0x{0:08x}")]
    InvalidMagic(u32),

    /// Header carries a version this codec does not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Unknown bits set in the flags byte.
    #[error("unknown frame flags 0x{0:02x}")]
    InvalidFlags(u8),

    /// Reserved header bytes are not zero.
    #[error("reserved header bytes must be zero")]
    ReservedNotZero,

    /// Declared lengths do not add up to the message length.
    #[error("length mismatch: header declares {expected} bytes, message has {actual}")]
    LengthMismatch {
        /// Length implied by the header
        expected: usize,
        /// Length of the transport message
        actual: usize,
    },

    /// Event tag or sender id longer than the wire allows.
    #[error("{field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        /// Which field overflowed
        field: &'static str,
        /// Actual length
        len: usize,
        /// Maximum length
        max: usize,
    },

    /// Payload exceeds the hard protocol cap.
    #[error("payload of {size} bytes exceeds protocol limit of {max}")]
    PayloadTooLarge {
        /// Actual or inflated payload size
        size: usize,
        /// Protocol limit
        max: usize,
    },

    /// Event tag or sender id is not UTF-8.
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// Gzip compression or decompression failed.
    #[error("payload compression failed: {0}")]
    Compression(String),

    /// CBOR payload encoding failed.
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    /// CBOR payload decoding failed.
    #[error("CBOR decode failed: {0}")]
    CborDecode(String),
}

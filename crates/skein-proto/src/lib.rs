//! Wire format for the Skein messaging protocol.
//!
//! Every transport message carries exactly one envelope: a fixed 32-byte
//! header (zero-copy binary) followed by the event tag, the sender id and the
//! payload. The transport already delimits messages, so the envelope carries
//! no outer length prefix; the header's field lengths must cover the message
//! exactly.
//!
//! Payloads are opaque at this layer. Handlers that want structured payloads
//! use the CBOR helpers in [`payload`].
//!
//! # Security
//!
//! All parsing goes through compile-time verified layouts via `zerocopy`.
//! Payloads are capped at [`MAX_PAYLOAD_SIZE`], both as received and after
//! decompression, so a small compressed frame cannot inflate without bound.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod flags;
pub mod frame;
pub mod header;
pub mod payload;

pub use errors::{ProtocolError, Result};
pub use flags::FrameFlags;
pub use frame::{Frame, FrameCodec, MAX_FIELD_LEN, MAX_PAYLOAD_SIZE};
pub use header::FrameHeader;
pub use payload::{decode_payload, encode_payload};

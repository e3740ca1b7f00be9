//! Frame envelope and codec.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};

use crate::{FrameFlags, FrameHeader, ProtocolError, Result};

/// Hard cap on payload size, on the wire and after decompression (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Maximum length of the event tag and of the sender id.
pub const MAX_FIELD_LEN: usize = 255;

/// One wire-level message.
///
/// Within a single sender's stream `sequence` starts at 1 and increases by
/// one per emitted frame. `payload` is opaque to the protocol; the `event`
/// tag selects how the application decodes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    /// Event tag used for dispatch.
    pub event: String,
    /// Identity of the emitting endpoint.
    pub sender_id: String,
    /// Per-sender sequence number.
    pub sequence: u64,
    /// Emit time, unix seconds.
    pub timestamp: i64,
    /// Application payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame.
    pub fn new(
        event: impl Into<String>,
        sender_id: impl Into<String>,
        sequence: u64,
        timestamp: i64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            event: event.into(),
            sender_id: sender_id.into(),
            sequence,
            timestamp,
            payload: payload.into(),
        }
    }

    /// Size of this frame's encoding without compression.
    pub fn encoded_len(&self) -> usize {
        FrameHeader::SIZE + self.event.len() + self.sender_id.len() + self.payload.len()
    }

    /// Encode without compression.
    ///
    /// Encoding is deterministic: the same frame always produces the same
    /// bytes.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        self.encode_with(FrameFlags::empty(), &self.payload, dst)
    }

    fn encode_with(&self, flags: FrameFlags, wire_payload: &[u8], dst: &mut impl BufMut) -> Result<()> {
        check_field("event", self.event.len())?;
        check_field("sender_id", self.sender_id.len())?;
        if wire_payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: wire_payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = FrameHeader::new(
            flags,
            self.event.len(),
            self.sender_id.len(),
            self.sequence,
            self.timestamp,
            wire_payload.len(),
        );

        dst.put_slice(&header.to_bytes());
        dst.put_slice(self.event.as_bytes());
        dst.put_slice(self.sender_id.as_bytes());
        dst.put_slice(wire_payload);
        Ok(())
    }

    /// Decode one transport message.
    ///
    /// The message must contain exactly one envelope. Compressed payloads
    /// are inflated transparently.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::parse(bytes)?;

        check_field("event", header.event_len())?;
        check_field("sender_id", header.sender_len())?;
        if header.payload_len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: header.payload_len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if header.frame_len() != bytes.len() {
            return Err(ProtocolError::LengthMismatch {
                expected: header.frame_len(),
                actual: bytes.len(),
            });
        }

        let body = &bytes[FrameHeader::SIZE..];
        let (event, rest) = body.split_at(header.event_len());
        let (sender, wire_payload) = rest.split_at(header.sender_len());

        let event = std::str::from_utf8(event).map_err(|_| ProtocolError::InvalidUtf8("event"))?;
        let sender =
            std::str::from_utf8(sender).map_err(|_| ProtocolError::InvalidUtf8("sender_id"))?;

        let payload = if header.flags().contains(FrameFlags::COMPRESSED) {
            inflate(wire_payload)?
        } else {
            Bytes::copy_from_slice(wire_payload)
        };

        Ok(Self {
            event: event.to_owned(),
            sender_id: sender.to_owned(),
            sequence: header.sequence(),
            timestamp: header.timestamp(),
            payload,
        })
    }
}

fn check_field(field: &'static str, len: usize) -> Result<()> {
    if len > MAX_FIELD_LEN {
        return Err(ProtocolError::FieldTooLong { field, len, max: MAX_FIELD_LEN });
    }
    Ok(())
}

fn deflate(payload: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::fast());
    encoder.write_all(payload).map_err(|e| ProtocolError::Compression(e.to_string()))?;
    encoder.finish().map_err(|e| ProtocolError::Compression(e.to_string()))
}

fn inflate(wire_payload: &[u8]) -> Result<Bytes> {
    // Read one byte past the cap so an oversized stream is detected without
    // inflating all of it.
    let limit = MAX_PAYLOAD_SIZE as u64 + 1;
    let mut out = Vec::new();
    GzDecoder::new(wire_payload)
        .take(limit)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;

    if out.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge { size: out.len(), max: MAX_PAYLOAD_SIZE });
    }
    Ok(Bytes::from(out))
}

/// Frame codec with optional payload compression.
///
/// Payloads at or above `compression_threshold` bytes are gzip-compressed
/// when that actually shrinks them. Decoding handles both forms regardless
/// of the local threshold, so peers may use different settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCodec {
    compression_threshold: Option<usize>,
}

impl FrameCodec {
    /// Codec that never compresses.
    pub fn new() -> Self {
        Self { compression_threshold: None }
    }

    /// Codec that compresses payloads of at least `threshold` bytes.
    pub fn with_compression(threshold: usize) -> Self {
        Self { compression_threshold: Some(threshold) }
    }

    /// Configured compression threshold.
    pub fn compression_threshold(&self) -> Option<usize> {
        self.compression_threshold
    }

    /// Encode a frame into a standalone transport message.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes> {
        let compressed = match self.compression_threshold {
            Some(threshold) if frame.payload.len() >= threshold && !frame.payload.is_empty() => {
                let packed = deflate(&frame.payload)?;
                (packed.len() < frame.payload.len()).then_some(packed)
            },
            _ => None,
        };

        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        match compressed {
            Some(packed) => frame.encode_with(FrameFlags::COMPRESSED, &packed, &mut buf)?,
            None => frame.encode(&mut buf)?,
        }
        Ok(buf.freeze())
    }

    /// Decode a transport message.
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame> {
        Frame::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    fn sample() -> Frame {
        Frame::new("chat", "a1b2", 7, 1_700_000_000, Bytes::from_static(b"hello"))
    }

    #[test]
    fn encode_known_bytes() {
        let mut buf = Vec::new();
        sample().encode(&mut buf).unwrap();

        let mut expected =
            hex!("534B4E31 01 00 0004 0004 0000 0000000000000007 000000006553F100 00000005")
                .to_vec();
        expected.extend_from_slice(b"chat");
        expected.extend_from_slice(b"a1b2");
        expected.extend_from_slice(b"hello");
        assert_eq!(buf, expected);
    }

    #[test]
    fn roundtrip_plain() {
        let frame = sample();
        let mut buf = Vec::new();
        frame.encode(&mut buf).unwrap();
        assert_eq!(Frame::decode(&buf).unwrap(), frame);
    }

    #[test]
    fn empty_fields_roundtrip() {
        let frame = Frame::new("", "", 1, 0, Bytes::new());
        let mut buf = Vec::new();
        frame.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), FrameHeader::SIZE);
        assert_eq!(Frame::decode(&buf).unwrap(), frame);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut buf = Vec::new();
        sample().encode(&mut buf).unwrap();
        buf.push(0);
        assert!(matches!(Frame::decode(&buf), Err(ProtocolError::LengthMismatch { .. })));
    }

    #[test]
    fn truncated_body_rejected() {
        let mut buf = Vec::new();
        sample().encode(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(matches!(Frame::decode(&buf), Err(ProtocolError::LengthMismatch { .. })));
    }

    #[test]
    fn invalid_utf8_event_rejected() {
        let mut buf = Vec::new();
        sample().encode(&mut buf).unwrap();
        buf[FrameHeader::SIZE] = 0xff;
        assert_eq!(Frame::decode(&buf), Err(ProtocolError::InvalidUtf8("event")));
    }

    #[test]
    fn oversized_event_rejected_on_encode() {
        let frame = Frame::new("e".repeat(MAX_FIELD_LEN + 1), "s", 1, 0, Bytes::new());
        let mut buf = Vec::new();
        assert!(matches!(
            frame.encode(&mut buf),
            Err(ProtocolError::FieldTooLong { field: "event", .. })
        ));
    }

    #[test]
    fn compression_applies_above_threshold() {
        let codec = FrameCodec::with_compression(64);
        let frame = Frame::new("bulk", "s", 3, 10, Bytes::from(vec![b'a'; 4096]));

        let wire = codec.encode(&frame).unwrap();
        let header = FrameHeader::parse(&wire).unwrap();
        assert!(header.flags().contains(FrameFlags::COMPRESSED));
        assert!(wire.len() < frame.encoded_len());

        assert_eq!(codec.decode(&wire).unwrap(), frame);
    }

    #[test]
    fn compression_skipped_below_threshold() {
        let codec = FrameCodec::with_compression(64);
        let wire = codec.encode(&sample()).unwrap();
        let header = FrameHeader::parse(&wire).unwrap();
        assert!(header.flags().is_empty());
    }

    #[test]
    fn uncompressing_codec_reads_compressed_frames() {
        let frame = Frame::new("bulk", "s", 3, 10, Bytes::from(vec![7u8; 2048]));
        let wire = FrameCodec::with_compression(1).encode(&frame).unwrap();
        assert_eq!(FrameCodec::new().decode(&wire).unwrap(), frame);
    }

    #[test]
    fn corrupt_compressed_payload_rejected() {
        let frame = Frame::new("bulk", "s", 3, 10, Bytes::from(vec![7u8; 2048]));
        let wire = FrameCodec::with_compression(1).encode(&frame).unwrap();
        let mut bytes = wire.to_vec();
        let last = bytes.len() - 1;
        bytes[last - 6] ^= 0xff;
        bytes[last - 7] ^= 0xff;
        assert!(matches!(Frame::decode(&bytes), Err(ProtocolError::Compression(_))));
    }
}

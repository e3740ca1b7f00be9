//! Fixed-size frame header.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//!  0      4   5   6      8      10     12             20             28     32
//!  ├──────┼───┼───┼──────┼──────┼──────┼──────────────┼──────────────┼──────┤
//!  │magic │ver│flg│evlen │sndlen│rsvd  │ sequence     │ timestamp    │plen  │
//!  └──────┴───┴───┴──────┴──────┴──────┴──────────────┴──────────────┴──────┘
//! ```
//!
//! The variable part follows immediately: `evlen` bytes of event tag,
//! `sndlen` bytes of sender id, `plen` bytes of payload.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{BigEndian, I64, U16, U32, U64},
};

use crate::{FrameFlags, ProtocolError, Result};

/// Frame header as laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    magic: U32<BigEndian>,
    version: u8,
    flags: u8,
    event_len: U16<BigEndian>,
    sender_len: U16<BigEndian>,
    reserved: [u8; 2],
    sequence: U64<BigEndian>,
    timestamp: I64<BigEndian>,
    payload_len: U32<BigEndian>,
}

impl FrameHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 32;

    /// Protocol magic, ASCII "SKN1".
    pub const MAGIC: u32 = 0x534B_4E31;

    /// Current wire version.
    pub const VERSION: u8 = 1;

    /// Build a header for the given field lengths.
    ///
    /// Lengths are checked by the caller ([`crate::Frame`] encoding); this
    /// only narrows them into wire integers.
    pub(crate) fn new(
        flags: FrameFlags,
        event_len: usize,
        sender_len: usize,
        sequence: u64,
        timestamp: i64,
        payload_len: usize,
    ) -> Self {
        Self {
            magic: U32::new(Self::MAGIC),
            version: Self::VERSION,
            flags: flags.bits(),
            event_len: U16::new(event_len as u16),
            sender_len: U16::new(sender_len as u16),
            reserved: [0; 2],
            sequence: U64::new(sequence),
            timestamp: I64::new(timestamp),
            payload_len: U32::new(payload_len as u32),
        }
    }

    /// Parse and check a header from the front of `bytes`.
    ///
    /// Verifies magic, version, flags and reserved bytes. Length checks that
    /// need the whole message are done by [`crate::Frame::decode`].
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() });
        }

        let header = Self::read_from_bytes(&bytes[..Self::SIZE])
            .map_err(|_| ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() })?;

        if header.magic.get() != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic(header.magic.get()));
        }
        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        if FrameFlags::from_bits(header.flags).is_none() {
            return Err(ProtocolError::InvalidFlags(header.flags));
        }
        if header.reserved != [0; 2] {
            return Err(ProtocolError::ReservedNotZero);
        }

        Ok(header)
    }

    /// Raw header bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }

    /// Frame flags. Unknown bits were rejected by [`Self::parse`].
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.flags)
    }

    /// Length of the event tag.
    pub fn event_len(&self) -> usize {
        usize::from(self.event_len.get())
    }

    /// Length of the sender id.
    pub fn sender_len(&self) -> usize {
        usize::from(self.sender_len.get())
    }

    /// Per-sender sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence.get()
    }

    /// Sender timestamp, unix seconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp.get()
    }

    /// Payload length as carried on the wire (compressed if flagged).
    pub fn payload_len(&self) -> usize {
        self.payload_len.get() as usize
    }

    /// Total envelope length implied by this header.
    pub fn frame_len(&self) -> usize {
        Self::SIZE + self.event_len() + self.sender_len() + self.payload_len()
    }
}

//! Header flag bits.

use bitflags::bitflags;

bitflags! {
    /// Per-frame flags carried in the header.
    ///
    /// Decoding rejects unknown bits rather than ignoring them, so a peer
    /// speaking a newer dialect fails loudly instead of being misread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u8 {
        /// Payload is gzip-compressed on the wire.
        const COMPRESSED = 0b0000_0001;
    }
}

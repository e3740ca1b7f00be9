//! Property tests for the frame codec.
//!
//! - Round-trip: decode(encode(f)) == f for every valid frame, with and
//!   without compression.
//! - Decoding arbitrary bytes never panics.

use bytes::Bytes;
use proptest::prelude::*;
use skein_proto::{Frame, FrameCodec, MAX_FIELD_LEN};

fn arb_field() -> impl Strategy<Value = String> {
    "\\PC{0,40}".prop_filter("fits on the wire", |s: &String| s.len() <= MAX_FIELD_LEN)
}

fn arb_frame() -> impl Strategy<Value = Frame> {
    (
        arb_field(),
        arb_field(),
        any::<u64>(),
        any::<i64>(),
        proptest::collection::vec(any::<u8>(), 0..2048),
    )
        .prop_map(|(event, sender, sequence, timestamp, payload)| {
            Frame::new(event, sender, sequence, timestamp, Bytes::from(payload))
        })
}

proptest! {
    #[test]
    fn roundtrip_plain(frame in arb_frame()) {
        let codec = FrameCodec::new();
        let wire = codec.encode(&frame).unwrap();
        prop_assert_eq!(codec.decode(&wire).unwrap(), frame);
    }

    #[test]
    fn roundtrip_compressed(frame in arb_frame(), threshold in 0usize..512) {
        let codec = FrameCodec::with_compression(threshold);
        let wire = codec.encode(&frame).unwrap();
        prop_assert_eq!(codec.decode(&wire).unwrap(), frame);
    }

    #[test]
    fn encoding_is_deterministic(frame in arb_frame()) {
        let codec = FrameCodec::with_compression(128);
        prop_assert_eq!(codec.encode(&frame).unwrap(), codec.encode(&frame).unwrap());
    }

    #[test]
    fn decode_arbitrary_bytes_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = Frame::decode(&bytes);
    }

    #[test]
    fn decode_mutated_frame_never_panics(
        frame in arb_frame(),
        index in any::<prop::sample::Index>(),
        byte in any::<u8>(),
    ) {
        let mut wire = FrameCodec::new().encode(&frame).unwrap().to_vec();
        let i = index.index(wire.len());
        wire[i] = byte;
        let _ = Frame::decode(&wire);
    }
}

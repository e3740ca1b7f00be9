//! Arbitrary bytes through the frame codec.
//!
//! Decoding must never panic, and anything that decodes must re-encode to a
//! message that decodes to the same frame.

#![no_main]

use libfuzzer_sys::fuzz_target;
use skein_proto::{Frame, FrameCodec};

fuzz_target!(|data: &[u8]| {
    let codec = FrameCodec::with_compression(0);
    let Ok(frame) = codec.decode(data) else {
        return;
    };

    let encoded = codec.encode(&frame).expect("decoded frame re-encodes");
    let again: Frame = codec.decode(&encoded).expect("re-encoded frame decodes");
    assert_eq!(again, frame);
});

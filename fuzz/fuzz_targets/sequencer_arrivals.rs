//! Arbitrary arrival orders through the reorder buffer.
//!
//! Whatever arrives, each sender's deliveries are consecutive and
//! the pending set stays within its bound.

#![no_main]

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use skein_core::{Sequencer, SequencerConfig};
use skein_proto::Frame;

const SENDERS: [&str; 3] = ["a", "b", "c"];

fuzz_target!(|data: &[u8]| {
    let config = SequencerConfig { max_buffer: 8, max_wait: Duration::from_millis(500) };
    let mut sequencer = Sequencer::new(config);
    let start = Instant::now();
    let mut elapsed = Duration::ZERO;
    let mut last: HashMap<String, u64> = HashMap::new();

    for chunk in data.chunks_exact(3) {
        let sender = SENDERS[usize::from(chunk[0]) % SENDERS.len()];
        let sequence = u64::from(chunk[1] % 32);
        elapsed += Duration::from_millis(u64::from(chunk[2]));

        let frame = Frame::new("fuzz", sender, sequence, 0, Bytes::new());
        let observation = sequencer.observe(frame, start + elapsed);

        for delivered in observation.deliver {
            let previous = last.entry(delivered.sender_id.clone()).or_default();
            assert_eq!(delivered.sequence, *previous + 1);
            *previous = delivered.sequence;
        }
        assert!(sequencer.pending_len(sender) <= config.max_buffer);
    }
});

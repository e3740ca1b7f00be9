//! Ordering properties of the reorder buffer.

use std::time::{Duration, Instant};

use bytes::Bytes;
use proptest::prelude::*;
use skein_core::{GapReason, Sequencer, SequencerConfig};
use skein_proto::Frame;

fn frame(sender: &str, sequence: u64) -> Frame {
    Frame::new("chat", sender, sequence, 0, Bytes::new())
}

fn arb_permutation(max: u64) -> impl Strategy<Value = Vec<u64>> {
    (1..=max).prop_flat_map(|n| Just((1..=n).collect::<Vec<_>>()).prop_shuffle())
}

proptest! {
    /// Any arrival order of 1..=n is delivered as exactly 1..=n.
    #[test]
    fn any_permutation_delivered_in_order(order in arb_permutation(64)) {
        let mut sequencer = Sequencer::default();
        let now = Instant::now();
        let mut delivered = Vec::new();

        for &s in &order {
            let observation = sequencer.observe(frame("a", s), now);
            prop_assert!(observation.lost.is_empty());
            delivered.extend(observation.deliver.into_iter().map(|f| f.sequence));
        }

        let expected: Vec<u64> = (1..=order.len() as u64).collect();
        prop_assert_eq!(delivered, expected);
        prop_assert_eq!(sequencer.pending_len("a"), 0);
    }

    /// Replaying any arrivals a second time delivers nothing new.
    #[test]
    fn duplicates_are_idempotent(order in arb_permutation(32), replay in prop::collection::vec(1u64..=32, 0..64)) {
        let mut sequencer = Sequencer::default();
        let now = Instant::now();
        let mut delivered = Vec::new();

        for &s in &order {
            delivered.extend(sequencer.observe(frame("a", s), now).deliver.into_iter().map(|f| f.sequence));
        }
        for s in replay {
            if s <= order.len() as u64 {
                prop_assert!(sequencer.observe(frame("a", s), now).deliver.is_empty());
            }
        }

        prop_assert_eq!(delivered.len(), order.len());
    }

    /// Interleaved senders keep their own order independently.
    #[test]
    fn senders_ordered_independently(a in arb_permutation(20), b in arb_permutation(20), picks in prop::collection::vec(any::<bool>(), 40)) {
        let mut sequencer = Sequencer::default();
        let now = Instant::now();
        let (mut a_iter, mut b_iter) = (a.iter(), b.iter());
        let (mut got_a, mut got_b) = (Vec::new(), Vec::new());
        let mut picks = picks.into_iter().cycle();

        loop {
            let next = if picks.next().unwrap_or(true) {
                a_iter.next().map(|&s| ("a", s)).or_else(|| b_iter.next().map(|&s| ("b", s)))
            } else {
                b_iter.next().map(|&s| ("b", s)).or_else(|| a_iter.next().map(|&s| ("a", s)))
            };
            let Some((sender, s)) = next else { break };
            for f in sequencer.observe(frame(sender, s), now).deliver {
                if f.sender_id == "a" { got_a.push(f.sequence) } else { got_b.push(f.sequence) }
            }
        }

        prop_assert_eq!(got_a, (1..=a.len() as u64).collect::<Vec<_>>());
        prop_assert_eq!(got_b, (1..=b.len() as u64).collect::<Vec<_>>());
    }

    /// Pending never exceeds max_buffer, whatever arrives.
    #[test]
    fn pending_bounded(max_buffer in 1usize..16, arrivals in prop::collection::vec(2u64..200, 0..200)) {
        let mut sequencer = Sequencer::new(SequencerConfig { max_buffer, max_wait: Duration::from_secs(60) });
        let now = Instant::now();
        for s in arrivals {
            let observation = sequencer.observe(frame("a", s), now);
            prop_assert!(observation.lost.iter().all(|l| l.reason == GapReason::Overflow));
            prop_assert!(sequencer.pending_len("a") <= max_buffer);
        }
    }
}

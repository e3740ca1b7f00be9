//! Per-sender reorder buffer.
//!
//! Each sender numbers its frames 1, 2, 3, ... The sequencer delivers a
//! sender's frames strictly in that order, holding early arrivals until the
//! hole in front of them fills. There is no ordering across senders.
//!
//! # Bounds
//!
//! Memory is bounded per sender by `max_buffer`: when the pending set grows
//! past it the frame with the largest sequence is evicted. Time is bounded by
//! `max_wait`: a pending frame that has waited longer is dropped. Both report
//! a [`GapLoss`]. A hole that never fills stalls the sender until the caller
//! skips it with [`Sequencer::resync`].
//!
//! The sequencer is a plain state machine: it takes `now` as a parameter and
//! is owned by a single task, so it needs no lock.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    time::{Duration, Instant},
};

use serde::Deserialize;
use skein_proto::Frame;

/// Reorder buffer bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SequencerConfig {
    /// Maximum pending frames per sender
    pub max_buffer: usize,
    /// Maximum time a frame may wait for its predecessors
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self { max_buffer: 1000, max_wait: Duration::from_secs(5) }
    }
}

/// Why a pending frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapReason {
    /// Evicted because the pending set exceeded `max_buffer`.
    Overflow,
    /// Waited longer than `max_wait`.
    Expired,
}

impl fmt::Display for GapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow => f.write_str("buffer overflow"),
            Self::Expired => f.write_str("wait expired"),
        }
    }
}

/// A frame the sequencer gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapLoss {
    /// Sender of the dropped frame
    pub sender_id: String,
    /// Sequence of the dropped frame
    pub sequence: u64,
    /// Sequence the sender was waiting for at the time
    pub expected: u64,
    /// Why it was dropped
    pub reason: GapReason,
}

impl fmt::Display for GapLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dropped {}#{} ({}) while waiting for #{}",
            self.sender_id, self.sequence, self.reason, self.expected
        )
    }
}

/// Result of feeding one frame to the sequencer.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Observation {
    /// Frames now ready, in delivery order
    pub deliver: Vec<Frame>,
    /// Pending frames dropped during this call
    pub lost: Vec<GapLoss>,
}

#[derive(Debug)]
struct Pending {
    frame: Frame,
    arrived: Instant,
}

#[derive(Debug, Default)]
struct SenderState {
    last_delivered: u64,
    pending: BTreeMap<u64, Pending>,
}

impl SenderState {
    fn expected(&self) -> u64 {
        self.last_delivered.saturating_add(1)
    }

    fn drain_ready(&mut self, deliver: &mut Vec<Frame>) {
        loop {
            let expected = self.expected();
            let Some(entry) = self.pending.first_entry() else {
                break;
            };
            if *entry.key() != expected {
                break;
            }
            let (sequence, pending) = entry.remove_entry();
            self.last_delivered = sequence;
            deliver.push(pending.frame);
        }
    }

    fn expire(&mut self, sender_id: &str, now: Instant, max_wait: Duration, lost: &mut Vec<GapLoss>) {
        let expected = self.expected();
        self.pending.retain(|&sequence, pending| {
            let keep = now.saturating_duration_since(pending.arrived) <= max_wait;
            if !keep {
                lost.push(GapLoss {
                    sender_id: sender_id.to_owned(),
                    sequence,
                    expected,
                    reason: GapReason::Expired,
                });
            }
            keep
        });
    }

    fn enforce_bound(&mut self, sender_id: &str, max_buffer: usize, lost: &mut Vec<GapLoss>) {
        while self.pending.len() > max_buffer {
            let Some((sequence, _)) = self.pending.pop_last() else {
                break;
            };
            lost.push(GapLoss {
                sender_id: sender_id.to_owned(),
                sequence,
                expected: self.expected(),
                reason: GapReason::Overflow,
            });
        }
    }
}

/// Per-sender reorder buffer.
#[derive(Debug, Default)]
pub struct Sequencer {
    config: SequencerConfig,
    senders: HashMap<String, SenderState>,
}

impl Sequencer {
    /// Create an empty sequencer.
    pub fn new(config: SequencerConfig) -> Self {
        Self { config, senders: HashMap::new() }
    }

    /// Active bounds.
    pub fn config(&self) -> SequencerConfig {
        self.config
    }

    /// Feed one validated frame received at `now`.
    ///
    /// A frame at or below the sender's last delivered sequence is a
    /// duplicate or replay and is discarded without touching any state.
    pub fn observe(&mut self, frame: Frame, now: Instant) -> Observation {
        let mut observation = Observation::default();

        let last = self.senders.get(&frame.sender_id).map_or(0, |s| s.last_delivered);
        if frame.sequence <= last {
            return observation;
        }

        let SequencerConfig { max_buffer, max_wait } = self.config;
        let sender_id = frame.sender_id.clone();
        let state = self.senders.entry(sender_id.clone()).or_default();

        state.expire(&sender_id, now, max_wait, &mut observation.lost);

        if frame.sequence == state.expected() {
            state.last_delivered = frame.sequence;
            observation.deliver.push(frame);
        } else {
            state.pending.insert(frame.sequence, Pending { frame, arrived: now });
            state.enforce_bound(&sender_id, max_buffer, &mut observation.lost);
        }

        state.drain_ready(&mut observation.deliver);
        observation
    }

    /// Drop expired pending frames across all senders.
    pub fn sweep(&mut self, now: Instant) -> Vec<GapLoss> {
        let max_wait = self.config.max_wait;
        let mut lost = Vec::new();
        for (sender_id, state) in &mut self.senders {
            state.expire(sender_id, now, max_wait, &mut lost);
        }
        lost
    }

    /// Treat everything up to `last_delivered` as delivered for `sender_id`.
    ///
    /// Pending frames at or below the new mark are discarded; frames that
    /// become contiguous are returned in order. A mark at or below the
    /// current one changes nothing.
    pub fn resync(&mut self, sender_id: &str, last_delivered: u64) -> Vec<Frame> {
        let mut deliver = Vec::new();
        let state = self.senders.entry(sender_id.to_owned()).or_default();
        if last_delivered <= state.last_delivered {
            return deliver;
        }

        state.last_delivered = last_delivered;
        state.pending = state.pending.split_off(&last_delivered.saturating_add(1));
        state.drain_ready(&mut deliver);
        deliver
    }

    /// Discard all state for `sender_id`. Returns whether it was known.
    pub fn forget(&mut self, sender_id: &str) -> bool {
        self.senders.remove(sender_id).is_some()
    }

    /// Highest sequence delivered for `sender_id`, 0 if none.
    pub fn last_delivered(&self, sender_id: &str) -> u64 {
        self.senders.get(sender_id).map_or(0, |s| s.last_delivered)
    }

    /// Number of frames waiting for `sender_id`.
    pub fn pending_len(&self, sender_id: &str) -> usize {
        self.senders.get(sender_id).map_or(0, |s| s.pending.len())
    }

    /// Number of senders with state.
    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn frame(sender: &str, sequence: u64) -> Frame {
        Frame::new("chat", sender, sequence, 0, Bytes::from(sequence.to_be_bytes().to_vec()))
    }

    fn sequences(frames: &[Frame]) -> Vec<u64> {
        frames.iter().map(|f| f.sequence).collect()
    }

    #[test]
    fn in_order_frames_delivered_immediately() {
        let mut seq = Sequencer::default();
        let now = Instant::now();
        for s in 1..=3 {
            let obs = seq.observe(frame("a", s), now);
            assert_eq!(sequences(&obs.deliver), vec![s]);
        }
        assert_eq!(seq.last_delivered("a"), 3);
    }

    #[test]
    fn early_frames_held_until_gap_fills() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let now = Instant::now();

        assert!(seq.observe(frame("a", 3), now).deliver.is_empty());
        assert!(seq.observe(frame("a", 2), now).deliver.is_empty());
        assert_eq!(seq.pending_len("a"), 2);

        let obs = seq.observe(frame("a", 1), now);
        assert_eq!(sequences(&obs.deliver), vec![1, 2, 3]);
        assert_eq!(seq.pending_len("a"), 0);
    }

    #[test]
    fn duplicate_of_delivered_frame_ignored() {
        let mut seq = Sequencer::default();
        let now = Instant::now();
        seq.observe(frame("a", 1), now);
        let obs = seq.observe(frame("a", 1), now);
        assert_eq!(obs, Observation::default());
        assert_eq!(seq.last_delivered("a"), 1);
    }

    #[test]
    fn stale_frame_from_unknown_sender_creates_no_state() {
        let mut seq = Sequencer::default();
        let obs = seq.observe(frame("ghost", 0), Instant::now());
        assert!(obs.deliver.is_empty());
        assert_eq!(seq.sender_count(), 0);
    }

    #[test]
    fn duplicate_pending_frame_overwrites() {
        let mut seq = Sequencer::default();
        let now = Instant::now();
        seq.observe(frame("a", 2), now);
        let mut replacement = frame("a", 2);
        replacement.payload = Bytes::from_static(b"new");
        seq.observe(replacement, now);
        assert_eq!(seq.pending_len("a"), 1);

        let obs = seq.observe(frame("a", 1), now);
        assert_eq!(obs.deliver[1].payload, Bytes::from_static(b"new"));
    }

    #[test]
    fn senders_are_independent() {
        let mut seq = Sequencer::default();
        let now = Instant::now();
        assert!(seq.observe(frame("a", 2), now).deliver.is_empty());
        assert_eq!(sequences(&seq.observe(frame("b", 1), now).deliver), vec![1]);
        assert_eq!(seq.pending_len("a"), 1);
    }

    #[test]
    fn overflow_evicts_largest_sequence() {
        let mut seq = Sequencer::new(SequencerConfig { max_buffer: 2, ..Default::default() });
        let now = Instant::now();
        seq.observe(frame("a", 3), now);
        seq.observe(frame("a", 5), now);
        let obs = seq.observe(frame("a", 4), now);

        assert_eq!(obs.lost, vec![GapLoss {
            sender_id: "a".into(),
            sequence: 5,
            expected: 1,
            reason: GapReason::Overflow,
        }]);
        assert_eq!(seq.pending_len("a"), 2);
    }

    #[test]
    fn incoming_frame_larger_than_buffer_is_evicted_itself() {
        let mut seq = Sequencer::new(SequencerConfig { max_buffer: 1, ..Default::default() });
        let now = Instant::now();
        seq.observe(frame("a", 2), now);
        let obs = seq.observe(frame("a", 9), now);
        assert_eq!(obs.lost.len(), 1);
        assert_eq!(obs.lost[0].sequence, 9);
    }

    #[test]
    fn expired_frames_dropped_on_observe() {
        let config = SequencerConfig { max_wait: Duration::from_secs(5), ..Default::default() };
        let mut seq = Sequencer::new(config);
        let t0 = Instant::now();
        seq.observe(frame("a", 3), t0);

        let obs = seq.observe(frame("a", 1), t0 + Duration::from_secs(6));
        assert_eq!(sequences(&obs.deliver), vec![1]);
        assert_eq!(obs.lost.len(), 1);
        assert_eq!(obs.lost[0].reason, GapReason::Expired);
        assert_eq!(seq.pending_len("a"), 0);
    }

    #[test]
    fn frame_at_exact_max_wait_is_kept() {
        let mut seq = Sequencer::default();
        let t0 = Instant::now();
        seq.observe(frame("a", 2), t0);
        let obs = seq.observe(frame("a", 1), t0 + Duration::from_secs(5));
        assert_eq!(sequences(&obs.deliver), vec![1, 2]);
        assert!(obs.lost.is_empty());
    }

    #[test]
    fn sweep_expires_across_senders() {
        let mut seq = Sequencer::default();
        let t0 = Instant::now();
        seq.observe(frame("a", 2), t0);
        seq.observe(frame("b", 4), t0);

        assert!(seq.sweep(t0 + Duration::from_secs(1)).is_empty());
        let mut lost = seq.sweep(t0 + Duration::from_secs(10));
        lost.sort_by(|x, y| x.sender_id.cmp(&y.sender_id));
        assert_eq!(lost.len(), 2);
        assert_eq!(lost[0].sender_id, "a");
        assert_eq!(lost[1].sender_id, "b");
    }

    #[test]
    fn resync_skips_hole_and_drains() {
        let mut seq = Sequencer::default();
        let now = Instant::now();
        seq.observe(frame("a", 3), now);
        seq.observe(frame("a", 4), now);
        seq.observe(frame("a", 7), now);

        let delivered = seq.resync("a", 2);
        assert_eq!(sequences(&delivered), vec![3, 4]);
        assert_eq!(seq.last_delivered("a"), 4);
        assert_eq!(seq.pending_len("a"), 1);
    }

    #[test]
    fn resync_discards_pending_below_mark() {
        let mut seq = Sequencer::default();
        let now = Instant::now();
        seq.observe(frame("a", 3), now);
        seq.observe(frame("a", 6), now);

        assert!(seq.resync("a", 4).is_empty());
        assert_eq!(seq.pending_len("a"), 1);
        assert!(seq.resync("a", 1).is_empty());
        assert_eq!(seq.last_delivered("a"), 4);
    }

    #[test]
    fn forget_resets_sender() {
        let mut seq = Sequencer::default();
        let now = Instant::now();
        seq.observe(frame("a", 1), now);
        assert!(seq.forget("a"));
        assert!(!seq.forget("a"));
        assert_eq!(sequences(&seq.observe(frame("a", 1), now).deliver), vec![1]);
    }
}

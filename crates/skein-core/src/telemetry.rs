//! Observability sink.
//!
//! The session reports what happens to every message as a
//! [`TelemetryEvent`]. A [`Telemetry`] implementation decides what to do with
//! them (export metrics, record for tests, nothing). Every session also keeps
//! its own [`SessionStats`] counters regardless of the configured sink.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{breaker::CircuitState, error::ErrorKind, sequencer::GapLoss};

/// Something observable happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// Frame written to the transport
    MessageSent {
        /// Encoded size
        bytes: usize,
    },
    /// Message read from the transport, before decoding
    MessageReceived {
        /// Raw size
        bytes: usize,
    },
    /// Frame handed to its handler successfully
    MessageDispatched,
    /// A frame or operation failed
    Error {
        /// Failure category
        kind: ErrorKind,
    },
    /// Circuit breaker changed state
    BreakerTransition {
        /// Previous state
        from: CircuitState,
        /// New state
        to: CircuitState,
    },
    /// Sequencer dropped a pending frame.
    ///
    /// Carries the sender and the sequence it is stuck on, enough to ask the
    /// peer for a retransmission or to skip the hole with
    /// [`Session::resync`](crate::Session::resync).
    GapLoss(GapLoss),
}

/// Receiver of [`TelemetryEvent`]s. Called inline, so keep it cheap.
pub trait Telemetry: Send + Sync {
    /// Record one event.
    fn record(&self, event: &TelemetryEvent);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn record(&self, _event: &TelemetryEvent) {}
}

/// Built-in per-session counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_dispatched: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
    gap_losses: AtomicU64,
    breaker_transitions: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames written
    pub messages_sent: u64,
    /// Messages read
    pub messages_received: u64,
    /// Frames handled successfully
    pub messages_dispatched: u64,
    /// Bytes written
    pub bytes_sent: u64,
    /// Bytes read
    pub bytes_received: u64,
    /// Errors of any kind
    pub errors: u64,
    /// Frames dropped by the sequencer
    pub gap_losses: u64,
    /// Breaker state changes
    pub breaker_transitions: u64,
}

impl SessionStats {
    /// Copy the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            gap_losses: self.gap_losses.load(Ordering::Relaxed),
            breaker_transitions: self.breaker_transitions.load(Ordering::Relaxed),
        }
    }
}

impl Telemetry for SessionStats {
    fn record(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::MessageSent { bytes } => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(*bytes as u64, Ordering::Relaxed);
            },
            TelemetryEvent::MessageReceived { bytes } => {
                self.messages_received.fetch_add(1, Ordering::Relaxed);
                self.bytes_received.fetch_add(*bytes as u64, Ordering::Relaxed);
            },
            TelemetryEvent::MessageDispatched => {
                self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
            },
            TelemetryEvent::Error { .. } => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            },
            TelemetryEvent::BreakerTransition { .. } => {
                self.breaker_transitions.fetch_add(1, Ordering::Relaxed);
            },
            TelemetryEvent::GapLoss(_) => {
                self.gap_losses.fetch_add(1, Ordering::Relaxed);
            },
        }
    }
}

/// Fans events out to the session's own counters and the user's sink.
#[derive(Clone)]
pub(crate) struct Recorder {
    stats: Arc<SessionStats>,
    sink: Arc<dyn Telemetry>,
}

impl Recorder {
    pub(crate) fn new(sink: Arc<dyn Telemetry>) -> Self {
        Self { stats: Arc::new(SessionStats::default()), sink }
    }

    pub(crate) fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub(crate) fn error(&self, kind: ErrorKind) {
        self.record(&TelemetryEvent::Error { kind });
    }
}

impl Telemetry for Recorder {
    fn record(&self, event: &TelemetryEvent) {
        self.stats.record(event);
        self.sink.record(event);
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder").field("stats", &self.stats.snapshot()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::GapReason;

    #[test]
    fn stats_count_by_event() {
        let stats = SessionStats::default();
        stats.record(&TelemetryEvent::MessageSent { bytes: 40 });
        stats.record(&TelemetryEvent::MessageSent { bytes: 2 });
        stats.record(&TelemetryEvent::MessageReceived { bytes: 7 });
        stats.record(&TelemetryEvent::Error { kind: ErrorKind::RateLimited });
        stats.record(&TelemetryEvent::GapLoss(GapLoss {
            sender_id: "peer".into(),
            sequence: 4,
            expected: 2,
            reason: GapReason::Expired,
        }));

        let snap = stats.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_sent, 42);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.bytes_received, 7);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.gap_losses, 1);
        assert_eq!(snap.messages_dispatched, 0);
    }

    #[test]
    fn recorder_feeds_stats_and_sink() {
        let sink = Arc::new(SessionStats::default());
        let recorder = Recorder::new(sink.clone());
        recorder.error(ErrorKind::Transport);
        recorder.record(&TelemetryEvent::MessageDispatched);

        assert_eq!(recorder.stats().snapshot(), sink.snapshot());
        assert_eq!(sink.snapshot().errors, 1);
    }
}

//! Telemetry sink that remembers everything.

use std::sync::{Mutex, PoisonError};

use skein_core::{CircuitState, ErrorKind, GapLoss, Telemetry, TelemetryEvent};

/// Records every event for later assertions.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far, in order.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Errors of `kind` recorded so far.
    pub fn errors(&self, kind: ErrorKind) -> usize {
        self.count(|event| *event == TelemetryEvent::Error { kind })
    }

    /// Breaker transitions in order.
    pub fn transitions(&self) -> Vec<(CircuitState, CircuitState)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TelemetryEvent::BreakerTransition { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    /// Gap losses in order.
    pub fn gap_losses(&self) -> Vec<GapLoss> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TelemetryEvent::GapLoss(loss) => Some(loss),
                _ => None,
            })
            .collect()
    }

    /// Events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&TelemetryEvent) -> bool) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).iter().filter(|e| predicate(e)).count()
    }
}

impl Telemetry for RecordingTelemetry {
    fn record(&self, event: &TelemetryEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event.clone());
    }
}

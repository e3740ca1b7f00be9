//! Inbound half of a session.

use std::{io, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{sync::mpsc, time::MissedTickBehavior};

use super::{SessionExit, Shared, workers::SenderWorkers};
use crate::{
    env::Environment,
    error::{ErrorKind, SessionError},
    sequencer::{GapLoss, Sequencer},
    telemetry::{Telemetry, TelemetryEvent},
    transport::Transport,
};

/// Requests from the session handle to the receive task.
#[derive(Debug)]
pub(super) enum Control {
    /// Skip everything up to `last_delivered` for `sender_id`.
    Resync { sender_id: String, last_delivered: u64 },
}

enum Step {
    Shutdown,
    Sweep,
    Control(Option<Control>),
    Received(io::Result<Option<Bytes>>),
}

/// Owns the sequencer; the only task that touches it.
pub(super) struct ReceiveLoop<T, E: Environment> {
    pub(super) shared: Arc<Shared<T, E>>,
    pub(super) sequencer: Sequencer,
    pub(super) workers: SenderWorkers<E>,
    pub(super) control: mpsc::UnboundedReceiver<Control>,
    pub(super) sweep_interval: Duration,
    pub(super) drain_timeout: Duration,
}

impl<T: Transport, E: Environment> ReceiveLoop<T, E> {
    pub(super) async fn run(mut self) -> SessionExit {
        let shared = Arc::clone(&self.shared);
        let start = tokio::time::Instant::now() + self.sweep_interval;
        let mut sweep = tokio::time::interval_at(start, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            let step = tokio::select! {
                biased;
                () = shared.shutdown.cancelled() => Step::Shutdown,
                _ = sweep.tick() => Step::Sweep,
                control = self.control.recv() => Step::Control(control),
                received = shared.transport.receive() => Step::Received(received),
            };

            match step {
                Step::Shutdown | Step::Control(None) => {
                    break shared.write_failure.get().cloned().unwrap_or(SessionExit::Closed);
                },
                Step::Sweep => {
                    let lost = self.sequencer.sweep(shared.env.now());
                    self.report_losses(lost);
                },
                Step::Control(Some(Control::Resync { sender_id, last_delivered })) => {
                    self.resync(&sender_id, last_delivered);
                },
                Step::Received(Ok(Some(message))) => self.handle(&message),
                Step::Received(Ok(None)) => break SessionExit::PeerClosed,
                Step::Received(Err(error)) => {
                    tracing::error!(session = %shared.sender_id, %error, "transport read failed");
                    shared.recorder.error(ErrorKind::Transport);
                    break SessionExit::TransportFailed { kind: error.kind(), message: error.to_string() };
                },
            }
        };

        shared.closed.store(true, std::sync::atomic::Ordering::Release);
        shared.shutdown.cancel();
        self.workers.shutdown(self.drain_timeout).await;
        if let Err(error) = shared.transport.close().await {
            tracing::debug!(session = %shared.sender_id, %error, "transport close failed");
        }

        tracing::info!(session = %shared.sender_id, ?exit, "session ended");
        exit
    }

    fn handle(&mut self, message: &Bytes) {
        let shared = Arc::clone(&self.shared);
        shared.recorder.record(&TelemetryEvent::MessageReceived { bytes: message.len() });

        let frame = match shared.codec.decode(message) {
            Ok(frame) => frame,
            Err(error) => {
                let error = SessionError::from(error);
                tracing::warn!(session = %shared.sender_id, %error, len = message.len(), "dropping undecodable message");
                shared.recorder.error(error.kind());
                return;
            },
        };

        if let Err(error) = shared.validator.validate(&frame, shared.env.unix_time()) {
            tracing::warn!(
                session = %shared.sender_id,
                sender = %frame.sender_id,
                sequence = frame.sequence,
                event = %frame.event,
                %error,
                "dropping invalid frame"
            );
            shared.recorder.error(error.kind());
            return;
        }

        let observation = self.sequencer.observe(frame, shared.env.now());
        self.report_losses(observation.lost);
        for frame in observation.deliver {
            self.workers.deliver(frame);
        }
    }

    fn resync(&mut self, sender_id: &str, last_delivered: u64) {
        let ready = self.sequencer.resync(sender_id, last_delivered);
        tracing::info!(
            session = %self.shared.sender_id,
            sender = %sender_id,
            last_delivered,
            released = ready.len(),
            "sender resynced"
        );
        for frame in ready {
            self.workers.deliver(frame);
        }
    }

    fn report_losses(&self, lost: Vec<GapLoss>) {
        for loss in lost {
            self.shared.recorder.record(&TelemetryEvent::GapLoss(loss.clone()));
            let error = SessionError::GapLoss(loss);
            tracing::warn!(session = %self.shared.sender_id, %error, "sequencer dropped frame");
        }
    }
}

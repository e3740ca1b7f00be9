//! Per-sender dispatch workers.
//!
//! Each sender gets a bounded queue and one task draining it, so its handlers
//! run one at a time in delivery order while other senders proceed
//! independently. Handing a frame to a worker never waits: a frame that finds
//! its sender's queue full is dropped and reported, so a stuck handler costs
//! only its own sender. The per-sender inbound rate limit is applied here,
//! ahead of the handler, for the same reason.
//!
//! A panicking handler is caught and counted; the worker moves on to the next
//! queued frame.

use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use skein_proto::Frame;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    dispatch::Dispatcher,
    env::Environment,
    error::{ErrorKind, SessionError},
    limiter::KeyedLimiter,
    telemetry::{Recorder, Telemetry, TelemetryEvent},
};

pub(super) struct SenderWorkers<E: Environment> {
    dispatcher: Arc<Dispatcher>,
    recorder: Recorder,
    limiter: Option<Arc<KeyedLimiter<E>>>,
    queue_depth: usize,
    queues: HashMap<String, mpsc::Sender<Frame>>,
    tasks: JoinSet<()>,
    /// Cancels limiter waits once the drain deadline passes.
    halt: CancellationToken,
}

impl<E: Environment> SenderWorkers<E> {
    pub(super) fn new(
        dispatcher: Arc<Dispatcher>,
        recorder: Recorder,
        limiter: Option<KeyedLimiter<E>>,
        queue_depth: usize,
    ) -> Self {
        Self {
            dispatcher,
            recorder,
            limiter: limiter.map(Arc::new),
            queue_depth,
            queues: HashMap::new(),
            tasks: JoinSet::new(),
            halt: CancellationToken::new(),
        }
    }

    /// Queue `frame` behind its sender's earlier frames. Never waits.
    pub(super) fn deliver(&mut self, frame: Frame) {
        if !self.dispatcher.contains(&frame.event) {
            let error = SessionError::HandlerNotFound(frame.event.clone());
            tracing::warn!(sender = %frame.sender_id, sequence = frame.sequence, %error, "dropping frame");
            self.recorder.error(error.kind());
            return;
        }

        let frame = match self.queue(&frame.sender_id).try_send(frame) {
            Ok(()) => return,
            Err(TrySendError::Full(frame)) => {
                tracing::warn!(
                    sender = %frame.sender_id,
                    sequence = frame.sequence,
                    depth = self.queue_depth,
                    "dispatch queue full, dropping frame"
                );
                self.recorder.error(ErrorKind::Overloaded);
                return;
            },
            Err(TrySendError::Closed(frame)) => frame,
        };

        // Worker is gone; start a fresh one for this sender.
        tracing::warn!(sender = %frame.sender_id, "dispatch worker gone, restarting");
        self.queues.remove(&frame.sender_id);
        if self.queue(&frame.sender_id).try_send(frame).is_err() {
            self.recorder.error(ErrorKind::Handler);
        }
    }

    /// Close every queue and give the workers `grace` to drain them, then
    /// abort whatever is still running.
    pub(super) async fn shutdown(mut self, grace: Duration) {
        self.queues.clear();

        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = self.tasks.join_next().await {
                if let Err(error) = joined {
                    tracing::warn!(%error, "dispatch worker failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(remaining = self.tasks.len(), ?grace, "handlers still busy, aborting dispatch workers");
            self.halt.cancel();
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }

    fn queue(&mut self, sender_id: &str) -> mpsc::Sender<Frame> {
        if let Some(queue) = self.queues.get(sender_id) {
            return queue.clone();
        }

        let (queue, frames) = mpsc::channel::<Frame>(self.queue_depth);
        self.tasks.spawn(run_worker(
            Arc::clone(&self.dispatcher),
            self.recorder.clone(),
            self.limiter.clone(),
            self.halt.clone(),
            frames,
        ));

        self.queues.insert(sender_id.to_owned(), queue.clone());
        queue
    }
}

async fn run_worker<E: Environment>(
    dispatcher: Arc<Dispatcher>,
    recorder: Recorder,
    limiter: Option<Arc<KeyedLimiter<E>>>,
    halt: CancellationToken,
    mut frames: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = frames.recv().await {
        let (sender, sequence) = (frame.sender_id.clone(), frame.sequence);

        if let Some(limiter) = &limiter
            && limiter.acquire(&sender, &halt).await.is_err()
        {
            return;
        }

        match AssertUnwindSafe(dispatcher.dispatch(frame)).catch_unwind().await {
            Ok(Ok(())) => recorder.record(&TelemetryEvent::MessageDispatched),
            Ok(Err(error)) => {
                tracing::warn!(%sender, sequence, %error, "handler failed");
                recorder.error(error.kind());
            },
            Err(_) => {
                tracing::error!(%sender, sequence, "handler panicked");
                recorder.error(ErrorKind::Handler);
            },
        }
    }
}

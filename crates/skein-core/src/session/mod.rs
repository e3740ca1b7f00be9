//! One connection's worth of messaging.
//!
//! A [`Session`] owns a transport and runs two paths over it.
//!
//! # Inbound
//!
//! A background task reads messages, decodes and validates them, puts each
//! sender's frames back in order and hands them to that sender's dispatch
//! worker. Handlers for one sender run one at a time in sequence order;
//! different senders run concurrently, and a slow handler never holds up the
//! read loop. A bad frame is logged and dropped.
//! A transport read failure, a graceful peer close or a connection-level
//! write failure ends the task.
//!
//! A frame the reorder buffer gives up on is reported as
//! [`TelemetryEvent::GapLoss`]. The hole stays open, holding back that
//! sender's later frames, until the peer retransmits it or the caller skips
//! it with [`Session::resync`].
//!
//! # Outbound
//!
//! [`Session::emit`] assigns the next sequence number, encodes the frame,
//! checks the outbound rate limit and writes it through the retrier and the
//! circuit breaker. Emits are serialized, so frames leave in sequence order.
//! A sequence number is used up once a write has been attempted; a frame
//! rejected before that (validation, encoding, rate limit, open circuit)
//! leaves no hole in the stream. Transient write errors are returned to the
//! caller and counted by the breaker; a write that finds the connection gone
//! (see [`is_connection_lost`]) also ends the session.

mod receive;
mod workers;

use std::{
    io,
    sync::{
        Arc,
        OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use serde::Serialize;
use skein_proto::{Frame, FrameCodec, encode_payload};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use self::{
    receive::{Control, ReceiveLoop},
    workers::SenderWorkers,
};
use crate::{
    breaker::{CircuitBreaker, CircuitState},
    config::{ConfigError, SessionConfig},
    dispatch::Dispatcher,
    env::Environment,
    error::{ErrorKind, RateLimited, SessionError},
    limiter::{KeyedLimiter, TokenBucket},
    retry::{RetryPolicy, with_retry},
    sequencer::Sequencer,
    telemetry::{Recorder, StatsSnapshot, Telemetry, TelemetryEvent},
    transport::Transport,
    validator::Validator,
};

/// Why a session's receive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// Closed locally via [`Session::close`] or by dropping the session.
    Closed,
    /// Peer closed the connection.
    PeerClosed,
    /// Transport read failed, or a write found the connection gone.
    TransportFailed {
        /// I/O error category
        kind: io::ErrorKind,
        /// Error text
        message: String,
    },
    /// Receive task panicked or was aborted.
    Aborted,
}

/// State shared between the session handle and its receive task.
struct Shared<T, E: Environment> {
    sender_id: String,
    transport: Arc<T>,
    env: E,
    codec: FrameCodec,
    validator: Validator,
    validate_outbound: bool,
    breaker: CircuitBreaker<E>,
    retry: RetryPolicy,
    limiter: Option<TokenBucket<E>>,
    /// Last sequence number a write was attempted with.
    last_sequence: AtomicU64,
    write_lock: Mutex<()>,
    closed: AtomicBool,
    /// Set by the first emit whose write found the connection gone.
    write_failure: OnceLock<SessionExit>,
    recorder: Recorder,
    shutdown: CancellationToken,
}

impl<T: Transport, E: Environment> Shared<T, E> {
    async fn emit(&self, event: &str, payload: Bytes) -> Result<u64, SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }

        let _write = self.write_lock.lock().await;
        let sequence = self.last_sequence.load(Ordering::Acquire) + 1;
        let frame = Frame::new(event, self.sender_id.as_str(), sequence, self.env.unix_time(), payload);

        if self.validate_outbound {
            self.validator.validate(&frame, self.env.unix_time())?;
        }

        let wire = self.codec.encode(&frame)?;

        if let Some(limiter) = &self.limiter
            && !limiter.take()
        {
            return Err(RateLimited.into());
        }

        let last_sequence = &self.last_sequence;
        let transport = &self.transport;
        let breaker = &self.breaker;
        let sent = with_retry(&self.retry, &self.env, &self.shutdown, || {
            let wire = wire.clone();
            breaker.execute(move || async move {
                last_sequence.store(sequence, Ordering::Release);
                transport.send(wire).await.map_err(SessionError::from)
            })
        })
        .await;

        if let Err(SessionError::Transport(error)) = &sent
            && is_connection_lost(error.kind())
        {
            self.fail_connection(error);
        }
        sent?;

        self.recorder.record(&TelemetryEvent::MessageSent { bytes: wire.len() });
        tracing::trace!(session = %self.sender_id, sequence, event, "frame sent");
        Ok(sequence)
    }
}

impl<T, E: Environment> Shared<T, E> {
    fn fail_connection(&self, error: &io::Error) {
        let exit = SessionExit::TransportFailed { kind: error.kind(), message: error.to_string() };
        if self.write_failure.set(exit).is_ok() {
            tracing::error!(session = %self.sender_id, %error, "transport write failed, ending session");
            self.closed.store(true, Ordering::Release);
            self.shutdown.cancel();
        }
    }
}

/// Whether a write error means the connection itself is gone rather than a
/// transient failure worth retrying later.
pub fn is_connection_lost(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::ConnectionAborted)
}

/// A running messaging session over one transport.
///
/// Dropping the session stops its receive loop; use [`Session::close`] to
/// also wait for in-flight handlers to finish.
pub struct Session<T: Transport, E: Environment> {
    shared: Arc<Shared<T, E>>,
    control: mpsc::UnboundedSender<Control>,
    receive: Option<JoinHandle<SessionExit>>,
    exit: Option<SessionExit>,
}

impl<T: Transport, E: Environment> Session<T, E> {
    /// Start a session over `transport`.
    ///
    /// Spawns the receive loop on the current tokio runtime.
    pub fn open(
        transport: Arc<T>,
        env: E,
        config: SessionConfig,
        dispatcher: Dispatcher,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let sender_id = config.sender_id.clone().unwrap_or_else(|| {
            let mut id = [0u8; 4];
            env.random_bytes(&mut id);
            hex::encode(id)
        });

        let recorder = Recorder::new(telemetry);
        let breaker = CircuitBreaker::new(config.breaker, env.clone())
            .with_telemetry(Arc::new(recorder.clone()));
        let codec = config.codec.compression_threshold.map_or_else(FrameCodec::new, FrameCodec::with_compression);
        let shutdown = CancellationToken::new();

        let shared = Arc::new(Shared {
            sender_id,
            transport,
            codec,
            validator: Validator::new(config.validation.clone()),
            validate_outbound: config.validate_outbound,
            breaker,
            retry: config.retry,
            limiter: config.limiter.map(|limiter| TokenBucket::new(limiter, env.clone())),
            last_sequence: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            write_failure: OnceLock::new(),
            recorder: recorder.clone(),
            shutdown,
            env: env.clone(),
        });

        let inbound = config.inbound_limiter.map(|limiter| KeyedLimiter::new(limiter, env));
        let workers = SenderWorkers::new(Arc::new(dispatcher), recorder, inbound, config.dispatch.queue_depth);
        let (control, control_rx) = mpsc::unbounded_channel();
        let receive = ReceiveLoop {
            shared: Arc::clone(&shared),
            sequencer: Sequencer::new(config.sequencer),
            workers,
            control: control_rx,
            sweep_interval: config.dispatch.sweep_interval,
            drain_timeout: config.dispatch.drain_timeout,
        };

        tracing::debug!(session = %shared.sender_id, "session opened");
        let receive = tokio::spawn(receive.run());

        Ok(Self { shared, control, receive: Some(receive), exit: None })
    }

    /// This endpoint's sender id.
    pub fn sender_id(&self) -> &str {
        &self.shared.sender_id
    }

    /// Send `payload` under `event`. Returns the sequence number used.
    pub async fn emit(&self, event: &str, payload: impl Into<Bytes>) -> Result<u64, SessionError> {
        let result = self.shared.emit(event, payload.into()).await;
        if let Err(error) = &result {
            tracing::debug!(session = %self.shared.sender_id, event, %error, "emit failed");
            self.shared.recorder.error(error.kind());
        }
        result
    }

    /// CBOR-encode `message` and send it under `event`.
    pub async fn emit_message<M: Serialize + ?Sized>(&self, event: &str, message: &M) -> Result<u64, SessionError> {
        let payload = match encode_payload(message) {
            Ok(payload) => payload,
            Err(error) => {
                self.shared.recorder.error(ErrorKind::Serialization);
                return Err(error.into());
            },
        };
        self.emit(event, payload).await
    }

    /// Give up on everything from `sender_id` up to and including
    /// `last_delivered`.
    ///
    /// Buffered frames at or below the mark are discarded and the frames that
    /// become contiguous are handed to their handlers. Use it after a
    /// [`TelemetryEvent::GapLoss`] when the missing frame will not be
    /// retransmitted. A mark at or below what was already delivered is a
    /// no-op.
    pub fn resync(&self, sender_id: &str, last_delivered: u64) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.control
            .send(Control::Resync { sender_id: sender_id.to_owned(), last_delivered })
            .map_err(|_| SessionError::Closed)
    }

    /// Last sequence number a write was attempted with; 0 before the first.
    pub fn last_sequence(&self) -> u64 {
        self.shared.last_sequence.load(Ordering::Acquire)
    }

    /// Outbound circuit breaker state.
    pub fn circuit_state(&self) -> CircuitState {
        self.shared.breaker.state()
    }

    /// Counters since the session opened.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.recorder.stats().snapshot()
    }

    /// Whether the receive loop has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Wait for the receive loop to end on its own.
    pub async fn closed(&mut self) -> SessionExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }

        let exit = match self.receive.take() {
            Some(handle) => handle.await.unwrap_or_else(|error| {
                tracing::error!(session = %self.shared.sender_id, %error, "receive loop aborted");
                SessionExit::Aborted
            }),
            None => SessionExit::Aborted,
        };
        self.exit = Some(exit.clone());
        exit
    }

    /// Stop the session.
    ///
    /// Cancels the receive loop and any emit waiting on backoff, lets queued
    /// frames reach their handlers, then closes the transport.
    pub async fn close(mut self) -> SessionExit {
        self.shared.shutdown.cancel();
        self.closed().await
    }
}

impl<T: Transport, E: Environment> Drop for Session<T, E> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl<T: Transport, E: Environment> std::fmt::Debug for Session<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sender_id", &self.shared.sender_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

//! Error taxonomy.
//!
//! Per-frame errors (serialization, validation, gap loss, missing handler)
//! are local to that frame: inbound ones are logged and dropped, outbound ones
//! are returned to the emitter. Only a transport read failure, or a write that
//! finds the connection gone, ends a session, and only that session.

use std::io;

use skein_proto::ProtocolError;
use thiserror::Error;

use crate::{sequencer::GapLoss, validator::ValidationError};

/// Operation rejected because the circuit breaker is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("circuit breaker is open")]
pub struct CircuitOpen;

/// Wait or retry loop aborted by its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Operation rejected because no rate-limit token was available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limit exceeded")]
pub struct RateLimited;

/// Errors surfaced by a [`crate::Session`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// Frame or payload failed to encode or decode.
    #[error("serialization failed: {0}")]
    Serialization(#[from] ProtocolError),

    /// Frame rejected by the validator.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Buffered frame evicted by the sequencer.
    #[error("gap loss: {0}")]
    GapLoss(GapLoss),

    /// Write not attempted, circuit open.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),

    /// Write not attempted, rate limit exhausted.
    #[error(transparent)]
    RateLimited(#[from] RateLimited),

    /// Frame delivered but nothing is registered for its event.
    #[error("no handler registered for event {0:?}")]
    HandlerNotFound(String),

    /// Cancelled while waiting (backoff or rate limit).
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    /// Session already closed.
    #[error("session is closed")]
    Closed,

    /// Transport write or read failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl SessionError {
    /// Stable label for telemetry.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Validation(e) => e.kind(),
            Self::GapLoss(_) => ErrorKind::GapLoss,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::HandlerNotFound(_) => ErrorKind::HandlerNotFound,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Closed => ErrorKind::Closed,
            Self::Transport(_) => ErrorKind::Transport,
        }
    }
}

/// Copyable error category, used as a telemetry label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Codec failure
    Serialization,
    /// Payload over `max_message_size`
    MessageTooLarge,
    /// Event not allowed
    InvalidMessage,
    /// Timestamp older than `message_timeout`
    MessageExpired,
    /// Sender missing or not allowed
    InvalidSender,
    /// Sequencer eviction
    GapLoss,
    /// Breaker rejected the call
    CircuitOpen,
    /// Limiter rejected the call
    RateLimited,
    /// No handler for the event
    HandlerNotFound,
    /// Handler returned an error or panicked
    Handler,
    /// Sender's dispatch queue was full; frame dropped
    Overloaded,
    /// Wait cancelled
    Cancelled,
    /// Session closed
    Closed,
    /// Transport failure
    Transport,
}

impl ErrorKind {
    /// Snake-case label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Serialization => "serialization",
            Self::MessageTooLarge => "message_too_large",
            Self::InvalidMessage => "invalid_message",
            Self::MessageExpired => "message_expired",
            Self::InvalidSender => "invalid_sender",
            Self::GapLoss => "gap_loss",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::HandlerNotFound => "handler_not_found",
            Self::Handler => "handler",
            Self::Overloaded => "overloaded",
            Self::Cancelled => "cancelled",
            Self::Closed => "closed",
            Self::Transport => "transport",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Inbound (and optionally outbound) frame validation.
//!
//! Checks run in a fixed order and the first violation wins:
//!
//! 1. payload size against `max_message_size`
//! 2. event against `allowed_events`
//! 3. age against `message_timeout`
//! 4. sender against `allowed_senders` (and never empty)
//!
//! Validation has no side effects. A rejected frame never reaches the
//! sequencer, so it neither advances nor stalls its sender's stream.

use std::{collections::HashSet, time::Duration};

use serde::Deserialize;
use skein_proto::Frame;
use thiserror::Error;

use crate::error::ErrorKind;

/// Why a frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Payload larger than the policy allows.
    #[error("message of {size} bytes exceeds limit of {max}")]
    MessageTooLarge {
        /// Payload size
        size: usize,
        /// Policy limit
        max: usize,
    },

    /// Event tag not in the allowed set.
    #[error("event {event:?} is not allowed")]
    InvalidMessage {
        /// Offending event tag
        event: String,
    },

    /// Frame older than `message_timeout`.
    #[error("message is {age_secs}s old, timeout is {timeout_secs}s")]
    MessageExpired {
        /// Age in seconds at validation time
        age_secs: i64,
        /// Policy timeout in seconds
        timeout_secs: u64,
    },

    /// Sender id empty or not allowed.
    #[error("sender {sender:?} is not allowed")]
    InvalidSender {
        /// Offending sender id
        sender: String,
    },
}

impl ValidationError {
    /// Telemetry label.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            Self::InvalidMessage { .. } => ErrorKind::InvalidMessage,
            Self::MessageExpired { .. } => ErrorKind::MessageExpired,
            Self::InvalidSender { .. } => ErrorKind::InvalidSender,
        }
    }
}

/// Validation policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationPolicy {
    /// Largest accepted payload in bytes
    pub max_message_size: usize,
    /// Maximum age of a frame's timestamp
    #[serde(with = "humantime_serde")]
    pub message_timeout: Duration,
    /// Accepted event tags; `None` accepts every event
    pub allowed_events: Option<HashSet<String>>,
    /// Accepted sender ids; `None` accepts any non-empty sender
    pub allowed_senders: Option<HashSet<String>>,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            message_timeout: Duration::from_secs(5 * 60),
            allowed_events: None,
            allowed_senders: None,
        }
    }
}

impl ValidationPolicy {
    /// Restrict accepted events to `events`.
    #[must_use]
    pub fn allow_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_events = Some(events.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict accepted senders to `senders`.
    #[must_use]
    pub fn allow_senders<I, S>(mut self, senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_senders = Some(senders.into_iter().map(Into::into).collect());
        self
    }
}

/// Stateless frame validator.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    policy: ValidationPolicy,
}

impl Validator {
    /// Create a validator for `policy`.
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    /// Active policy.
    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Check `frame` at wall-clock time `now_unix` (seconds).
    pub fn validate(&self, frame: &Frame, now_unix: i64) -> Result<(), ValidationError> {
        let policy = &self.policy;

        if frame.payload.len() > policy.max_message_size {
            return Err(ValidationError::MessageTooLarge {
                size: frame.payload.len(),
                max: policy.max_message_size,
            });
        }

        if let Some(allowed) = &policy.allowed_events
            && !allowed.contains(&frame.event)
        {
            return Err(ValidationError::InvalidMessage { event: frame.event.clone() });
        }

        let timeout_secs = policy.message_timeout.as_secs();
        let age_secs = now_unix.saturating_sub(frame.timestamp);
        if age_secs > i64::try_from(timeout_secs).unwrap_or(i64::MAX) {
            return Err(ValidationError::MessageExpired { age_secs, timeout_secs });
        }

        let sender_allowed = !frame.sender_id.is_empty()
            && policy.allowed_senders.as_ref().is_none_or(|allowed| allowed.contains(&frame.sender_id));
        if !sender_allowed {
            return Err(ValidationError::InvalidSender { sender: frame.sender_id.clone() });
        }

        Ok(())
    }
}

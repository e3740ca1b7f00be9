//! Session configuration.
//!
//! Every field has a default, so an empty document is a valid configuration.
//! Durations use humantime syntax (`"250ms"`, `"10s"`, `"5m"`).
//!
//! ```toml
//! sender_id = "node-a"
//!
//! [breaker]
//! threshold = 3
//! reset_timeout = "30s"
//!
//! [limiter]
//! rate = 50.0
//! burst = 100
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    breaker::BreakerConfig, limiter::LimiterConfig, retry::RetryPolicy, sequencer::SequencerConfig,
    validator::ValidationPolicy,
};

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Document is not valid TOML or has unknown or mistyped keys.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted key
        field: &'static str,
        /// What is wrong with it
        reason: &'static str,
    },
}

/// Frame codec options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodecConfig {
    /// Gzip payloads of at least this many bytes; unset disables compression
    pub compression_threshold: Option<usize>,
}

/// Inbound dispatch options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Frames buffered per sender ahead of its handler; a frame arriving at
    /// a full queue is dropped
    pub queue_depth: usize,
    /// How often stale reorder-buffer entries are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// How long closing waits for queued frames to reach their handlers
    /// before aborting the workers
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { queue_depth: 256, sweep_interval: Duration::from_secs(1), drain_timeout: Duration::from_secs(5) }
    }
}

/// Everything a [`crate::Session`] can be tuned with.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// This endpoint's sender id; random 8 hex characters when unset
    pub sender_id: Option<String>,
    /// Validate outbound frames with the inbound policy before sending
    pub validate_outbound: bool,
    /// Inbound frame policy
    pub validation: ValidationPolicy,
    /// Outbound circuit breaker
    pub breaker: BreakerConfig,
    /// Outbound retry policy
    pub retry: RetryPolicy,
    /// Outbound rate limit; unset means unlimited
    pub limiter: Option<LimiterConfig>,
    /// Per-sender inbound rate limit; unset means unlimited
    pub inbound_limiter: Option<LimiterConfig>,
    /// Reorder buffer bounds
    pub sequencer: SequencerConfig,
    /// Frame codec
    pub codec: CodecConfig,
    /// Dispatch workers
    pub dispatch: DispatchConfig,
}

impl SessionConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let document = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&document)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &'static str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid { field, reason })
        }

        if let Some(id) = &self.sender_id {
            if id.is_empty() {
                return invalid("sender_id", "must not be empty");
            }
            if id.len() > skein_proto::MAX_FIELD_LEN {
                return invalid("sender_id", "must fit in 255 bytes");
            }
        }
        if self.breaker.threshold == 0 {
            return invalid("breaker.threshold", "must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts", "must be at least 1");
        }
        if !(self.retry.backoff_multiplier >= 1.0 && self.retry.backoff_multiplier.is_finite()) {
            return invalid("retry.backoff_multiplier", "must be a finite number >= 1");
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return invalid("retry.initial_delay", "must not exceed retry.max_delay");
        }
        if let Some(limiter) = &self.limiter {
            check_limiter("limiter", limiter)?;
        }
        if let Some(limiter) = &self.inbound_limiter {
            check_limiter("inbound_limiter", limiter)?;
        }
        if self.sequencer.max_buffer == 0 {
            return invalid("sequencer.max_buffer", "must be at least 1");
        }
        if self.sequencer.max_wait.is_zero() {
            return invalid("sequencer.max_wait", "must be non-zero");
        }
        if self.dispatch.queue_depth == 0 {
            return invalid("dispatch.queue_depth", "must be at least 1");
        }
        if self.dispatch.sweep_interval.is_zero() {
            return invalid("dispatch.sweep_interval", "must be non-zero");
        }
        Ok(())
    }
}

fn check_limiter(section: &'static str, limiter: &LimiterConfig) -> Result<(), ConfigError> {
    let (rate_field, burst_field) = match section {
        "limiter" => ("limiter.rate", "limiter.burst"),
        _ => ("inbound_limiter.rate", "inbound_limiter.burst"),
    };
    if !(limiter.rate > 0.0 && limiter.rate.is_finite()) {
        return Err(ConfigError::Invalid { field: rate_field, reason: "must be a positive number" });
    }
    if limiter.burst == 0 {
        return Err(ConfigError::Invalid { field: burst_field, reason: "must be at least 1" });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = SessionConfig::from_toml_str("").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.breaker.threshold, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.sequencer.max_buffer, 1000);
        assert_eq!(config.dispatch.queue_depth, 256);
        assert_eq!(config.dispatch.drain_timeout, Duration::from_secs(5));
        assert!(config.limiter.is_none());
        assert!(!config.validate_outbound);
    }

    #[test]
    fn full_document_parses() {
        let config = SessionConfig::from_toml_str(
            r#"
            sender_id = "node-a"
            validate_outbound = true

            [validation]
            max_message_size = 4096
            message_timeout = "30s"
            allowed_events = ["chat", "presence"]

            [breaker]
            threshold = 3
            reset_timeout = "250ms"

            [retry]
            max_attempts = 5
            initial_delay = "100ms"
            max_delay = "2s"
            backoff_multiplier = 1.5

            [limiter]
            rate = 10.0
            burst = 20

            [sequencer]
            max_buffer = 64
            max_wait = "2s"

            [codec]
            compression_threshold = 1024

            [dispatch]
            queue_depth = 8
            sweep_interval = "500ms"
            drain_timeout = "2s"
            "#,
        )
        .unwrap();

        assert_eq!(config.sender_id.as_deref(), Some("node-a"));
        assert!(config.validate_outbound);
        assert_eq!(config.validation.message_timeout, Duration::from_secs(30));
        assert!(config.validation.allowed_events.as_ref().unwrap().contains("presence"));
        assert_eq!(config.breaker.reset_timeout, Duration::from_millis(250));
        assert_eq!(config.retry.backoff_multiplier, 1.5);
        assert_eq!(config.limiter, Some(LimiterConfig { rate: 10.0, burst: 20 }));
        assert_eq!(config.codec.compression_threshold, Some(1024));
        assert_eq!(config.dispatch.sweep_interval, Duration::from_millis(500));
        assert_eq!(config.dispatch.drain_timeout, Duration::from_secs(2));
    }

    #[test]
    fn unknown_key_rejected() {
        let err = SessionConfig::from_toml_str("[breaker]\nthreshhold = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = SessionConfig::from_toml_str("[retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "retry.max_attempts", .. }));
    }

    #[test]
    fn shrinking_backoff_rejected() {
        let err = SessionConfig::from_toml_str("[retry]\nbackoff_multiplier = 0.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "retry.backoff_multiplier", .. }));
    }

    #[test]
    fn non_positive_rate_rejected() {
        let err = SessionConfig::from_toml_str("[inbound_limiter]\nrate = 0.0\nburst = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "inbound_limiter.rate", .. }));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = SessionConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { ref path, .. } if path.ends_with("here.toml")));
    }
}

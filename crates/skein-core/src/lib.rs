//! Skein session core
//!
//! The resilient ordered-messaging pipeline that sits between a
//! message-oriented transport and application handlers.
//!
//! # Architecture
//!
//! ```text
//! inbound:  transport ─► codec ─► validator ─► sequencer ─► per-sender worker ─► inbound limiter ─► middleware ─► handler
//! outbound: emit ─► codec ─► rate limiter ─► retry( circuit breaker( transport write ) )
//! ```
//!
//! The ordering and admission components are plain state machines. The
//! sequencer is fed explicit timestamps; the breaker, limiter and retrier
//! read time through an [`env::Environment`] so tests can drive a virtual
//! clock. Only [`session`] spawns tasks and touches the transport.
//!
//! # Components
//!
//! - [`validator`]: Size, event, age and sender checks
//! - [`sequencer`]: Per-sender reorder buffer with bounded memory
//! - [`breaker`]: Closed/Open/HalfOpen failure gate
//! - [`retry`]: Bounded exponential backoff
//! - [`limiter`]: Token buckets, single and keyed
//! - [`dispatch`]: Typed event → handler table with middleware
//! - [`session`]: Receive loop and emit path over one transport
//! - [`telemetry`]: Observability sink and built-in counters
//! - [`config`]: Session configuration
//! - [`mod@env`]: Environment abstraction (time, sleep, RNG)
//! - [`transport`]: Transport abstraction
//! - [`error`]: Error taxonomy

pub mod breaker;
pub mod config;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod limiter;
pub mod retry;
pub mod sequencer;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod validator;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use config::{ConfigError, SessionConfig};
pub use dispatch::{BoxHandler, Delivery, DispatchError, Dispatcher, HandlerError, Middleware, TraceLayer};
pub use env::{Environment, SystemEnv};
pub use error::{Cancelled, CircuitOpen, ErrorKind, RateLimited, SessionError};
pub use limiter::{KeyedLimiter, LimiterConfig, TokenBucket};
pub use retry::{RetryPolicy, with_retry};
pub use sequencer::{GapLoss, GapReason, Observation, Sequencer, SequencerConfig};
pub use session::{Session, SessionExit, is_connection_lost};
pub use telemetry::{NoopTelemetry, SessionStats, StatsSnapshot, Telemetry, TelemetryEvent};
pub use transport::Transport;
pub use validator::{ValidationError, ValidationPolicy, Validator};

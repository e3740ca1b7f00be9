//! Deterministic test doubles for Skein.
//!
//! In-memory implementations of the Environment, Transport and Telemetry
//! seams so session behaviour (ordering, backoff, breaker trips, shutdown)
//! can be exercised without sockets or wall-clock waiting.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod memory_transport;
pub mod sim_env;
pub mod telemetry;

pub use memory_transport::MemoryTransport;
pub use sim_env::SimEnv;
pub use telemetry::RecordingTelemetry;

use std::time::Duration;

/// Poll `condition` until it holds or `timeout` of real time passes.
///
/// Returns whether the condition was met. Session work happens on spawned
/// tasks, so assertions about its effects need to wait for them.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

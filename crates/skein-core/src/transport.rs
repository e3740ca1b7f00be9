//! Transport abstraction for message-oriented connections.
//!
//! A session needs only three things from the connection beneath it: send one
//! message, receive one message, close. Message boundaries are the
//! transport's job (a WebSocket frame, a QUIC datagram, a length-delimited TCP
//! stream); the session never sees partial messages.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;

/// One duplex, message-oriented connection.
///
/// Methods take `&self` so the receive loop and concurrent emitters can share
/// one instance behind an `Arc`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write one message.
    ///
    /// An error here is reported to the emitter and counted by the circuit
    /// breaker; it does not end the session.
    async fn send(&self, message: Bytes) -> io::Result<()>;

    /// Read the next message.
    ///
    /// Returns `Ok(None)` when the peer closed the connection gracefully. An
    /// error ends the session's receive loop.
    ///
    /// Must be cancellation safe: the session polls this alongside its timers
    /// and may drop the future before it completes, which must not lose a
    /// message.
    async fn receive(&self) -> io::Result<Option<Bytes>>;

    /// Close the connection. Idempotent.
    async fn close(&self) -> io::Result<()>;
}

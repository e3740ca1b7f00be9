//! In-memory transport pair with fault injection.
//!
//! [`MemoryTransport::pair`] returns two connected ends: what one sends the
//! other receives, in order. Closing one end makes the other's next receive
//! report a graceful close. Faults are injected per end:
//!
//! - [`fail_sends`](MemoryTransport::fail_sends): the next `n` sends fail
//! - [`fail_all_sends`](MemoryTransport::fail_all_sends): every send fails
//! - [`inject_read_error`](MemoryTransport::inject_read_error): the next
//!   receive fails
//! - [`push_raw`](MemoryTransport::push_raw): deliver arbitrary bytes to this
//!   end as if the peer had sent them

use std::{
    io,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use skein_core::Transport;
use tokio::sync::{self, mpsc};

enum Incoming {
    Message(Bytes),
    Error(io::ErrorKind),
    Closed,
}

#[derive(Debug, Default)]
struct Faults {
    fail_next: usize,
    fail_all: bool,
}

/// One end of an in-memory connection.
pub struct MemoryTransport {
    peer: mpsc::UnboundedSender<Incoming>,
    loopback: mpsc::UnboundedSender<Incoming>,
    inbound: sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
    faults: Mutex<Faults>,
    send_attempts: AtomicUsize,
    sent: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Self::end(b_tx.clone(), a_tx.clone(), a_rx);
        let b = Self::end(a_tx, b_tx, b_rx);
        (a, b)
    }

    fn end(
        peer: mpsc::UnboundedSender<Incoming>,
        loopback: mpsc::UnboundedSender<Incoming>,
        inbound: mpsc::UnboundedReceiver<Incoming>,
    ) -> Self {
        Self {
            peer,
            loopback,
            inbound: sync::Mutex::new(inbound),
            faults: Mutex::new(Faults::default()),
            send_attempts: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Fail the next `n` sends with `ConnectionReset`.
    pub fn fail_sends(&self, n: usize) {
        self.faults().fail_next = n;
    }

    /// Fail every send until [`heal`](Self::heal) is called.
    pub fn fail_all_sends(&self) {
        self.faults().fail_all = true;
    }

    /// Clear all send faults.
    pub fn heal(&self) {
        *self.faults() = Faults::default();
    }

    /// Make the next receive on this end fail with `kind`.
    pub fn inject_read_error(&self, kind: io::ErrorKind) {
        let _ = self.loopback.send(Incoming::Error(kind));
    }

    /// Deliver `bytes` to this end as if the peer had sent them.
    pub fn push_raw(&self, bytes: impl Into<Bytes>) {
        let _ = self.loopback.send(Incoming::Message(bytes.into()));
    }

    /// Sends attempted on this end, including failed ones.
    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::Acquire)
    }

    /// Sends that reached the peer.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Acquire)
    }

    /// Whether [`Transport::close`] was called on this end.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn injected_failure(&self) -> bool {
        let mut faults = self.faults();
        if faults.fail_all {
            return true;
        }
        if faults.fail_next > 0 {
            faults.fail_next -= 1;
            return true;
        }
        false
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: Bytes) -> io::Result<()> {
        self.send_attempts.fetch_add(1, Ordering::AcqRel);
        if self.is_closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if self.injected_failure() {
            tracing::trace!("injected send failure");
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected send failure"));
        }
        self.peer.send(Incoming::Message(message)).map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        self.sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn receive(&self) -> io::Result<Option<Bytes>> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(Incoming::Message(bytes)) => Ok(Some(bytes)),
            Some(Incoming::Error(kind)) => Err(io::Error::new(kind, "injected read failure")),
            Some(Incoming::Closed) | None => Ok(None),
        }
    }

    async fn close(&self) -> io::Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.peer.send(Incoming::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("sent", &self.sent())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

//! Event → handler routing.
//!
//! Handlers are registered per event tag before the session starts and the
//! table is read-only afterwards. A typed handler receives the payload
//! already decoded; a raw handler receives the bytes.
//!
//! # Middleware
//!
//! A [`Middleware`] wraps every handler in the table, those registered before
//! and after it was added. Each layer receives the next handler inward and
//! returns a replacement, so it can act before and after the call or refuse
//! the frame outright. Layers added later run outside earlier ones.
//! [`TraceLayer`] is the stock example.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use tracing::Instrument;
use serde::de::DeserializeOwned;
use skein_proto::{Frame, ProtocolError, decode_payload};
use thiserror::Error;

use crate::error::ErrorKind;

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A registered handler as middleware sees it: frame in, completion out.
pub type BoxHandler = Arc<dyn Fn(Frame) -> BoxFuture<'static, Result<(), DispatchError>> + Send + Sync>;

/// Wraps handlers with behaviour shared by every event.
pub trait Middleware: Send + Sync + 'static {
    /// Return a handler that runs around `next`.
    fn wrap(&self, next: BoxHandler) -> BoxHandler;
}

impl<F> Middleware for F
where
    F: Fn(BoxHandler) -> BoxHandler + Send + Sync + 'static,
{
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        self(next)
    }
}

/// Runs each handler inside a `dispatch` span carrying the envelope fields
/// and logs the outcome at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceLayer;

impl Middleware for TraceLayer {
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(move |frame: Frame| {
            let span = tracing::debug_span!(
                "dispatch",
                event = %frame.event,
                sender = %frame.sender_id,
                sequence = frame.sequence,
            );
            let next = Arc::clone(&next);
            async move {
                tracing::debug!("handling frame");
                let result = next(frame).await;
                match &result {
                    Ok(()) => tracing::debug!("handled"),
                    Err(error) => tracing::debug!(%error, "handler returned an error"),
                }
                result
            }
            .instrument(span)
            .boxed()
        })
    }
}

/// Envelope metadata passed to every handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Event tag
    pub event: String,
    /// Originating sender
    pub sender_id: String,
    /// Sender's sequence number
    pub sequence: u64,
    /// Sender's timestamp (unix seconds)
    pub timestamp: i64,
}

impl Delivery {
    fn split(frame: Frame) -> (Self, Bytes) {
        let Frame { event, sender_id, sequence, timestamp, payload } = frame;
        (Self { event, sender_id, sequence, timestamp }, payload)
    }
}

/// Registration and dispatch failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A handler already exists for this event.
    #[error("handler already registered for event {0:?}")]
    DuplicateHandler(String),

    /// Nothing is registered for this event.
    #[error("no handler registered for event {0:?}")]
    HandlerNotFound(String),

    /// Payload could not be decoded into the handler's message type.
    #[error("failed to decode payload for event {event:?}: {source}")]
    Decode {
        /// Event tag
        event: String,
        /// Codec error
        #[source]
        source: ProtocolError,
    },

    /// Handler returned an error.
    #[error("handler for event {event:?} failed: {source}")]
    Handler {
        /// Event tag
        event: String,
        /// Handler's error
        #[source]
        source: HandlerError,
    },
}

impl DispatchError {
    /// Telemetry label.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HandlerNotFound(_) => ErrorKind::HandlerNotFound,
            Self::Decode { .. } => ErrorKind::Serialization,
            Self::DuplicateHandler(_) | Self::Handler { .. } => ErrorKind::Handler,
        }
    }
}

/// Event → handler table.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, BoxHandler>,
    layers: Vec<Arc<dyn Middleware>>,
}

impl Dispatcher {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `event` whose payload is CBOR-decoded into `M`.
    pub fn register<M, H, Fut>(&mut self, event: impl Into<String>, handler: H) -> Result<(), DispatchError>
    where
        M: DeserializeOwned + Send + 'static,
        H: Fn(Delivery, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register_with(event, |payload: &Bytes| decode_payload::<M>(payload), handler)
    }

    /// Register a handler for `event` with a custom payload decoder.
    pub fn register_with<M, D, H, Fut>(
        &mut self,
        event: impl Into<String>,
        decoder: D,
        handler: H,
    ) -> Result<(), DispatchError>
    where
        M: Send + 'static,
        D: Fn(&Bytes) -> Result<M, ProtocolError> + Send + Sync + 'static,
        H: Fn(Delivery, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: BoxHandler = Arc::new(move |frame: Frame| {
            let (delivery, payload) = Delivery::split(frame);
            let event = delivery.event.clone();
            match decoder(&payload) {
                Ok(message) => handler(delivery, message)
                    .map(move |result| result.map_err(|source| DispatchError::Handler { event, source }))
                    .boxed(),
                Err(source) => future::ready(Err(DispatchError::Decode { event, source })).boxed(),
            }
        });
        self.insert(event.into(), handler)
    }

    /// Register a handler for `event` that receives the raw payload.
    pub fn register_raw<H, Fut>(&mut self, event: impl Into<String>, handler: H) -> Result<(), DispatchError>
    where
        H: Fn(Delivery, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register_with(event, |payload: &Bytes| Ok(payload.clone()), handler)
    }

    /// Wrap every handler, present and future, in `middleware`.
    pub fn layer(&mut self, middleware: impl Middleware) -> &mut Self {
        let middleware: Arc<dyn Middleware> = Arc::new(middleware);
        for handler in self.handlers.values_mut() {
            *handler = middleware.wrap(Arc::clone(handler));
        }
        self.layers.push(middleware);
        self
    }

    /// Whether `event` has a handler.
    pub fn contains(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Number of registered events.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route `frame` to its handler and wait for it to finish.
    pub async fn dispatch(&self, frame: Frame) -> Result<(), DispatchError> {
        let Some(handler) = self.handlers.get(&frame.event) else {
            return Err(DispatchError::HandlerNotFound(frame.event));
        };
        let handler = Arc::clone(handler);
        handler(frame).await
    }

    fn insert(&mut self, event: String, handler: BoxHandler) -> Result<(), DispatchError> {
        if self.handlers.contains_key(&event) {
            return Err(DispatchError::DuplicateHandler(event));
        }
        let handler = self.layers.iter().fold(handler, |inner, layer| layer.wrap(inner));
        self.handlers.insert(event, handler);
        Ok(())
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("events", &self.handlers.keys().collect::<Vec<_>>())
            .field("layers", &self.layers.len())
            .finish()
    }
}

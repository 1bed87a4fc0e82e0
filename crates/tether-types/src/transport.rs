//! Transport contract consumed by the session core.
//!
//! A transport moves opaque JSON-RPC frames and reports its own lifecycle.
//! It knows nothing about MCP: the session decides what the bytes mean.

use bytes::Bytes;
use futures_core::Stream;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Boxed future returned by the dyn-compatible [`Transport`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Inbound frames, one complete JSON-RPC message per item.
pub type MessageStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Transport lifecycle updates.
pub type StateStream = Pin<Box<dyn Stream<Item = TransportState> + Send>>;

/// Errors raised by a transport. Cheap to clone so they can be carried
/// inside state values and fanned out to several waiters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Transport is already connected")]
    AlreadyConnected,

    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Process exited (code: {code:?})")]
    ProcessExited { code: Option<i32> },

    #[error("Connection closed")]
    Closed,

    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Lifecycle of a transport, as observed by the session.
#[derive(Debug, Clone)]
pub enum TransportState {
    Connecting,
    Connected,
    /// `None` means a clean, requested shutdown.
    Disconnected(Option<TransportError>),
}

impl TransportState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// A bidirectional message channel to one MCP server.
///
/// Dyn-compatible so the session can hold an `Arc<dyn Transport>`.
/// `incoming` and `state_changes` may be called once per connection cycle;
/// a fresh call replaces the previous subscriber.
pub trait Transport: Send + Sync {
    /// Open the underlying channel. Emits `Connecting` then `Connected`.
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Send one serialized JSON-RPC message.
    fn send(&self, message: Bytes) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Subscribe to inbound frames. The stream ends when the channel closes.
    fn incoming(&self) -> MessageStream;

    /// Subscribe to lifecycle updates.
    fn state_changes(&self) -> StateStream;

    /// Close the channel. Idempotent.
    fn disconnect(&self) -> BoxFuture<'_, ()>;

    /// Whether the channel stays open between messages. Heartbeats only
    /// run over persistent transports.
    fn is_persistent(&self) -> bool {
        true
    }

    /// Short name for logging (e.g. "stdio").
    fn name(&self) -> &str;
}

/// Single-subscriber broadcast point used by transport implementations.
///
/// Each `subscribe` hands out a new stream and finishes the previous one,
/// so a transport can be reconnected without reusing a spent stream.
pub struct Outlet<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
}

impl<T: Send + 'static> Outlet<T> {
    pub fn new() -> Self {
        Self {
            tx: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> Pin<Box<dyn Stream<Item = T> + Send>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Box::pin(ReceiverStream { rx })
    }

    /// Deliver an item to the current subscriber. Returns false when
    /// nobody is listening.
    pub fn emit(&self, item: T) -> bool {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Finish the current subscriber's stream.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl<T: Send + 'static> Default for Outlet<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct ReceiverStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Stream for ReceiverStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

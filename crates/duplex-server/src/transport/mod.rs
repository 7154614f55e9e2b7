//! Transport adapters over message-oriented duplex connections.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `ws`   | Axum `WebSocket` adapter with a keep-alive ping task |
//! | `mem`  | In-process channel-backed pair for tests and embedding |
//!
//! A transport splits into a frame receiver and a frame sender. The
//! receiver side is wrapped in a [`FrameReader`] that additionally exposes a
//! byte-granularity `read`: one buffered inbound frame is consumed across
//! multiple calls, and a new frame is fetched only when the previous one is
//! exhausted. On the sender side every `write` becomes exactly one outbound
//! message.

pub mod mem;
pub mod ws;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// Failures surfaced by transport adapters.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection is closed.
    #[error("transport closed")]
    Closed,
    /// Underlying I/O failure.
    #[error("transport error: {0}")]
    Io(String),
}

/// Receiving half of a transport: yields whole message frames.
#[async_trait]
pub trait FrameReceiver: Send + 'static {
    /// Next inbound frame. `Ok(None)` signals clean end of stream.
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Sending half of a transport: frames each payload as one outbound message.
#[async_trait]
pub trait FrameSender: Send + 'static {
    /// Send one payload as exactly one message frame.
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Close the underlying connection. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Non-blocking close signal. Cancelling it aborts in-flight sends and
    /// stops the keep-alive task, so `close` can take the write path
    /// without deadlocking.
    fn close_signal(&self) -> CancellationToken;

    /// Byte-granularity write: the whole buffer becomes one frame.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.send_frame(buf).await?;
        Ok(buf.len())
    }
}

/// A duplex message connection that splits into its two halves.
pub trait Transport: Send + 'static {
    /// Receiving half type.
    type Rx: FrameReceiver;
    /// Sending half type.
    type Tx: FrameSender;

    /// Split into independently-owned receive and send halves.
    fn into_split(self) -> (Self::Rx, Self::Tx);
}

/// Buffered reader over a [`FrameReceiver`].
///
/// Holds at most one inbound frame. `read` consumes it across multiple
/// calls; `next_frame` returns the unconsumed remainder first, then fetches
/// fresh frames from the transport.
pub struct FrameReader<R> {
    inner: R,
    pending: Bytes,
}

impl<R: FrameReceiver> FrameReader<R> {
    /// Wrap a receiver.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
        }
    }

    /// Next whole frame, or `None` at end of stream.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        self.inner.recv_frame().await
    }

    /// Read up to `buf.len()` bytes of the buffered frame, fetching the next
    /// frame only once the previous one is exhausted. Returns `Ok(0)` at end
    /// of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pending.is_empty() {
            match self.inner.recv_frame().await? {
                Some(frame) => self.pending = frame,
                None => return Ok(0),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }
}

//! In-process transport: a cross-wired pair of channel-backed connections.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{FrameReceiver, FrameSender, Transport, TransportError};

/// One end of an in-memory duplex connection.
pub struct MemTransport {
    rx: MemReceiver,
    tx: MemSender,
}

/// Create a connected pair with the given per-direction frame capacity.
pub fn pair(capacity: usize) -> (MemTransport, MemTransport) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        MemTransport {
            rx: MemReceiver { rx: a_rx },
            tx: MemSender {
                tx: Some(a_tx),
                stop: CancellationToken::new(),
            },
        },
        MemTransport {
            rx: MemReceiver { rx: b_rx },
            tx: MemSender {
                tx: Some(b_tx),
                stop: CancellationToken::new(),
            },
        },
    )
}

impl Transport for MemTransport {
    type Rx = MemReceiver;
    type Tx = MemSender;

    fn into_split(self) -> (MemReceiver, MemSender) {
        (self.rx, self.tx)
    }
}

/// Receiving half of a [`MemTransport`].
pub struct MemReceiver {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl FrameReceiver for MemReceiver {
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Sending half of a [`MemTransport`].
pub struct MemSender {
    tx: Option<mpsc::Sender<Bytes>>,
    stop: CancellationToken,
}

#[async_trait]
impl FrameSender for MemSender {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(TransportError::Closed);
        };
        tokio::select! {
            () = self.stop.cancelled() => Err(TransportError::Closed),
            sent = tx.send(Bytes::copy_from_slice(frame)) => {
                sent.map_err(|_| TransportError::Closed)
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stop.cancel();
        // Dropping the sender ends the peer's stream.
        let _ = self.tx.take();
        Ok(())
    }

    fn close_signal(&self) -> CancellationToken {
        self.stop.clone()
    }
}

//! Axum `WebSocket` transport adapter.
//!
//! Wraps an upgraded socket into a frame receiver/sender pair and runs an
//! independent keep-alive task that pings the peer on a fixed interval. A
//! ping that cannot be sent within its deadline terminates the connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{FrameReceiver, FrameSender, Transport, TransportError};

type WsSink = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

/// WebSocket-backed message transport.
pub struct WsTransport {
    rx: WsReceiver,
    tx: WsSender,
}

impl WsTransport {
    /// Adapt an upgraded socket and spawn its keep-alive task.
    pub fn new(socket: WebSocket, ping_interval: Duration, ping_deadline: Duration) -> Self {
        let (sink, stream) = socket.split();
        let sink: WsSink = Arc::new(tokio::sync::Mutex::new(sink));
        let stop = CancellationToken::new();
        drop(tokio::spawn(keep_alive(
            Arc::clone(&sink),
            ping_interval,
            ping_deadline,
            stop.clone(),
        )));
        Self {
            rx: WsReceiver {
                stream,
                stop: stop.clone(),
            },
            tx: WsSender {
                sink,
                stop,
                closed: false,
            },
        }
    }
}

impl Transport for WsTransport {
    type Rx = WsReceiver;
    type Tx = WsSender;

    fn into_split(self) -> (WsReceiver, WsSender) {
        (self.rx, self.tx)
    }
}

/// Receiving half of a [`WsTransport`].
pub struct WsReceiver {
    stream: SplitStream<WebSocket>,
    stop: CancellationToken,
}

#[async_trait]
impl FrameReceiver for WsReceiver {
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            let msg = tokio::select! {
                () = self.stop.cancelled() => return Ok(None),
                msg = self.stream.next() => msg,
            };
            match msg {
                None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_bytes())));
                }
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Control frames are transport-level traffic, not payload.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            }
        }
    }
}

/// Sending half of a [`WsTransport`].
pub struct WsSender {
    sink: WsSink,
    stop: CancellationToken,
    closed: bool,
}

#[async_trait]
impl FrameSender for WsSender {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.stop.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let text = String::from_utf8(frame.to_vec())
            .map_err(|e| TransportError::Io(format!("non-UTF8 frame: {e}")))?;
        tokio::select! {
            () = self.stop.cancelled() => Err(TransportError::Closed),
            sent = async {
                let mut sink = self.sink.lock().await;
                sink.send(Message::Text(text.into())).await
            } => sent.map_err(|e| TransportError::Io(e.to_string())),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Single-use flag: stops the keep-alive task and aborts in-flight
        // sends without blocking on either.
        self.stop.cancel();
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
        Ok(())
    }

    fn close_signal(&self) -> CancellationToken {
        self.stop.clone()
    }
}

/// Ping the peer every `interval`. A ping that cannot be sent within
/// `deadline` terminates the underlying transport.
async fn keep_alive(
    sink: WsSink,
    interval: Duration,
    deadline: Duration,
    stop: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let ping = async {
            let mut sink = sink.lock().await;
            sink.send(Message::Ping(Bytes::new())).await
        };
        match time::timeout(deadline, ping).await {
            Ok(Ok(())) => debug!("keep-alive ping sent"),
            Ok(Err(e)) => {
                warn!(error = %e, "keep-alive ping failed, closing transport");
                stop.cancel();
                let mut sink = sink.lock().await;
                let _ = sink.close().await;
                return;
            }
            Err(_) => {
                warn!("keep-alive ping timed out, closing transport");
                stop.cancel();
                let mut sink = sink.lock().await;
                let _ = sink.close().await;
                return;
            }
        }
    }
}

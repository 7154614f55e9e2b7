//! Protocol codec: envelopes over a transport, and the translation between
//! client correlation ids and internal sequence numbers.
//!
//! The write side ([`Codec`]) is shared by every task on a connection:
//! response writes, notification pushes, and the final close all serialize
//! through one async lock so frames never interleave on the wire. The read
//! side ([`CodecReader`]) is owned by the serve loop alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use duplex_rpc::errors::RpcError;
use duplex_rpc::params;
use duplex_rpc::types::{CallId, ErrorBody, Notification, Response};

use crate::transport::{FrameReader, FrameReceiver, FrameSender, TransportError};

/// Codec failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Frame was not valid JSON. Fatal to the stream.
    #[error("corrupt frame: {0}")]
    Corrupt(String),
    /// A response was written for a sequence with no pending entry. This is
    /// a defect in the calling code, not a runtime condition.
    #[error("invalid sequence {0}: no pending call")]
    InvalidSequence(u64),
    /// Failed to serialize an outbound frame.
    #[error("serialize: {0}")]
    Serialize(String),
}

/// Shared write-side codec state: the pending-call table, the sequence
/// counter, and the single connection-wide write lock.
pub struct Codec {
    seq: AtomicU64,
    pending: Mutex<HashMap<u64, CallId>>,
    writer: tokio::sync::Mutex<Box<dyn FrameSender>>,
    stop: CancellationToken,
}

impl Codec {
    /// Wrap the sending half of a transport.
    pub fn new(writer: Box<dyn FrameSender>) -> Arc<Self> {
        let stop = writer.close_signal();
        Arc::new(Self {
            seq: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(writer),
            stop,
        })
    }

    /// Assign the next internal sequence for a call and record its id.
    /// The entry is removed by the matching [`Codec::write_response`].
    fn register(&self, id: CallId) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.pending.lock().insert(seq, id);
        seq
    }

    /// Number of calls currently in flight.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Write the response for `seq`, removing its pending entry.
    ///
    /// Every sequence must be answered exactly once. Answering a sequence
    /// with no pending entry fails with [`CodecError::InvalidSequence`].
    pub async fn write_response(
        &self,
        seq: u64,
        outcome: Result<Value, ErrorBody>,
    ) -> Result<(), CodecError> {
        let id = self
            .pending
            .lock()
            .remove(&seq)
            .ok_or(CodecError::InvalidSequence(seq))?;
        let response = match outcome {
            Ok(result) => Response::result(id, result),
            Err(error) => Response::failure(id, error),
        };
        let frame =
            serde_json::to_vec(&response).map_err(|e| CodecError::Serialize(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        writer.send_frame(&frame).await?;
        Ok(())
    }

    /// Write an unsolicited notification frame.
    pub async fn write_notification(
        &self,
        notification: &Notification,
    ) -> Result<(), CodecError> {
        let frame =
            serde_json::to_vec(notification).map_err(|e| CodecError::Serialize(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        writer.send_frame(&frame).await?;
        Ok(())
    }

    /// Close the transport writer.
    ///
    /// Cancels the transport's close signal first, aborting any in-flight
    /// write, then takes the write lock so nothing races the close.
    pub async fn close(&self) -> Result<(), CodecError> {
        self.stop.cancel();
        let mut writer = self.writer.lock().await;
        writer.close().await?;
        Ok(())
    }
}

/// Outcome of one header read.
#[derive(Debug)]
pub enum Inbound {
    /// A well-formed call ready for dispatch.
    Call(IncomingCall),
    /// The frame was valid JSON but not a call envelope. `seq` is already
    /// registered so the caller can answer it and keep serving.
    Malformed {
        /// Sequence registered for the degenerate response.
        seq: u64,
        /// What was wrong with the envelope.
        error: RpcError,
    },
}

/// A parsed call header.
#[derive(Debug)]
pub struct IncomingCall {
    /// Call target as `Service.Method`.
    pub service_method: String,
    /// Internal sequence handle for the response write.
    pub seq: u64,
}

/// Reading half of the codec. Owns the transport receiver and the per-call
/// scratch state (method name, raw params).
pub struct CodecReader<R> {
    frames: FrameReader<R>,
    codec: Arc<Codec>,
    method: Option<String>,
    raw_params: Option<Value>,
}

impl<R: FrameReceiver> CodecReader<R> {
    /// Wrap the receiving half of a transport.
    pub fn new(receiver: R, codec: Arc<Codec>) -> Self {
        Self {
            frames: FrameReader::new(receiver),
            codec,
            method: None,
            raw_params: None,
        }
    }

    /// Read the next call header, assigning its internal sequence.
    ///
    /// `Ok(None)` is clean end of stream. `Err` values are fatal to the
    /// stream. Malformed envelopes come back as [`Inbound::Malformed`] so
    /// the caller can answer them without dropping the connection.
    pub async fn read_request_header(&mut self) -> Result<Option<Inbound>, CodecError> {
        // Per-call scratch state is cleared before anything else.
        self.method = None;
        self.raw_params = None;

        let Some(frame) = self.frames.next_frame().await? else {
            return Ok(None);
        };
        let value: Value =
            serde_json::from_slice(&frame).map_err(|e| CodecError::Corrupt(e.to_string()))?;

        let id = CallId::from_value(value.get("id"));
        let Some(obj) = value.as_object() else {
            return Ok(Some(Inbound::Malformed {
                seq: self.codec.register(id),
                error: RpcError::InvalidRequest {
                    message: "request must be a JSON object".into(),
                },
            }));
        };
        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            return Ok(Some(Inbound::Malformed {
                seq: self.codec.register(id),
                error: RpcError::InvalidRequest {
                    message: "request has no method".into(),
                },
            }));
        };

        self.method = Some(method.to_owned());
        self.raw_params = obj.get("params").cloned();
        let seq = self.codec.register(id);
        Ok(Some(Inbound::Call(IncomingCall {
            service_method: method.to_owned(),
            seq,
        })))
    }

    /// Method name of the last call read, if any.
    pub fn method_name(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Raw params of the last call read; protocol null when the call
    /// carried none.
    pub fn raw_params(&self) -> Value {
        self.raw_params.clone().unwrap_or(Value::Null)
    }

    /// Decode the last call's params into `T`, applying the bare-value
    /// compatibility shim.
    pub fn read_request_body<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        params::decode(self.raw_params())
    }
}

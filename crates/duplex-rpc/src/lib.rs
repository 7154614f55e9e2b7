//! # duplex-rpc
//!
//! Wire protocol layer for the duplex RPC engine.
//!
//! - Request, response, and notification envelopes
//! - Opaque correlation ids ([`types::CallId`])
//! - Error codes and the handler-facing [`errors::RpcError`]
//! - Params decoding with the bare-value compatibility shim

#![deny(unsafe_code)]

pub mod errors;
pub mod params;
pub mod types;

pub use errors::RpcError;
pub use types::{CallId, ErrorBody, Notification, Request, Response, PROTOCOL_VERSION};

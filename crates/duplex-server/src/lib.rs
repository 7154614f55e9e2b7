//! # duplex-server
//!
//! Bidirectional JSON-RPC engine over a message-oriented duplex transport.
//!
//! - Transport adapters: Axum `WebSocket` (production) and an in-memory pair
//!   (tests, embedding), each with a keep-alive task on the socket path
//! - Codec: correlation-id to internal-sequence translation, frame writes
//!   serialized through one connection-wide lock
//! - Connection: per-client session data, close hooks, direct pushes
//! - Notifier: bounded, ordered, non-blocking push queue per connection
//! - Registry + serve loop: one task per connection reads calls, one task
//!   per call executes and responds
//! - Axum hosting with `/ws` upgrade and `/health`, graceful shutdown via
//!   `CancellationToken`

#![deny(unsafe_code)]

pub mod codec;
pub mod config;
pub mod connection;
pub mod health;
pub mod notifier;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use config::ServerConfig;
pub use connection::Connection;
pub use notifier::Notifier;
pub use registry::{Registry, Service};
pub use server::Server;

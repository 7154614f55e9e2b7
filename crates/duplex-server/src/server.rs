//! The RPC server: registry owner, per-connection serve loop, Axum hosting.
//!
//! One task per connection runs the synchronous read loop; every
//! well-formed call spawns its own task to execute the handler and write
//! the response, so responses may leave out of request order and a slow
//! handler delays only its own reply. Correlation is carried entirely by
//! the call id, never by arrival order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use metrics::{counter, gauge};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::{Codec, CodecError, CodecReader, Inbound};
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::health::{self, HealthResponse};
use crate::notifier::Notifier;
use crate::registry::Registry;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::ws::WsTransport;
use crate::transport::Transport;

/// Hook run on a new connection before serving begins.
pub type ConnectionHook = Box<dyn FnOnce(&Arc<Connection>) + Send>;

/// The RPC server.
pub struct Server {
    config: ServerConfig,
    registry: Registry,
    shutdown: Arc<ShutdownCoordinator>,
    connections: AtomicUsize,
    start_time: Instant,
}

impl Server {
    /// Create a server from a configured registry.
    pub fn new(config: ServerConfig, registry: Registry) -> Self {
        Self {
            config,
            registry,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            connections: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Sorted registered method names.
    pub fn methods(&self) -> Vec<String> {
        self.registry.methods()
    }

    /// Live connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Serve one connection for its whole life.
    ///
    /// Blocks until the transport dies, the connection is closed, or the
    /// server shuts down, then runs the close sequence: fire close hooks
    /// exactly once, seal the notifier, and close the codec under the
    /// shared write lock.
    #[instrument(skip_all, fields(conn_id))]
    pub async fn serve_connection<T: Transport>(
        self: Arc<Self>,
        transport: T,
        hooks: Vec<ConnectionHook>,
    ) {
        let (receiver, sender) = transport.into_split();
        let codec = Codec::new(Box::new(sender));
        let conn = Connection::new(Arc::clone(&codec));
        let notifier = Notifier::spawn(&conn, self.config.notify_queue_capacity);
        conn.set_notifier(Arc::clone(&notifier));
        let _ = tracing::Span::current().record("conn_id", conn.id());

        for hook in hooks {
            hook(&conn);
        }

        let _ = self.connections.fetch_add(1, Ordering::Relaxed);
        counter!("rpc_connections_total").increment(1);
        gauge!("rpc_connections_active").increment(1.0);
        info!("client connected");

        let shutdown = self.shutdown.token();
        let mut reader = CodecReader::new(receiver, Arc::clone(&codec));
        loop {
            let inbound = tokio::select! {
                () = conn.close_requested() => {
                    debug!("close requested");
                    break;
                }
                () = shutdown.cancelled() => {
                    debug!("server shutting down");
                    break;
                }
                read = reader.read_request_header() => read,
            };
            match inbound {
                Ok(None) => {
                    debug!("stream ended");
                    break;
                }
                Ok(Some(Inbound::Call(call))) => {
                    let params = reader.raw_params();
                    self.spawn_call(&conn, &codec, call.service_method, call.seq, params);
                }
                Ok(Some(Inbound::Malformed { seq, error })) => {
                    debug!(error = %error, "malformed call envelope");
                    if let Err(e) = codec.write_response(seq, Err(error.to_error_body())).await {
                        warn!(error = %e, "failed to answer malformed call");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "stream read failed");
                    break;
                }
            }
        }

        // Terminating: every registered close hook fires exactly once.
        conn.run_close_hooks();
        notifier.close();

        // Closed: take the write lock one last time and close the codec.
        conn.mark_closed();
        if let Err(e) = codec.close().await {
            debug!(error = %e, "transport close");
        }

        let _ = self.connections.fetch_sub(1, Ordering::Relaxed);
        gauge!("rpc_connections_active").decrement(1.0);
        info!("client disconnected");
    }

    /// Spawn the concurrent task that runs one call and writes its response.
    fn spawn_call(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        codec: &Arc<Codec>,
        method: String,
        seq: u64,
        params: Value,
    ) {
        let server = Arc::clone(self);
        let conn = Arc::clone(conn);
        let codec = Arc::clone(codec);
        drop(tokio::spawn(async move {
            let outcome = server
                .registry
                .dispatch(&conn, &method, params)
                .await
                .map_err(|e| e.to_error_body());
            match codec.write_response(seq, outcome).await {
                Ok(()) => {}
                Err(e @ CodecError::InvalidSequence(_)) => {
                    // A sequence answered twice is a server defect, never a
                    // runtime condition; surface it loudly.
                    error!(method, error = %e, "response for unknown sequence");
                }
                Err(e) => debug!(method, error = %e, "response write failed"),
            }
        }));
    }

    /// Router exposing the WebSocket upgrade and the health endpoint.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(self))
    }

    /// Bind and serve until shutdown. Returns the bound address and the
    /// acceptor task handle.
    pub async fn listen(self: &Arc<Self>) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener =
            tokio::net::TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();
        info!(%addr, "listening");
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server error");
            }
        });
        Ok((addr, handle))
    }
}

/// GET /health
async fn health_handler(State(server): State<Arc<Server>>) -> Json<HealthResponse> {
    Json(health::health_check(
        server.start_time,
        server.connection_count(),
    ))
}

/// GET /ws — upgrade and serve the connection.
async fn ws_handler(
    State(server): State<Arc<Server>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(server.config.max_message_size)
        .on_upgrade(move |socket| handle_socket(server, socket))
}

async fn handle_socket(server: Arc<Server>, socket: WebSocket) {
    let transport = WsTransport::new(
        socket,
        server.config.ping_interval(),
        server.config.ping_deadline(),
    );
    server.serve_connection(transport, Vec::new()).await;
}

//! Per-client connection: session data, close hooks, direct pushes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use duplex_rpc::types::Notification;

use crate::codec::{Codec, CodecError};
use crate::notifier::Notifier;
use crate::transport::TransportError;

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// The serve loop is reading calls.
    Serving,
    /// The serve loop has exited; close hooks are firing.
    Terminating,
    /// The codec is closed.
    Closed,
}

/// Close callback. Fires exactly once.
pub type CloseHook = Box<dyn FnOnce() + Send>;

/// A live client session.
///
/// Handlers receive the connection of the call they are serving; external
/// code may hold it to push notifications or close the session. All
/// accessors are safe for concurrent use from in-flight handler tasks.
pub struct Connection {
    id: String,
    codec: Arc<Codec>,
    data: RwLock<HashMap<String, Value>>,
    hooks: Mutex<Vec<CloseHook>>,
    notifier: OnceLock<Arc<Notifier>>,
    state: AtomicU8,
    close_signal: CancellationToken,
}

impl Connection {
    /// Create a connection over a codec.
    pub(crate) fn new(codec: Arc<Codec>) -> Arc<Self> {
        Arc::new(Self {
            id: format!("conn_{}", uuid::Uuid::now_v7().simple()),
            codec,
            data: RwLock::new(HashMap::new()),
            hooks: Mutex::new(Vec::new()),
            notifier: OnceLock::new(),
            state: AtomicU8::new(ConnState::Serving as u8),
            close_signal: CancellationToken::new(),
        })
    }

    /// Unique connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnState::Serving,
            1 => ConnState::Terminating,
            _ => ConnState::Closed,
        }
    }

    /// The connection's bounded notification queue.
    pub fn notifier(&self) -> Option<&Arc<Notifier>> {
        self.notifier.get()
    }

    pub(crate) fn set_notifier(&self, notifier: Arc<Notifier>) {
        let _ = self.notifier.set(notifier);
    }

    /// Push a notification with single-value params.
    ///
    /// Writes directly through the codec under the connection-wide write
    /// lock; blocks until the frame is on the wire. For non-blocking pushes
    /// use the [`Notifier`].
    pub async fn notify(&self, method: &str, payload: Value) -> Result<(), CodecError> {
        self.push(Notification::single(method, payload)).await
    }

    /// Push a notification with array params.
    pub async fn notify_array(&self, method: &str, items: Vec<Value>) -> Result<(), CodecError> {
        self.push(Notification::array(method, items)).await
    }

    pub(crate) async fn push(&self, notification: Notification) -> Result<(), CodecError> {
        if self.state() == ConnState::Closed {
            return Err(CodecError::Transport(TransportError::Closed));
        }
        self.codec.write_notification(&notification).await
    }

    /// Request connection teardown. Non-blocking and idempotent; the serve
    /// loop performs the actual close sequence.
    pub fn close(&self) {
        self.close_signal.cancel();
    }

    /// Resolves once `close` has been requested.
    pub(crate) async fn close_requested(&self) {
        self.close_signal.cancelled().await;
    }

    /// Register a close callback.
    ///
    /// Fires exactly once when the connection terminates. When the
    /// connection has already terminated the callback still fires exactly
    /// once — immediately, on a separate task, never inline with this call.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.hooks.lock();
        if self.state() == ConnState::Serving {
            hooks.push(Box::new(hook));
        } else {
            drop(hooks);
            drop(tokio::spawn(async move { hook() }));
        }
    }

    /// Fire every registered close hook exactly once and clear the list.
    pub(crate) fn run_close_hooks(&self) {
        let hooks = {
            let mut guard = self.hooks.lock();
            // The state flips inside the lock so a concurrent `on_close`
            // either lands in this drain or self-fires, never neither.
            self.state
                .store(ConnState::Terminating as u8, Ordering::Release);
            std::mem::take(&mut *guard)
        };
        debug!(conn_id = %self.id, hooks = hooks.len(), "running close hooks");
        for hook in hooks {
            hook();
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.state.store(ConnState::Closed as u8, Ordering::Release);
    }

    /// Session data lookup.
    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    /// Set session data for `key`.
    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        let _ = self.data.write().insert(key.into(), value);
    }

    /// Remove session data for `key`.
    pub fn del_data(&self, key: &str) {
        let _ = self.data.write().remove(key);
    }
}

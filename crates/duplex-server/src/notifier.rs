//! Bounded, ordered, non-blocking notification queue per connection.

use std::sync::{Arc, Weak};

use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use duplex_rpc::types::Notification;

use crate::connection::Connection;

/// Notifier failures.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The queue reached capacity; the connection is being closed.
    #[error("notification queue full")]
    Overflow,
    /// The queue is closed; the notification was not accepted.
    #[error("notification queue closed")]
    Closed,
}

/// Asynchronous push channel for one connection.
///
/// Enqueue never blocks the caller. A single consumer task delivers queued
/// notifications in enqueue order, one write attempt each, no retry. A full
/// queue is a backpressure failure: the queue seals and the owning
/// connection is closed, trading a lost notification for bounded memory and
/// a consistent terminal state.
pub struct Notifier {
    tx: Mutex<Option<mpsc::Sender<Notification>>>,
    conn: Weak<Connection>,
}

impl Notifier {
    /// Create a notifier for `conn` and spawn its delivery task.
    pub fn spawn(conn: &Arc<Connection>, capacity: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Notification>(capacity);
        let delivery = Arc::clone(conn);
        drop(tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                // Ownership was transferred on enqueue; it is released here
                // after the single delivery attempt.
                if let Err(e) = delivery.push(notification).await {
                    debug!(conn_id = %delivery.id(), error = %e, "notification dropped");
                }
            }
        }));
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            conn: Arc::downgrade(conn),
        })
    }

    /// Queue a notification with single-value params.
    pub fn notify(&self, method: &str, payload: Value) -> Result<(), NotifyError> {
        self.enqueue(Notification::single(method, payload))
    }

    /// Queue a notification with array params.
    pub fn notify_array(&self, method: &str, items: Vec<Value>) -> Result<(), NotifyError> {
        self.enqueue(Notification::array(method, items))
    }

    fn enqueue(&self, notification: Notification) -> Result<(), NotifyError> {
        let mut guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(NotifyError::Closed);
        };
        match tx.try_send(notification) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                // A stuck backlog means the consumer is not keeping up.
                // Seal the queue and disconnect rather than grow unbounded
                // or block the calling handler.
                *guard = None;
                counter!("rpc_notify_overflow_total").increment(1);
                if let Some(conn) = self.conn.upgrade() {
                    warn!(conn_id = %conn.id(), "notification backlog full, closing connection");
                    conn.close();
                }
                Err(NotifyError::Overflow)
            }
            Err(TrySendError::Closed(_)) => {
                *guard = None;
                Err(NotifyError::Closed)
            }
        }
    }

    /// Seal the queue. Idempotent; already-queued notifications still drain.
    pub fn close(&self) {
        let _ = self.tx.lock().take();
    }

    /// Whether the queue has been sealed.
    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

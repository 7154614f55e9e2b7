//! Graceful shutdown signalling shared by the acceptor and serve loops.

use tokio_util::sync::CancellationToken;

/// Owns the cancellation token observed by every server task.
///
/// The acceptor stops taking new connections when the token cancels; each
/// per-connection serve loop observes the same token and runs its normal
/// close sequence.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// New coordinator, not yet shut down.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown. Idempotent and non-blocking.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

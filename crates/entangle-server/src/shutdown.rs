//! Stopping the server: cancel the listener, then drain live sessions.
//!
//! Cancelling the token stops `axum::serve` from accepting and tells every
//! WebSocket driver to close its socket, which unlinks the session from the
//! registry. Sessions still registered when the drain deadline passes are
//! closed from here.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::Registry;

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Outcome of [`ShutdownCoordinator::drain`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Sessions that closed on their own before the deadline.
    pub drained: usize,
    /// Sessions still open at the deadline and closed forcibly.
    pub forced: usize,
}

/// Owns the server-wide cancellation token and the drain deadline.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Coordinator that waits up to `drain_timeout` for sessions to close.
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            drain_timeout,
        }
    }

    /// Token observed by the listener, connection drivers and background tasks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, wait for `listener` to exit, then drain `registry`'s sessions.
    ///
    /// Safe to call more than once; later calls find nothing left to drain.
    pub async fn drain(&self, registry: &Registry, listener: JoinHandle<()>) -> DrainReport {
        let initial = registry.session_count();
        self.token.cancel();
        info!(sessions = initial, timeout_ms = self.drain_timeout.as_millis(), "draining sessions");

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        if tokio::time::timeout_at(deadline, listener).await.is_err() {
            warn!("listener did not stop before the drain deadline");
        }

        let mut ticker = tokio::time::interval(DRAIN_POLL);
        while registry.session_count() > 0 && tokio::time::Instant::now() < deadline {
            let _ = ticker.tick().await;
        }

        let forced = registry.close_all();
        if forced > 0 {
            warn!(forced, "sessions still open at drain deadline, closed");
        }
        let report = DrainReport {
            drained: initial.saturating_sub(forced),
            forced,
        };
        info!(drained = report.drained, forced, "shutdown complete");
        report
    }
}

//! Activity-timeout supervision for body pumps.
//!
//! # Responsibilities
//! - Combine external cancellation with an inactivity deadline
//! - Rearm the deadline on every successful I/O operation
//! - Abort idle pumps without touching busy ones
//!
//! # Design Decisions
//! - The watchdog is a detached task watching an atomic deadline, so
//!   `reset_timeout` is a single store on the hot path
//! - The linked token fires for either cause; `timed_out` disambiguates

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Linked cancellation that fires on external cancellation or on elapsed
/// inactivity. Owned exclusively by one body pump; every successful read
/// or write must call [`reset_timeout`](Self::reset_timeout).
pub struct ActivityTimeoutToken {
    token: CancellationToken,
    deadline_ms: Arc<AtomicU64>,
    expired: Arc<AtomicBool>,
    base: Instant,
    window: Duration,
}

impl ActivityTimeoutToken {
    /// Create a token linked to `parent` with the given inactivity window.
    pub fn new(parent: &CancellationToken, window: Duration) -> Self {
        let token = parent.child_token();
        let base = Instant::now();
        let deadline_ms = Arc::new(AtomicU64::new(window.as_millis() as u64));
        let expired = Arc::new(AtomicBool::new(false));

        tokio::spawn(watchdog(
            token.clone(),
            Arc::clone(&deadline_ms),
            Arc::clone(&expired),
            base,
        ));

        Self {
            token,
            deadline_ms,
            expired,
            base,
            window,
        }
    }

    /// The linked cancellation source. Fires on external cancellation or
    /// inactivity expiry.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Rearm the inactivity timer.
    pub fn reset_timeout(&self) {
        let deadline = self.base.elapsed() + self.window;
        self.deadline_ms
            .store(deadline.as_millis() as u64, Ordering::Release);
    }

    /// True once the token fired because the inactivity window elapsed,
    /// as opposed to external cancellation.
    pub fn timed_out(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }
}

impl Drop for ActivityTimeoutToken {
    fn drop(&mut self) {
        // The pump is done with this token; releasing it reaps the
        // watchdog without cancelling the parent.
        self.token.cancel();
    }
}

async fn watchdog(
    token: CancellationToken,
    deadline_ms: Arc<AtomicU64>,
    expired: Arc<AtomicBool>,
    base: Instant,
) {
    loop {
        let deadline = base + Duration::from_millis(deadline_ms.load(Ordering::Acquire));
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {
                // The deadline may have moved while we slept.
                let current = base + Duration::from_millis(deadline_ms.load(Ordering::Acquire));
                if Instant::now() >= current {
                    expired.store(true, Ordering::Release);
                    token.cancel();
                    return;
                }
            }
        }
    }
}

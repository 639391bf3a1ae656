//! Keep-alive traffic for long-running operations
//!
//! The ECU drops its diagnostic session if it sees no traffic for about a
//! second. Bulk loops wrap each exchange in [`Heartbeat::during`], which
//! sends the keep-alive on the functional channel whenever the interval
//! elapses, including while a request is still waiting for its reply.

use std::future::Future;
use std::time::Duration;

use reflash_uds::UdsService;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Upper bound on the keep-alive interval
pub const MAX_INTERVAL: Duration = Duration::from_millis(950);

pub struct Heartbeat {
    uds: UdsService,
    interval: Duration,
    last: Instant,
    sent: u64,
}

impl Heartbeat {
    /// Intervals of a second or more are clamped to [`MAX_INTERVAL`]
    pub fn new(uds: UdsService, interval: Duration) -> Self {
        Self {
            uds,
            interval: interval.min(MAX_INTERVAL),
            last: Instant::now(),
            sent: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_due(&self) -> bool {
        self.last.elapsed() >= self.interval
    }

    /// Send the keep-alive if the interval has elapsed
    ///
    /// Returns whether a keep-alive went out.
    pub async fn poll(&mut self) -> bool {
        if !self.is_due() {
            return false;
        }
        self.beat().await;
        true
    }

    /// Drive `operation` to completion, sending keep-alives while it runs
    pub async fn during<F: Future>(&mut self, operation: F) -> F::Output {
        tokio::pin!(operation);

        loop {
            self.poll().await;
            let due = self.last + self.interval;
            tokio::select! {
                output = &mut operation => return output,
                _ = tokio::time::sleep_until(due) => {}
            }
        }
    }

    /// Send the keep-alive now and restart the interval
    ///
    /// A failed broadcast is logged only; the next physical request will
    /// surface a dead link.
    pub async fn beat(&mut self) {
        self.last = Instant::now();
        match self.uds.tester_present_broadcast().await {
            Ok(()) => {
                self.sent += 1;
                debug!(count = self.sent, "Keep-alive sent");
            }
            Err(e) => warn!(error = %e, "Keep-alive broadcast failed"),
        }
    }

    /// Number of keep-alives sent so far
    pub fn sent(&self) -> u64 {
        self.sent
    }
}

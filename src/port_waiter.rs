use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::port::PortSpec;
use crate::port_checker::PortChecker;

/// Fixed interval between listening checks
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Polls a [`PortChecker`] until a port listens or a deadline passes.
///
/// The interval is fixed, no backoff: bind latency is expected well under a
/// second and the overall timeout is short. Elapsed time is measured on the
/// monotonic clock.
pub struct PortWaiter<'a> {
    checker: &'a PortChecker,
    interval: Duration,
}

impl<'a> PortWaiter<'a> {
    pub fn new(checker: &'a PortChecker) -> Self {
        Self {
            checker,
            interval: POLL_INTERVAL,
        }
    }

    /// Returns `true` as soon as `port` is reported listening, `false` once
    /// `timeout` has elapsed without that happening.
    pub async fn wait_until_listening(&self, port: PortSpec, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self.checker.is_listening(port).await {
                debug!("{} listening after {:?} ({} checks)", port, start.elapsed(), attempts);
                return true;
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                debug!("{} still not listening after {:?} ({} checks)", port, elapsed, attempts);
                return false;
            }

            sleep(self.interval.min(timeout - elapsed)).await;
        }
    }
}

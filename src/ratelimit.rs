//! Sliding-window request admission control.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Admits at most `quota` requests within any rolling window.
///
/// `admit` never fails; it suspends the caller until the oldest stamp in
/// the window ages out. There is no burst allowance beyond the quota.
pub struct RateLimiter {
    quota: usize,
    window: Duration,
    stamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Standard per-minute limiter.
    pub fn per_minute(quota: usize) -> Self {
        Self::new(quota, Duration::from_secs(60))
    }

    pub fn new(quota: usize, window: Duration) -> Self {
        Self {
            quota: quota.max(1),
            window,
            stamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Waits until a slot is available, records the request, and returns.
    pub async fn admit(&self) {
        loop {
            let wait = {
                let mut stamps = self.stamps.lock().await;
                let now = Instant::now();
                while let Some(front) = stamps.front() {
                    if now.duration_since(*front) >= self.window {
                        stamps.pop_front();
                    } else {
                        break;
                    }
                }

                if stamps.len() < self.quota {
                    stamps.push_back(now);
                    return;
                }

                // Oldest stamp defines when the next slot opens.
                let oldest = *stamps.front().expect("window is at quota");
                self.window - now.duration_since(oldest)
            };

            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Minimum-interval request pacing.
//!
//! One [`RateLimiter`] is shared by every call a client makes, regardless of
//! table. Callers are admitted one at a time; each waits until at least
//! `min_interval` has passed since the previous admission.
//!
//! Time comes from `tokio::time`, so tests can pause and advance the clock.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Requests per second implied by the interval (0 when unlimited).
    #[must_use]
    pub fn max_rate(&self) -> f64 {
        if self.min_interval.is_zero() {
            return 0.0;
        }
        1.0 / self.min_interval.as_secs_f64()
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait for a request slot. Returns how long the caller was delayed.
    pub async fn acquire(&self) -> Duration {
        // Held across the sleep so that concurrent callers queue up behind us.
        let mut last = self.last_request.lock().await;
        let mut waited = Duration::ZERO;

        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                waited = self.min_interval - elapsed;
                trace!(wait_ms = waited.as_millis() as u64, "Rate limiter delaying request");
                sleep(waited).await;
            }
        }

        *last = Some(Instant::now());
        if !waited.is_zero() {
            crate::metrics::record_rate_limit_wait(waited);
        }
        waited
    }
}

//! Request Rate Limiting
//!
//! Throttles outbound model requests to a fixed number per sliding window.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Sliding-window rate limiter.
///
/// `acquire` returns immediately while fewer than `max_calls` requests have
/// started in the current window, otherwise it sleeps until the oldest one
/// rolls out. Single-task use only; the orchestrator serializes requests.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    starts: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
            starts: VecDeque::new(),
        }
    }

    /// Limit to `calls_per_minute` requests per 60-second window
    pub fn per_minute(calls_per_minute: usize) -> Self {
        Self::new(calls_per_minute, Duration::from_secs(60))
    }

    /// Wait until a request slot is available, then claim it
    pub async fn acquire(&mut self) {
        let now = Instant::now();
        self.evict_expired(now);

        if self.starts.len() >= self.max_calls {
            // Oldest call in the window decides when a slot frees up
            let oldest = self.starts[0];
            let ready_at = oldest + self.window;
            if ready_at > now {
                tokio::time::sleep_until(ready_at).await;
            }
            self.evict_expired(Instant::now());
        }

        self.starts.push_back(Instant::now());
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(&front) = self.starts.front() {
            if now.duration_since(front) >= self.window {
                self.starts.pop_front();
            } else {
                break;
            }
        }
    }
}

//! Sliding-window rate limiter
//!
//! `acquire` never rejects: when `max_calls` have already been issued within
//! the trailing `time_window`, the caller sleeps until the oldest call ages
//! out of the window.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::observability::TunerMetrics;

/// Blocking sliding-window rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    max_calls: usize,
    time_window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, max_calls: usize, time_window: Duration) -> Self {
        Self {
            name: name.into(),
            max_calls: max_calls.max(1),
            time_window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn time_window(&self) -> Duration {
        self.time_window
    }

    /// Wait until a call slot is free, then claim it
    pub async fn acquire(&self) {
        loop {
            let wait_until = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while let Some(oldest) = calls.front() {
                    if now.duration_since(*oldest) >= self.time_window {
                        calls.pop_front();
                    } else {
                        break;
                    }
                }

                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return;
                }

                // Full window: the front entry is the next one to expire
                match calls.front() {
                    Some(oldest) => *oldest + self.time_window,
                    None => now,
                }
            };

            TunerMetrics::new().inc_rate_limiter_wait(&self.name);
            debug!(
                limiter = %self.name,
                wait_ms = wait_until.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Rate limit reached, waiting for a free slot"
            );
            sleep_until(wait_until).await;
        }
    }

    /// Number of calls currently counted in the window
    pub async fn in_window(&self) -> usize {
        let calls = self.calls.lock().await;
        let now = Instant::now();
        calls
            .iter()
            .filter(|t| now.duration_since(**t) < self.time_window)
            .count()
    }
}

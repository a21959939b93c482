//! Process-wide venue rate limiter.
//!
//! Spaces calls evenly (default 2 calls/s) rather than bursting a token
//! bucket: the venue's limiter is a sliding window and even spacing keeps
//! us clear of it under sustained load.

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    /// `calls_per_sec` must be > 0.
    pub fn new(calls_per_sec: f64) -> Self {
        let calls = calls_per_sec.max(0.001);
        Self {
            min_interval: Duration::from_secs_f64(1.0 / calls),
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Wait until the next call slot is available.
    pub async fn acquire(&self) {
        let wait = {
            let mut next = self.next_slot.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            let wait = next.saturating_duration_since(now);
            *next = now.max(*next) + self.min_interval;
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spaces_consecutive_calls() {
        let limiter = RateLimiter::new(100.0); // 10ms spacing
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        // Third call cannot complete before 2 spacing intervals.
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn first_call_is_immediate() {
        let limiter = RateLimiter::new(1.0);
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}

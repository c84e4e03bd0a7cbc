//! Sliding-window rate limiter for venue API calls.
//!
//! A request may proceed when fewer than `permits` requests started within
//! the trailing `window`. Callers await `acquire` before every outbound
//! call; the limiter records the start instant on admission, so a burst of
//! N+1 requests sees the extra one sleep until the oldest timestamp ages
//! out of the window.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

pub struct RateLimiter {
    permits: usize,
    window: Duration,
    history: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(permits: usize, window: Duration) -> Self {
        Self {
            permits: permits.max(1),
            window,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Waits until a slot is free in the trailing window, then records
    /// the admission.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut history = self.history.lock().await;
                let now = Instant::now();
                while let Some(front) = history.front() {
                    if now.duration_since(*front) >= self.window {
                        history.pop_front();
                    } else {
                        break;
                    }
                }
                if history.len() < self.permits {
                    history.push_back(now);
                    return;
                }
                match history.front() {
                    Some(oldest) => self.window.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::ZERO,
                }
            };
            trace!(?wait, "rate limit reached, backing off");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_burst_up_to_capacity() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn excess_request_waits_for_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_rather_than_resets() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(6)).await;
        limiter.acquire().await;

        // Third request must wait only until the first admission ages out,
        // four more seconds, not a full fresh window.
        let start = Instant::now();
        limiter.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(4));
        assert!(waited < Duration::from_secs(10));
    }
}

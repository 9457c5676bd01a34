//! Global request-rate limiting shared by all download workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimiterError {
    #[error("run cancelled while waiting for a request slot")]
    Cancelled,
}

/// Request rate limiter with continuous replenishment.
///
/// Every network call, from any worker, takes one slot. Slots are handed out
/// exactly `1 / requests_per_second` apart, so the bucket holds at most one
/// token: over any window of `T` seconds no more than `rate * T + 1` requests
/// start, and an idle period never builds up a burst.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Instant>,
    issued: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter allowing `requests_per_second` on average.
    ///
    /// Non-positive or non-finite rates are treated as one request per second.
    #[must_use]
    pub fn new(requests_per_second: f64) -> Self {
        let rate = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            requests_per_second
        } else {
            1.0
        };

        Self {
            interval: Duration::from_secs_f64(1.0 / rate),
            next_slot: Mutex::new(Instant::now()),
            issued: AtomicU64::new(0),
        }
    }

    /// Spacing between consecutive slots.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next request slot.
    ///
    /// The slot is reserved before sleeping, so concurrent callers queue up in
    /// arrival order instead of polling.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterError::Cancelled`] if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), LimiterError> {
        if cancel.is_cancelled() {
            return Err(LimiterError::Cancelled);
        }

        let slot = self.reserve().await;

        tokio::select! {
            () = tokio::time::sleep_until(slot) => {
                self.issued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            () = cancel.cancelled() => Err(LimiterError::Cancelled),
        }
    }

    /// Number of slots granted so far.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    async fn reserve(&self) -> Instant {
        let now = Instant::now();
        let mut next = self.next_slot.lock().await;
        // An idle limiter restarts from `now`, which caps the burst at one.
        let slot = (*next).max(now);
        *next = slot + self.interval;
        slot
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_acquire_is_immediate() {
        let limiter = RateLimiter::new(4.0);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        limiter.acquire(&cancel).await.unwrap();

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.issued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_rate() {
        let limiter = RateLimiter::new(4.0);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..9 {
            limiter.acquire(&cancel).await.unwrap();
        }

        // Nine slots span eight intervals of 250ms.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2100), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_does_not_accumulate_burst() {
        let limiter = RateLimiter::new(2.0);
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_across_workers_sliding_window() {
        let limiter = Arc::new(RateLimiter::new(4.0));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut stamps = Vec::new();
                for _ in 0..5 {
                    limiter.acquire(&cancel).await.unwrap();
                    stamps.push(Instant::now());
                }
                stamps
            }));
        }

        let mut stamps = Vec::new();
        for handle in handles {
            stamps.extend(handle.await.unwrap());
        }
        stamps.sort();
        assert_eq!(stamps.len(), 20);

        let window = Duration::from_secs(1);
        for (i, begin) in stamps.iter().enumerate() {
            let in_window = stamps[i..]
                .iter()
                .take_while(|t| t.duration_since(*begin) < window)
                .count();
            assert!(in_window <= 5, "{in_window} requests within 1s of {:?}", begin.duration_since(start));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_while_waiting() {
        let limiter = Arc::new(RateLimiter::new(0.5));
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap(), Err(LimiterError::Cancelled));
        assert_eq!(limiter.issued(), 1);
    }

    #[test]
    fn test_invalid_rate_falls_back() {
        assert_eq!(RateLimiter::new(0.0).interval(), Duration::from_secs(1));
        assert_eq!(RateLimiter::new(f64::NAN).interval(), Duration::from_secs(1));
        assert_eq!(RateLimiter::new(4.0).interval(), Duration::from_millis(250));
    }
}

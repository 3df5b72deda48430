//! Global token-bucket rate limiter.
//!
//! Capacity and refill rate are both `RATE_LIMIT_RPS`: the bucket holds at
//! most one second of burst. Waiters queue on a tokio mutex, which hands
//! the bucket out in FIFO arrival order.

use std::time::Duration;

use {
    tokio::{
        sync::Mutex,
        time::{Instant, sleep},
    },
    tracing::debug,
};

const MAX_POLL_SLEEP: Duration = Duration::from_millis(500);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// A bucket allowing `rate_per_sec` dispatches per second.
    #[must_use]
    pub fn new(rate_per_sec: u32) -> Self {
        let rate = f64::from(rate_per_sec.max(1));
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to take one token without waiting.
    pub async fn acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.rate);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take a token, waiting at most `max_wait`. A zero wait reports the
    /// instantaneous availability.
    pub async fn acquire_with_deadline(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.acquire().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!("gave up waiting for a rate-limit token");
                return false;
            }
            // Sleep roughly one refill, never past the deadline.
            let refill = Duration::from_secs_f64(1.0 / self.rate).min(MAX_POLL_SLEEP);
            sleep(refill.min(deadline - now)).await;
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn allows_a_full_burst_then_refuses() {
        let limiter = RateLimiter::new(3);
        for _ in 0..3 {
            assert!(limiter.acquire().await);
        }
        assert!(!limiter.acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn refills_continuously_up_to_capacity() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);

        // Refill caps at the bucket size, not beyond it.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_wait_picks_up_the_next_token() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);

        let started = Instant::now();
        assert!(limiter.acquire_with_deadline(Duration::from_secs(2)).await);
        // One token refills in half a second at 2 rps.
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_deadline_reports_instantaneous_availability() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.acquire_with_deadline(Duration::ZERO).await);
        assert!(!limiter.acquire_with_deadline(Duration::ZERO).await);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_when_tokens_stay_exhausted() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.acquire().await);
        assert!(limiter.acquire_with_deadline(Duration::from_secs(2)).await);
        // The bucket is now behind by a full second of refill.
        assert!(
            !limiter
                .acquire_with_deadline(Duration::from_millis(100))
                .await
        );
    }
}

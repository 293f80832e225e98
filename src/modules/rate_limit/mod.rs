//! Process-wide request throttling.
//!
//! A token bucket gates every engine attempt. Tokens refill lazily at
//! `requests_per_minute / 60` per second up to `burst_limit`. The bucket lock
//! is held across the wait so concurrent callers queue behind each other in
//! arrival order instead of racing for the same refill.

use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

use crate::config::ConfigError;

pub const DEFAULT_REQUESTS_PER_MINUTE: f64 = 30.0;
pub const DEFAULT_BURST_LIMIT: u32 = 5;
/// Upper bound applied to [`backoff_delay`].
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub requests_per_minute: f64,
    pub burst_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            burst_limit: DEFAULT_BURST_LIMIT,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.requests_per_minute.is_finite() && self.requests_per_minute > 0.0) {
            return Err(ConfigError::InvalidRate(self.requests_per_minute));
        }
        if self.burst_limit == 0 {
            return Err(ConfigError::InvalidBurst);
        }
        Ok(())
    }

    fn tokens_per_second(&self) -> f64 {
        self.requests_per_minute / 60.0
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, rate: f64, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Token-bucket limiter shared by every fetch in the process.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            bucket: Mutex::new(Bucket {
                tokens: config.burst_limit as f64,
                last_refill: Instant::now(),
            }),
            config,
        })
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Take one token, sleeping until one is available. Returns the time spent
    /// waiting.
    pub async fn acquire(&self) -> Duration {
        let rate = self.config.tokens_per_second();
        let mut bucket = self.bucket.lock().await;
        bucket.refill(rate, self.config.burst_limit as f64);

        let mut waited = Duration::ZERO;
        if bucket.tokens < 1.0 {
            waited = Duration::from_secs_f64((1.0 - bucket.tokens) / rate);
            log::debug!("rate limit reached, waiting {:.2}s", waited.as_secs_f64());
            sleep(waited).await;
            bucket.tokens = 1.0;
            bucket.last_refill = Instant::now();
        }

        bucket.tokens -= 1.0;
        waited
    }

    /// Take a token only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut bucket) = self.bucket.try_lock() else {
            return false;
        };
        bucket.refill(self.config.tokens_per_second(), self.config.burst_limit as f64);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub async fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(self.config.tokens_per_second(), self.config.burst_limit as f64);
        bucket.tokens
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        let config = RateLimitConfig::default();
        Self {
            bucket: Mutex::new(Bucket {
                tokens: config.burst_limit as f64,
                last_refill: Instant::now(),
            }),
            config,
        }
    }
}

/// Exponential backoff with up to one second of jitter, capped at 60s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = 2f64.powi(attempt.min(16) as i32);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64((base + jitter).min(MAX_BACKOFF.as_secs_f64()))
}

/// Sleep for [`backoff_delay`] and report how long that was.
pub async fn backoff(attempt: u32) -> Duration {
    let delay = backoff_delay(attempt);
    sleep(delay).await;
    delay
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rpm: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_minute: rpm,
            burst_limit: burst,
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_free_then_waits_one_interval() {
        let limiter = limiter(60.0, 5);
        for _ in 0..5 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }

        let started = Instant::now();
        let waited = limiter.acquire().await;
        let elapsed = started.elapsed();
        assert!(waited >= Duration::from_millis(990), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(1010), "waited {waited:?}");
        assert!(elapsed >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_are_spaced_one_interval_apart() {
        let limiter = std::sync::Arc::new(limiter(60.0, 2));
        let started = Instant::now();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            tasks.spawn(async move {
                limiter.acquire().await;
                started.elapsed().as_secs_f64()
            });
        }
        let mut finished = tasks.join_all().await;
        finished.sort_by(f64::total_cmp);

        let expected = [0.0, 0.0, 1.0, 2.0, 3.0, 4.0];
        for (got, want) in finished.iter().zip(expected) {
            assert!((got - want).abs() < 0.05, "finished at {finished:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_refill_but_never_exceed_burst() {
        let limiter = limiter(60.0, 3);
        for _ in 0..3 {
            limiter.acquire().await;
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        let tokens = limiter.available_tokens().await;
        assert!((tokens - 2.0).abs() < 0.01, "tokens {tokens}");

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available_tokens().await, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_does_not_wait() {
        let limiter = limiter(30.0, 1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.try_acquire());
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert!(matches!(
            RateLimiter::new(RateLimitConfig { requests_per_minute: 0.0, burst_limit: 5 }),
            Err(ConfigError::InvalidRate(_))
        ));
        assert!(matches!(
            RateLimiter::new(RateLimitConfig { requests_per_minute: 30.0, burst_limit: 0 }),
            Err(ConfigError::InvalidBurst)
        ));
    }

    #[test]
    fn backoff_grows_and_caps() {
        for attempt in 0..5 {
            let delay = backoff_delay(attempt).as_secs_f64();
            let base = 2f64.powi(attempt as i32);
            assert!(delay >= base && delay < base + 1.0, "attempt {attempt}: {delay}");
        }
        assert_eq!(backoff_delay(10), MAX_BACKOFF);
        assert_eq!(backoff_delay(u32::MAX), MAX_BACKOFF);
    }
}

use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};

use crate::config::AppConfig;

const MIN_INTERVAL_MS: u64 = 50;

/// Enforces a minimum gap between consecutive calls through one client.
pub struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(qps: u32) -> Self {
        Self {
            min_interval: Duration::from_millis(Self::interval_ms(qps)),
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.min_interval
    }

    fn interval_ms(qps: u32) -> u64 {
        let safe_qps = qps.max(1);
        let interval_ms = (1000_f64 / safe_qps as f64).ceil() as u64;
        interval_ms.max(MIN_INTERVAL_MS)
    }

    pub async fn wait(&self) {
        let interval = self.interval();
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

/// Wait schedule for rate-limited generator calls.
///
/// Attempt `n` waits for the provider's hint when one was given, otherwise
/// `default_wait * 2^(n-1)`. Every wait is capped at `max_wait` and carries up
/// to ten percent jitter.
pub struct BackoffPolicy {
    default_wait: Duration,
    max_wait: Duration,
    max_retries: u32,
    jitter_rng: Mutex<StdRng>,
}

impl BackoffPolicy {
    pub fn new(default_wait: Duration, max_wait: Duration, max_retries: u32) -> Self {
        Self {
            default_wait,
            max_wait: max_wait.max(default_wait),
            max_retries,
            jitter_rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            Duration::from_secs(config.rate_limit_default_wait_secs),
            Duration::from_secs(config.rate_limit_max_wait_secs),
            config.rate_limit_max_retries,
        )
    }

    #[cfg(test)]
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.jitter_rng = Mutex::new(rng);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a failed `attempt` (1-based) may be followed by another.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(6);
        let base = hint
            .unwrap_or_else(|| self.default_wait.saturating_mul(1 << exponent))
            .min(self.max_wait);
        let jitter_cap = (base.as_millis() / 10) as u64;
        let jitter = if jitter_cap == 0 {
            Duration::ZERO
        } else {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..=jitter_cap))
        };
        (base + jitter).min(self.max_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_has_a_floor() {
        assert_eq!(RateLimiter::new(5).interval(), Duration::from_millis(200));
        assert_eq!(RateLimiter::new(100).interval(), Duration::from_millis(50));
        assert_eq!(RateLimiter::new(0).interval(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_consecutive_calls() {
        let limiter = RateLimiter::new(10);
        let started = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        limiter.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_secs(20), Duration::from_secs(120), 3)
            .with_rng(StdRng::seed_from_u64(7));

        let first = policy.delay(1, None);
        assert!(first >= Duration::from_secs(20) && first <= Duration::from_secs(22));
        let second = policy.delay(2, None);
        assert!(second >= Duration::from_secs(40) && second <= Duration::from_secs(44));
        assert_eq!(policy.delay(5, None), Duration::from_secs(120));
    }

    #[test]
    fn backoff_prefers_provider_hint() {
        let policy = BackoffPolicy::new(Duration::from_secs(20), Duration::from_secs(120), 3)
            .with_rng(StdRng::seed_from_u64(7));
        let delay = policy.delay(3, Some(Duration::from_secs(5)));
        assert!(delay >= Duration::from_secs(5) && delay <= Duration::from_millis(5_500));
        assert_eq!(policy.delay(1, Some(Duration::from_secs(900))), Duration::from_secs(120));
    }

    #[test]
    fn retry_ceiling_is_inclusive() {
        let policy = BackoffPolicy::new(Duration::ZERO, Duration::ZERO, 2);
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
        assert_eq!(policy.delay(1, None), Duration::ZERO);
        assert_eq!(policy.max_retries(), 2);
    }
}

//! Request pacing for the object store.
//!
//! One [`RateLimiter`] is shared by every upload worker of a [`BlobStore`](super::BlobStore).
//! Workers call [`RateLimiter::wait`] before each request and report the
//! outcome afterwards. In adaptive mode the delay doubles on throttling
//! responses and halves after a run of successes, staying within
//! `[initial_delay, max_delay]`.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStrategy {
    /// No pacing at all
    #[default]
    Off,
    /// Constant delay before every request
    Fixed,
    /// Delay adjusted from observed throttling
    Adaptive,
}

impl RateLimitStrategy {
    pub fn as_str(&self) -> &str {
        match self {
            RateLimitStrategy::Off => "off",
            RateLimitStrategy::Fixed => "fixed",
            RateLimitStrategy::Adaptive => "adaptive",
        }
    }
}

impl std::str::FromStr for RateLimitStrategy {
    type Err = rrs_common::RrsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" => Ok(RateLimitStrategy::Off),
            "fixed" | "fixed-delay" => Ok(RateLimitStrategy::Fixed),
            "adaptive" => Ok(RateLimitStrategy::Adaptive),
            other => Err(rrs_common::RrsError::parse(format!(
                "Invalid rate limit strategy: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for RateLimitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub strategy: RateLimitStrategy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive successes needed before the delay is lowered
    pub success_threshold: u32,
    pub decrease_factor: f64,
    pub increase_factor: f64,
    /// Smallest delay applied after a throttling response, even from zero
    pub min_backoff: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strategy: RateLimitStrategy::Off,
            initial_delay: Duration::ZERO,
            max_delay: Duration::from_secs(5),
            success_threshold: 10,
            decrease_factor: 0.5,
            increase_factor: 2.0,
            min_backoff: Duration::from_millis(100),
        }
    }
}

impl RateLimitConfig {
    pub fn adaptive(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: RateLimitStrategy::Adaptive,
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: RateLimitStrategy::Fixed,
            initial_delay: delay,
            max_delay: delay,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    current_delay: Duration,
    consecutive_successes: u32,
    consecutive_errors: u32,
    rate_limited_total: u64,
}

/// Point-in-time view of the limiter, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSnapshot {
    pub current_delay: Duration,
    pub consecutive_successes: u32,
    pub consecutive_errors: u32,
    pub rate_limited_total: u64,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let current_delay = match config.strategy {
            RateLimitStrategy::Off => Duration::ZERO,
            RateLimitStrategy::Fixed | RateLimitStrategy::Adaptive => config.initial_delay,
        };

        Self {
            state: Mutex::new(LimiterState {
                current_delay,
                ..LimiterState::default()
            }),
            config,
        }
    }

    pub fn disabled() -> Self {
        Self::new(RateLimitConfig::default())
    }

    pub fn strategy(&self) -> RateLimitStrategy {
        self.config.strategy
    }

    fn state(&self) -> MutexGuard<'_, LimiterState> {
        // Counters stay usable even if a worker panicked mid-update.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_delay(&self) -> Duration {
        self.state().current_delay
    }

    /// Sleep for the current pacing delay. The lock is released before sleeping.
    pub async fn wait(&self) {
        let delay = self.current_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state();
        state.consecutive_errors = 0;

        if self.config.strategy != RateLimitStrategy::Adaptive {
            return;
        }

        state.consecutive_successes += 1;
        if state.consecutive_successes >= self.config.success_threshold {
            let lowered = state.current_delay.mul_f64(self.config.decrease_factor);
            let next = lowered.max(self.config.initial_delay);
            if next != state.current_delay {
                debug!(
                    from_ms = state.current_delay.as_millis() as u64,
                    to_ms = next.as_millis() as u64,
                    "Lowering upload delay"
                );
            }
            state.current_delay = next;
            state.consecutive_successes = 0;
        }
    }

    /// Record a failed request. Only throttling responses move the delay.
    pub fn record_error(&self, is_rate_limit: bool) {
        let mut state = self.state();
        state.consecutive_errors += 1;

        if !is_rate_limit {
            return;
        }

        state.rate_limited_total += 1;
        state.consecutive_successes = 0;

        if self.config.strategy != RateLimitStrategy::Adaptive {
            return;
        }

        let raised = state
            .current_delay
            .mul_f64(self.config.increase_factor)
            .max(self.config.min_backoff)
            .min(self.config.max_delay);

        warn!(
            from_ms = state.current_delay.as_millis() as u64,
            to_ms = raised.as_millis() as u64,
            "Rate limited by object store, raising upload delay"
        );
        state.current_delay = raised;
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let state = self.state();
        LimiterSnapshot {
            current_delay: state.current_delay,
            consecutive_successes: state.consecutive_successes,
            consecutive_errors: state.consecutive_errors,
            rate_limited_total: state.rate_limited_total,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn adaptive() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::adaptive(
            Duration::ZERO,
            Duration::from_secs(2),
        ))
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("none".parse::<RateLimitStrategy>().unwrap(), RateLimitStrategy::Off);
        assert_eq!(
            "fixed-delay".parse::<RateLimitStrategy>().unwrap(),
            RateLimitStrategy::Fixed
        );
        assert_eq!(
            "Adaptive".parse::<RateLimitStrategy>().unwrap(),
            RateLimitStrategy::Adaptive
        );
        assert!("turbo".parse::<RateLimitStrategy>().is_err());
    }

    #[test]
    fn test_rate_limit_raises_from_zero() {
        let limiter = adaptive();
        limiter.record_error(true);
        assert_eq!(limiter.current_delay(), Duration::from_millis(100));
        limiter.record_error(true);
        assert_eq!(limiter.current_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let limiter = adaptive();
        for _ in 0..20 {
            limiter.record_error(true);
        }
        assert_eq!(limiter.current_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_plain_error_leaves_delay_unchanged() {
        let limiter = adaptive();
        limiter.record_error(true);
        let before = limiter.current_delay();

        limiter.record_error(false);
        limiter.record_error(false);

        let snap = limiter.snapshot();
        assert_eq!(snap.current_delay, before);
        assert_eq!(snap.consecutive_errors, 3);
        assert_eq!(snap.rate_limited_total, 1);
    }

    #[test]
    fn test_successes_lower_delay_to_floor() {
        let limiter = RateLimiter::new(RateLimitConfig::adaptive(
            Duration::from_millis(50),
            Duration::from_secs(2),
        ));
        limiter.record_error(true);
        limiter.record_error(true);
        assert_eq!(limiter.current_delay(), Duration::from_millis(200));

        for _ in 0..10 {
            limiter.record_success();
        }
        assert_eq!(limiter.current_delay(), Duration::from_millis(100));

        for _ in 0..100 {
            limiter.record_success();
        }
        assert_eq!(limiter.current_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_rate_limit_resets_success_counter() {
        let limiter = adaptive();
        limiter.record_error(true);
        for _ in 0..9 {
            limiter.record_success();
        }
        limiter.record_error(true);
        assert_eq!(limiter.snapshot().consecutive_successes, 0);
        assert_eq!(limiter.current_delay(), Duration::from_millis(200));
    }

    /// Backend throttles whenever the delay is below the threshold.
    #[test]
    fn test_converges_above_throttle_threshold() {
        let threshold = Duration::from_millis(300);
        let limiter = adaptive();
        let mut first_ok = None;
        let mut peak = Duration::ZERO;

        for call in 0..500 {
            let delay = limiter.current_delay();
            peak = peak.max(delay);
            if delay < threshold {
                limiter.record_error(true);
            } else {
                first_ok.get_or_insert(call);
                limiter.record_success();
            }
        }

        let first_ok = first_ok.expect("limiter never reached the threshold");
        assert!(first_ok < 10, "took {} calls to converge", first_ok);
        // Bounded: never more than one doubling above the threshold.
        assert!(peak < threshold * 2, "delay grew to {:?}", peak);
    }

    #[test]
    fn test_fixed_strategy_is_constant() {
        let limiter = RateLimiter::new(RateLimitConfig::fixed(Duration::from_millis(100)));
        limiter.record_error(true);
        for _ in 0..30 {
            limiter.record_success();
        }
        assert_eq!(limiter.current_delay(), Duration::from_millis(100));
        assert_eq!(limiter.snapshot().rate_limited_total, 1);
    }

    #[test]
    fn test_off_strategy_never_delays() {
        let limiter = RateLimiter::disabled();
        limiter.record_error(true);
        assert_eq!(limiter.current_delay(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_current_delay() {
        let limiter = RateLimiter::new(RateLimitConfig::fixed(Duration::from_millis(250)));
        let start = tokio::time::Instant::now();
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_shared_between_tasks() {
        let limiter = Arc::new(adaptive());
        let mut handles = Vec::new();
        for i in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    if i % 2 == 0 {
                        limiter.record_success();
                    } else {
                        limiter.record_error(false);
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(limiter.current_delay(), Duration::ZERO);
    }
}

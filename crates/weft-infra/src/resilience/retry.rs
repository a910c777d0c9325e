//! Retry policies
//!
//! Exponential backoff with optional jitter for infrastructure calls, and a
//! fixed-delay variant used by schedule dispatch.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Jitter factor (0.0 disables jitter, 1.0 is +/-100%)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }
}

/// Retry policy implementation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Same delay between every attempt, no jitter
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(RetryConfig {
            max_attempts: max_attempts.max(1),
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter_factor: 0.0,
        })
    }

    /// Exponential backoff starting at `initial_delay`
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self::new(RetryConfig::new(max_attempts).with_initial_delay(initial_delay))
    }

    /// Run the operation exactly once
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Delay to wait before retry number `retry` (1-indexed)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base = self
            .config
            .initial_delay
            .mul_f64(self.config.multiplier.powi((retry - 1) as i32));
        let capped = base.min(self.config.max_delay);

        if self.config.jitter_factor > 0.0 && !capped.is_zero() {
            let spread = capped.mul_f64(self.config.jitter_factor);
            let mut rng = rand::thread_rng();
            let offset = rng.gen_range(Duration::ZERO..=spread);
            if rng.gen_bool(0.5) {
                capped + offset
            } else {
                capped.saturating_sub(offset)
            }
        } else {
            capped
        }
    }
}

/// Run `operation` until it succeeds, the predicate rejects the error, or
/// the policy's attempts are exhausted. The last error is returned.
pub async fn retry_with<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    op_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_attempts || !should_retry(&e) {
                    return Err(e);
                }
                let delay = policy.delay_for_retry(attempt);
                warn!(
                    operation = op_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

//! Backoff for retrying failed job submissions.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Randomisation applied to the delay, so many stalled submissions do not
/// hit the scheduler in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    #[default]
    Equal,
}

/// Retry policy for cluster submission calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitRetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Growth strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for SubmitRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Equal,
        }
    }
}

impl SubmitRetryConfig {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the total attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the growth strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }
}

/// Attempt counter for one submission.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempt: usize,
}

impl RetryState {
    /// Creates a fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before the next attempt.
    #[must_use]
    pub fn delay(&self, config: &SubmitRetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let exponent = u32::try_from(self.attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = match config.backoff {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(exponent)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(exponent) + 1),
            BackoffStrategy::Constant => base,
        }
        .min(config.max_delay_ms);

        let jittered = match config.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full if delay > 0 => rand::thread_rng().gen_range(0..=delay),
            JitterStrategy::Equal if delay > 1 => {
                let half = delay / 2;
                half + rand::thread_rng().gen_range(0..=half)
            }
            _ => delay,
        };
        Duration::from_millis(jittered)
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the delay.
    Retry(Duration),
    /// Attempts are exhausted.
    GiveUp,
    /// The error is permanent.
    NotRetryable,
}

impl RetryState {
    /// Records a failed attempt and decides what to do next.
    pub fn on_failure(&mut self, config: &SubmitRetryConfig, retryable: bool) -> RetryDecision {
        self.attempt += 1;
        if !retryable {
            RetryDecision::NotRetryable
        } else if self.attempt >= config.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(self.delay(config))
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently or runs out of attempts.
///
/// Returns the last error together with the number of attempts made.
pub async fn with_retry<T, E, F, Fut, P>(
    config: &SubmitRetryConfig,
    key: &str,
    mut operation: F,
    is_retryable: P,
) -> Result<T, (E, usize)>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut state = RetryState::new();
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => match state.on_failure(config, is_retryable(&e)) {
                RetryDecision::Retry(delay) => {
                    tracing::warn!(
                        key,
                        attempt = state.attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "submission failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                    return Err((e, state.attempt));
                }
            },
        }
    }
}

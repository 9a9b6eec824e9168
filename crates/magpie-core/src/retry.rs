//! Retry/backoff decisions.
//!
//! The controller classifies errors and computes exponential backoff, but
//! never sleeps or schedules: it returns a decision the worker acts on,
//! keeping this component side-effect-free and independently testable.

use std::time::Duration;

use crate::error::AppError;

/// Per-job retry configuration with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum retry attempts; `retry_count` on a job never exceeds this.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    /// Ceiling on any single computed delay.
    pub max_backoff: Duration,
    /// Maximum random jitter added on top of the computed delay
    /// (uniform [0, jitter]). `Duration::ZERO` disables it.
    pub jitter: Duration,
    /// Parse errors give up after this many retries even when the attempt
    /// budget has room left.
    pub max_parse_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(300),
            jitter: Duration::ZERO,
            max_parse_retries: 2,
        }
    }
}

/// Decision for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp,
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff for the attempt following `retry_count` prior retries:
    /// `min(initial_delay * backoff_multiplier^retry_count, max_backoff)`
    /// plus jitter.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(retry_count as i32);
        let capped = Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()));
        if self.jitter.is_zero() {
            capped
        } else {
            capped + Duration::from_millis(rand_jitter_ms(self.jitter.as_millis() as u64))
        }
    }

    /// Decide whether a job that has already retried `retry_count` times
    /// should retry after `error`.
    pub fn decide(&self, retry_count: u32, error: &AppError) -> RetryDecision {
        if error.is_terminal() || !error.is_retryable() {
            return RetryDecision::GiveUp;
        }
        if retry_count >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        if matches!(error, AppError::Parse(_))
            && retry_count >= self.max_parse_retries.min(self.max_attempts)
        {
            return RetryDecision::GiveUp;
        }

        let mut delay = self.backoff_delay(retry_count);
        // Provider-requested cooldowns and breaker-open windows are a floor,
        // not a suggestion.
        if let Some(floor) = error.retry_floor() {
            delay = delay.max(floor);
        }
        RetryDecision::Retry { after: delay }
    }
}

// ---------------------------------------------------------------------------
// Deterministic jitter based on std — avoids pulling in the `rand` crate.
// Uses a simple xorshift seeded from the current time.
// ---------------------------------------------------------------------------

fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    // xorshift64
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}

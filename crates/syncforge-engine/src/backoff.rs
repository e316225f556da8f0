//! Error classification and retry delay policy.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use syncforge_types::error::{FetchError, FetchErrorKind};

const DEFAULT_BASE_MS: u64 = 500;
const DEFAULT_MAX_MS: u64 = 4_000;
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_JITTER: f64 = 0.1;

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Never retried, not even after the first attempt.
    Fatal,
    Retryable,
}

impl ErrorClass {
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fatal => "fatal",
            Self::Retryable => "retryable",
        })
    }
}

/// Classify a fetch failure.
///
/// Rules, first match wins: 404, 400, 401 and 403 are fatal; 429 and 5xx are
/// retryable; connection resets, refusals and timeouts are retryable; items
/// skipped by the dispatcher are fatal; everything else is retryable.
#[must_use]
pub fn classify(err: &FetchError) -> ErrorClass {
    match (err.kind, err.status) {
        (_, Some(400 | 401 | 403 | 404)) => ErrorClass::Fatal,
        (_, Some(429 | 500..=599)) => ErrorClass::Retryable,
        (
            FetchErrorKind::ConnectionReset
            | FetchErrorKind::ConnectionRefused
            | FetchErrorKind::Timeout
            | FetchErrorKind::Transport,
            _,
        ) => ErrorClass::Retryable,
        (FetchErrorKind::Skipped, _) => ErrorClass::Fatal,
        _ => ErrorClass::Retryable,
    }
}

/// Exponential backoff with symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_BASE_MS),
            max: Duration::from_millis(DEFAULT_MAX_MS),
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, for deterministic delays.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// `min(base * multiplier^(attempt-1), max)` before jitter. `attempt` is
    /// 1-based; 0 is treated as 1.
    #[must_use]
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let raw = self.base.as_secs_f64() * factor;
        if !raw.is_finite() || raw >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(raw)
        }
    }

    /// Widen `delay` by `delay * jitter * sample`, floored at zero.
    /// `sample` is expected in `[-1, 1]`.
    #[must_use]
    pub fn apply_jitter(&self, delay: Duration, sample: f64) -> Duration {
        let secs = delay.as_secs_f64();
        let jittered = secs + secs * self.jitter.clamp(0.0, 1.0) * sample.clamp(-1.0, 1.0);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Delay before retrying after failed attempt number `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.jittered(self.nominal_delay(attempt))
    }

    /// Delay honouring a source-supplied retry-after hint when present.
    /// The hint replaces the computed delay and is clamped to `max`.
    #[must_use]
    pub fn delay_for_error(&self, err: &FetchError, attempt: u32) -> Duration {
        match err.retry_after_ms {
            Some(ms) => self.jittered(Duration::from_millis(ms).min(self.max)),
            None => self.delay_for(attempt),
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let sample = rand::rng().random_range(-1.0..=1.0);
        self.apply_jitter(delay, sample)
    }
}

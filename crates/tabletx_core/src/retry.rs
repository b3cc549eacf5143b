//! Backoff strategies used between transaction attempts.
//!
//! A policy is a pure function from a failed-attempt counter to a wait. It
//! holds no state beyond its parameters and is freely shared across threads.
//!
//! Parameters are validated on construction and again when a policy is
//! deserialized, so an invalid policy cannot exist.

use crate::error::TxError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ExponentialBackoffParams")]
pub struct ExponentialBackoff {
    initial_ms: u64,
    max_ms: u64,
    jitter: f64,
    multiplier: f64,
}

#[derive(Deserialize)]
struct ExponentialBackoffParams {
    initial_ms: u64,
    max_ms: u64,
    jitter: f64,
    multiplier: f64,
}

impl TryFrom<ExponentialBackoffParams> for ExponentialBackoff {
    type Error = TxError;

    fn try_from(p: ExponentialBackoffParams) -> Result<Self, Self::Error> {
        Self::from_millis(p.initial_ms, p.max_ms, p.jitter, p.multiplier)
    }
}

impl ExponentialBackoff {
    /// Creates an exponential backoff.
    ///
    /// Requires `multiplier >= 1` and `0 <= jitter <= 1`.
    pub fn new(
        initial: Duration,
        max: Duration,
        jitter: f64,
        multiplier: f64,
    ) -> Result<Self, TxError> {
        Self::from_millis(
            duration_millis(initial),
            duration_millis(max),
            jitter,
            multiplier,
        )
    }

    fn from_millis(
        initial_ms: u64,
        max_ms: u64,
        jitter: f64,
        multiplier: f64,
    ) -> Result<Self, TxError> {
        // NaN fails both range checks.
        if !(multiplier >= 1.0) {
            return Err(TxError::invalid_argument(format!(
                "multiplier must be >= 1, got {multiplier}"
            )));
        }
        validate_jitter(jitter)?;
        Ok(Self {
            initial_ms,
            max_ms,
            jitter,
            multiplier,
        })
    }

    /// Initial delay.
    #[must_use]
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    /// Upper bound of the un-jittered delay.
    #[must_use]
    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    /// Relative jitter in `[0, 1]`.
    #[must_use]
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Growth factor per failed attempt.
    #[must_use]
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    fn calc_duration(&self, attempt: u32) -> Duration {
        let max = self.max_ms as f64;
        if attempt == 0 {
            return from_millis_f64(max.min(self.initial_ms as f64));
        }
        let base = if self.initial_ms == 0 {
            0.0
        } else {
            let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
            (self.initial_ms as f64 * self.multiplier.powi(exponent)).min(max)
        };
        from_millis_f64(apply_jitter(base, self.jitter))
    }
}

/// Constant delay with symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FixedDelayParams")]
pub struct FixedDelay {
    delay_ms: u64,
    jitter: f64,
}

#[derive(Deserialize)]
struct FixedDelayParams {
    delay_ms: u64,
    jitter: f64,
}

impl TryFrom<FixedDelayParams> for FixedDelay {
    type Error = TxError;

    fn try_from(p: FixedDelayParams) -> Result<Self, Self::Error> {
        validate_jitter(p.jitter)?;
        Ok(Self {
            delay_ms: p.delay_ms,
            jitter: p.jitter,
        })
    }
}

impl FixedDelay {
    /// Creates a fixed delay. Requires `0 <= jitter <= 1`.
    pub fn new(delay: Duration, jitter: f64) -> Result<Self, TxError> {
        validate_jitter(jitter)?;
        Ok(Self {
            delay_ms: duration_millis(delay),
            jitter,
        })
    }

    /// The constant delay.
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Relative jitter in `[0, 1]`.
    #[must_use]
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    fn calc_duration(&self, attempt: u32) -> Duration {
        let base = self.delay_ms as f64;
        if attempt == 0 {
            return from_millis_f64(base);
        }
        from_millis_f64(apply_jitter(base, self.jitter))
    }
}

/// Strategy for waiting between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// See [`ExponentialBackoff`].
    ExponentialBackoff(ExponentialBackoff),
    /// See [`FixedDelay`].
    FixedDelay(FixedDelay),
}

impl RetryPolicy {
    /// Creates an exponential backoff policy.
    pub fn exponential(
        initial: Duration,
        max: Duration,
        jitter: f64,
        multiplier: f64,
    ) -> Result<Self, TxError> {
        ExponentialBackoff::new(initial, max, jitter, multiplier).map(Self::ExponentialBackoff)
    }

    /// Default backoff: 1s initial, 2 min cap, 20% jitter, x1.6 per attempt.
    #[must_use]
    pub fn exp_backoff_default() -> Self {
        Self::ExponentialBackoff(ExponentialBackoff {
            initial_ms: 1_000,
            max_ms: 120_000,
            jitter: 0.2,
            multiplier: 1.6,
        })
    }

    /// Creates a fixed delay policy.
    pub fn fixed(delay: Duration, jitter: f64) -> Result<Self, TxError> {
        FixedDelay::new(delay, jitter).map(Self::FixedDelay)
    }

    /// Retries without waiting.
    #[must_use]
    pub fn retry_immediately() -> Self {
        Self::FixedDelay(FixedDelay {
            delay_ms: 0,
            jitter: 0.0,
        })
    }

    /// Returns how long to wait after failed attempt `attempt` (1-based).
    ///
    /// Attempt 0 is the first try and is never jittered.
    pub fn calc_duration(&self, attempt: u32) -> Duration {
        match self {
            Self::ExponentialBackoff(p) => p.calc_duration(attempt),
            Self::FixedDelay(p) => p.calc_duration(attempt),
        }
    }

    /// Returns true if both policies have identical parameters.
    #[must_use]
    pub fn is_same_as(&self, other: &RetryPolicy) -> bool {
        self == other
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exp_backoff_default()
    }
}

fn validate_jitter(jitter: f64) -> Result<(), TxError> {
    if (0.0..=1.0).contains(&jitter) {
        Ok(())
    } else {
        Err(TxError::invalid_argument(format!(
            "jitter must be within [0, 1], got {jitter}"
        )))
    }
}

fn apply_jitter(base: f64, jitter: f64) -> f64 {
    if jitter == 0.0 || base == 0.0 {
        return base;
    }
    let u: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
    base * (1.0 + jitter * u)
}

fn from_millis_f64(ms: f64) -> Duration {
    Duration::from_secs_f64(ms.max(0.0) / 1_000.0)
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

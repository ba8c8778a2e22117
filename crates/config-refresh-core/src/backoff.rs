//! Exponential backoff with jitter.
//!
//! Both replica penalties and the refresh schedule's failure recovery path
//! derive their delays from [`compute_backoff`]. The first failure always gets
//! exactly the minimum delay; later attempts draw uniformly from an envelope
//! that doubles per attempt and is capped by the configured maximum, so many
//! processes failing at the same moment do not retry in lock-step.

use std::time::Duration;

use fastrand::Rng;
use serde::Deserialize;
use thiserror::Error;

/// Minimum backoff applied when the configuration does not override it.
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(30);
/// Maximum backoff applied when the configuration does not override it.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(600);
/// Largest backoff bound a sanitised configuration keeps.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);
/// Largest exponent used when doubling the minimum backoff.
const MAX_ATTEMPT_EXPONENT: u32 = 63;
const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Errors raised while validating backoff inputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    /// A negative attempt count or duration was supplied.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Lower and upper bounds for jittered exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawBackoffConfig")]
pub struct BackoffConfig {
    /// Delay applied to the first failure and lower bound of every later delay.
    pub min_backoff: Duration,
    /// Upper bound of the exponential envelope.
    pub max_backoff: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl BackoffConfig {
    /// Builds a configuration from signed second counts, rejecting negative values.
    pub fn from_secs(min_secs: i64, max_secs: i64) -> Result<Self, BackoffError> {
        Ok(Self {
            min_backoff: non_negative_secs("min_backoff", min_secs)?,
            max_backoff: non_negative_secs("max_backoff", max_secs)?,
        })
    }
}

/// Serde shape of [`BackoffConfig`]; values are signed seconds so negatives can be rejected.
#[derive(Debug, Deserialize)]
struct RawBackoffConfig {
    min_backoff: Option<i64>,
    max_backoff: Option<i64>,
}

impl TryFrom<RawBackoffConfig> for BackoffConfig {
    type Error = BackoffError;

    fn try_from(raw: RawBackoffConfig) -> Result<Self, Self::Error> {
        let defaults = BackoffConfig::default();
        Ok(Self {
            min_backoff: match raw.min_backoff {
                Some(secs) => non_negative_secs("min_backoff", secs)?,
                None => defaults.min_backoff,
            },
            max_backoff: match raw.max_backoff {
                Some(secs) => non_negative_secs("max_backoff", secs)?,
                None => defaults.max_backoff,
            },
        })
    }
}

fn non_negative_secs(field: &str, secs: i64) -> Result<Duration, BackoffError> {
    u64::try_from(secs)
        .map(Duration::from_secs)
        .map_err(|_| BackoffError::InvalidArgument(format!("{field} must be >= 0, got {secs}s")))
}

/// Computes the backoff for `attempt` between `min_backoff` and `max_backoff`.
///
/// Returns `min_backoff` exactly when `attempt <= 1` or when the bounds leave
/// no room for jitter. Negative attempts are rejected.
pub fn compute_backoff(
    attempt: i64,
    min_backoff: Duration,
    max_backoff: Duration,
) -> Result<Duration, BackoffError> {
    compute_backoff_with_rng(&mut Rng::new(), attempt, min_backoff, max_backoff)
}

/// Same as [`compute_backoff`] but draws jitter from the supplied random source.
pub fn compute_backoff_with_rng(
    rng: &mut Rng,
    attempt: i64,
    min_backoff: Duration,
    max_backoff: Duration,
) -> Result<Duration, BackoffError> {
    if attempt < 0 {
        return Err(BackoffError::InvalidArgument(format!(
            "attempt must be >= 0, got {attempt}"
        )));
    }
    let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
    Ok(jittered_delay(rng, attempt, min_backoff, max_backoff))
}

/// Infallible core shared by the public helpers and the replica/refresh callers.
pub(crate) fn jittered_delay(
    rng: &mut Rng,
    attempt: u32,
    min_backoff: Duration,
    max_backoff: Duration,
) -> Duration {
    if attempt <= 1 || max_backoff <= min_backoff {
        return min_backoff;
    }
    let exponent = attempt.min(MAX_ATTEMPT_EXPONENT);
    let floor = min_backoff.as_nanos();
    let envelope = floor
        .saturating_mul(1u128 << exponent)
        .min(max_backoff.as_nanos());
    duration_from_nanos(rng.u128(floor..=envelope))
}

fn duration_from_nanos(nanos: u128) -> Duration {
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
    // Remainder is always below one second.
    let subsec = (nanos % NANOS_PER_SEC) as u32;
    Duration::new(secs, subsec)
}

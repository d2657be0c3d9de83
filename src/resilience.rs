//! Resilience configuration and the backoff calculator it drives.
//!
//! Grounded on `xds-client::client::retry`: the same validated,
//! consuming-builder shape, generalized from a single xDS reconnect
//! sequence to a discovery-round backoff, and extended with ±10%
//! jitter and a configurable set of refresh-triggering status codes.

use std::time::Duration;

use rand::Rng;
use tonic::Code;

use crate::error::{Error, Result};

/// Timeout, retry, and refresh-trigger configuration for a cluster
/// channel.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Per-subscription-attempt inactivity deadline. Resets on every
    /// delivered snapshot.
    pub timeout: Duration,

    /// Maximum number of discovery rounds attempted (across all seeds)
    /// before surfacing `Error::ClusterDiscovery`.
    pub max_discovery_attempts: usize,

    /// Initial backoff between discovery rounds.
    pub initial_backoff: Duration,

    /// Ceiling backoff never exceeded regardless of attempt count.
    pub max_backoff: Duration,

    /// Status codes that the refresh trigger interceptor treats as a
    /// signal that the topology may be stale.
    pub refresh_on_status_codes: Vec<Code>,
}

impl ResilienceConfig {
    /// Validate and construct a resilience configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoadBalancingConfiguration`] if `initial_backoff`
    /// is zero or greater than `max_backoff`, or if
    /// `max_discovery_attempts` is zero.
    pub fn new(
        timeout: Duration,
        max_discovery_attempts: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Result<Self> {
        if max_discovery_attempts == 0 {
            return Err(Error::LoadBalancingConfiguration(
                "max_discovery_attempts must be at least 1".into(),
            ));
        }
        if initial_backoff.is_zero() {
            return Err(Error::LoadBalancingConfiguration(
                "initial_backoff must be greater than zero".into(),
            ));
        }
        if max_backoff < initial_backoff {
            return Err(Error::LoadBalancingConfiguration(format!(
                "max_backoff ({max_backoff:?}) must be >= initial_backoff ({initial_backoff:?})"
            )));
        }

        Ok(Self {
            timeout,
            max_discovery_attempts,
            initial_backoff,
            max_backoff,
            refresh_on_status_codes: default_refresh_codes(),
        })
    }

    /// Override the status codes that trigger a refresh.
    pub fn with_refresh_on_status_codes(mut self, codes: Vec<Code>) -> Self {
        self.refresh_on_status_codes = codes;
        self
    }

    /// Compute the (jittered) backoff duration for `attempt` (1-indexed):
    /// `min(initial_backoff * 2^(attempt-1), max_backoff)`, perturbed by
    /// ±10% jitter. Never negative; the exponent saturates so overflow
    /// cannot occur.
    pub fn backoff_for_attempt(&self, attempt: usize) -> Duration {
        backoff_duration(self.initial_backoff, self.max_backoff, attempt)
    }
}

impl Default for ResilienceConfig {
    /// Defaults mirror gRFC A6-derived retry defaults: 1s initial
    /// backoff, 30s max, doubling each round.
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_discovery_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            refresh_on_status_codes: default_refresh_codes(),
        }
    }
}

pub(crate) fn default_refresh_codes() -> Vec<Code> {
    vec![Code::Unavailable, Code::DeadlineExceeded, Code::Aborted]
}

/// Exponential backoff with a fixed multiplier of 2, capped at
/// `max_backoff`, with the exponent saturating rather than overflowing.
fn base_backoff(initial_backoff: Duration, max_backoff: Duration, attempt: usize) -> Duration {
    // attempt is 1-indexed; attempt 1 => initial_backoff unscaled.
    let exponent = attempt.saturating_sub(1);
    // 2^exponent as f64 saturates to infinity well before exponent does,
    // at which point `mul_f64` saturates the duration too; either way we
    // clamp to max_backoff below.
    let multiplier = 2f64.powi(exponent.min(1024) as i32);
    let scaled = initial_backoff.mul_f64(multiplier);
    scaled.min(max_backoff)
}

/// Jittered backoff: `base * [0.9, 1.1]`, never negative, never above
/// `max_backoff * 1.1`.
fn backoff_duration(initial_backoff: Duration, max_backoff: Duration, attempt: usize) -> Duration {
    let base = base_backoff(initial_backoff, max_backoff, attempt);
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    base.mul_f64(jitter)
}

/// Stateful backoff calculator used by the polling adapter and the
/// discovery round loop.
///
/// Adapted from `xds-client::client::retry::Backoff`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    attempt: usize,
}

impl Backoff {
    /// Create a new backoff calculator.
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            attempt: 0,
        }
    }

    /// Build a calculator from a [`ResilienceConfig`].
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(config.initial_backoff, config.max_backoff)
    }

    /// The next backoff duration, advancing the internal attempt counter.
    pub fn next_backoff(&mut self) -> Duration {
        self.attempt += 1;
        backoff_duration(self.initial_backoff, self.max_backoff, self.attempt)
    }

    /// Reset after a successful operation, so the next failure starts
    /// from `initial_backoff` again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The current attempt count (number of times `next_backoff` has
    /// been called since the last `reset`).
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_within_jitter_band() {
        let cfg = ResilienceConfig::new(
            Duration::from_secs(1),
            3,
            Duration::from_millis(100),
            Duration::from_secs(1),
        )
        .unwrap();

        for attempt in 1..=10 {
            let d = cfg.backoff_for_attempt(attempt);
            let unjittered = base_backoff(cfg.initial_backoff, cfg.max_backoff, attempt);
            let lower = unjittered.mul_f64(0.9);
            let upper = unjittered.mul_f64(1.1);
            assert!(d >= lower && d <= upper, "attempt {attempt}: {d:?} not in [{lower:?}, {upper:?}]");
            assert!(d >= Duration::ZERO);
        }
    }

    #[test]
    fn backoff_saturates_at_max_backoff() {
        let max = Duration::from_secs(1);
        let d = base_backoff(Duration::from_millis(100), max, 1000);
        assert_eq!(d, max);
    }

    #[test]
    fn rejects_zero_initial_backoff() {
        assert!(ResilienceConfig::new(
            Duration::from_secs(1),
            1,
            Duration::ZERO,
            Duration::from_secs(1)
        )
        .is_err());
    }

    #[test]
    fn rejects_max_less_than_initial() {
        assert!(ResilienceConfig::new(
            Duration::from_secs(1),
            1,
            Duration::from_secs(2),
            Duration::from_secs(1)
        )
        .is_err());
    }

    #[test]
    fn stateful_backoff_resets() {
        let mut b = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        b.next_backoff();
        b.next_backoff();
        assert_eq!(b.attempt(), 2);
        b.reset();
        assert_eq!(b.attempt(), 0);
    }

    #[test]
    fn default_refresh_codes_cover_typical_transient_errors() {
        let cfg = ResilienceConfig::default();
        assert!(cfg.refresh_on_status_codes.contains(&Code::Unavailable));
        assert!(cfg.refresh_on_status_codes.contains(&Code::DeadlineExceeded));
    }
}

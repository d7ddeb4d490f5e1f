//! Delay computation between polls: steady interval after a success, exponential backoff after
//! failures, and jitter on top of both.
use std::{sync::Arc, time::Duration};

use rand::{thread_rng, Rng};

/// A source of randomness for jitter. Must return a value in `[0, 1)`. The added delay grows with
/// the distance from `0.5`, which adds none.
pub type JitterSource = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Default [`JitterSource`] backed by the thread-local RNG.
pub fn thread_rng_jitter() -> JitterSource {
    Arc::new(|| thread_rng().gen_range(0.0..1.0))
}

/// Timing parameters for [`BackoffController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BackoffPolicy {
    /// Steady-state delay between polls. Also the lower bound of any backoff delay.
    pub interval: Duration,
    /// Backoff after the first failure, doubled for each further consecutive failure.
    pub initial_backoff: Duration,
    /// Upper bound of the exponential part of the backoff.
    pub max_backoff: Duration,
    /// Full width of the jitter window.
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(1);

    pub fn new(interval: Duration) -> BackoffPolicy {
        BackoffPolicy {
            interval,
            initial_backoff: BackoffPolicy::INITIAL_BACKOFF,
            max_backoff: BackoffPolicy::MAX_BACKOFF,
            jitter: BackoffPolicy::DEFAULT_JITTER,
        }
    }
}

/// Tracks consecutive poll failures and computes the delay before the next poll.
pub(crate) struct BackoffController {
    policy: BackoffPolicy,
    consecutive_errors: u32,
    jitter_source: JitterSource,
}

impl BackoffController {
    pub fn new(policy: BackoffPolicy, jitter_source: JitterSource) -> BackoffController {
        BackoffController {
            policy,
            consecutive_errors: 0,
            jitter_source,
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Reset the failure count and return the steady-state delay.
    pub fn on_success(&mut self) -> Duration {
        self.consecutive_errors = 0;
        self.jitter(self.policy.interval)
    }

    /// Record a failure and return the backoff delay.
    pub fn on_failure(&mut self) -> Duration {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);

        let factor = 2u32.saturating_pow(self.consecutive_errors - 1);
        let exponential = self
            .policy
            .initial_backoff
            .saturating_mul(factor)
            .min(self.policy.max_backoff);

        self.jitter(exponential.max(self.policy.interval))
    }

    /// Add up to half of `policy.jitter` to `delay`. Both halves of the source's range map onto
    /// the same positive offsets, so every draw except the exact midpoint adds some delay.
    fn jitter(&self, delay: Duration) -> Duration {
        let offset = ((self.jitter_source)().clamp(0.0, 1.0) - 0.5).abs();
        delay.saturating_add(self.policy.jitter.mul_f64(offset))
    }
}

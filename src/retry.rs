//! Retry policy: pure backoff and termination arithmetic.

use std::time::Duration;

use crate::proto::{duration_from_proto, RetryConfig};

pub const DEFAULT_MAX_ATTEMPTS: i32 = 100;
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(3600);
pub const DEFAULT_MAX_DOUBLINGS: u32 = 16;

/// Backoff progression for a queue's failed dispatches.
///
/// The policy is stateless; callers feed it the task's dispatch count and the
/// time elapsed since its first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total dispatches allowed; -1 means unlimited.
    pub max_attempts: i32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub max_doublings: u32,
    /// When set, retries stop once this much time has passed since the first
    /// attempt.
    pub max_retry_duration: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_doublings: DEFAULT_MAX_DOUBLINGS,
            max_retry_duration: None,
        }
    }
}

impl RetryPolicy {
    /// Builds a policy from a queue's retry config, filling unset fields with
    /// the service defaults.
    pub fn from_config(config: &RetryConfig) -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: if config.max_attempts == 0 {
                defaults.max_attempts
            } else {
                config.max_attempts
            },
            min_backoff: config
                .min_backoff
                .as_ref()
                .map(duration_from_proto)
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.min_backoff),
            max_backoff: config
                .max_backoff
                .as_ref()
                .map(duration_from_proto)
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.max_backoff),
            max_doublings: if config.max_doublings <= 0 {
                defaults.max_doublings
            } else {
                config.max_doublings as u32
            },
            max_retry_duration: config
                .max_retry_duration
                .as_ref()
                .map(duration_from_proto)
                .filter(|d| !d.is_zero()),
        }
    }

    /// Delay before retry number `attempt` (zero-based):
    /// `clamp(min_backoff * 2^min(attempt, max_doublings), min_backoff, max_backoff)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.max_doublings);
        let delay = self
            .min_backoff
            .saturating_mul(2u32.saturating_pow(exponent));
        // Not `clamp`: a config with min_backoff > max_backoff must not panic
        delay.min(self.max_backoff).max(self.min_backoff)
    }

    /// Decides whether another dispatch may run after a failure.
    ///
    /// `dispatch_count` is the number of dispatches already completed;
    /// `elapsed` is the time since the first attempt began. Returns the delay
    /// until the next attempt, or `None` when the task is exhausted.
    pub fn next_backoff(&self, dispatch_count: i32, elapsed: Option<Duration>) -> Option<Duration> {
        if self.max_attempts >= 0 && dispatch_count >= self.max_attempts {
            return None;
        }
        if let (Some(limit), Some(elapsed)) = (self.max_retry_duration, elapsed) {
            if elapsed > limit {
                return None;
            }
        }
        Some(self.backoff(dispatch_count.max(1) as u32 - 1))
    }
}

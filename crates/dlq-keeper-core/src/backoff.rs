//! Inter-attempt delays for broker replay retries.

use crate::rules::RuleAction;
use std::time::Duration;

/// Delay policy between replay attempts
///
/// # Examples
///
/// ```rust
/// use dlq_keeper_core::backoff::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1));
///
/// assert_eq!(policy.delay_for(0), Duration::from_millis(100));
/// assert_eq!(policy.delay_for(2), Duration::from_millis(400));
/// assert_eq!(policy.delay_for(10), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,

    /// Cap applied to exponential delays
    pub max_delay: Duration,

    /// Double the delay after every attempt; otherwise use `base_delay` throughout
    pub exponential: bool,
}

impl BackoffPolicy {
    /// Doubling delays capped at `max_delay`
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            exponential: true,
        }
    }

    /// The same delay between every attempt
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            exponential: false,
        }
    }

    /// Policy for a rule action, using configured base and cap
    pub fn for_action(action: &RuleAction, base_delay: Duration, max_delay: Duration) -> Self {
        if action.exponential_backoff {
            Self::exponential(base_delay, max_delay)
        } else {
            Self::fixed(base_delay)
        }
    }

    /// Delay to wait after failed attempt number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.base_delay;
        }

        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;

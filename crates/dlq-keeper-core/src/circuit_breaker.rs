//! Success-rate circuit breaker for auto-replay rules.
//!
//! A rule whose recent replays mostly fail is probably misconfigured, for
//! example replaying poison messages that dead-letter again immediately.
//! The breaker looks at the rule's most recent replay attempts and trips
//! when the success rate falls below the configured threshold.
//!
//! Assessment is pure; disabling the rule and recording the event is done by
//! the executor so that only one caller acts on a trip.

use crate::history::ReplayHistory;
use crate::ValidationError;
use serde::{Deserialize, Serialize};

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of most recent attempts considered
    pub window_size: usize,

    /// Trip when the success rate is strictly below this value
    pub min_success_rate: f64,

    /// Attempts required before the breaker may trip
    pub minimum_samples: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            min_success_rate: 0.30,
            minimum_samples: 10,
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate thresholds
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.window_size == 0 {
            return Err(ValidationError::OutOfRange {
                field: "circuit_breaker.window_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.min_success_rate) {
            return Err(ValidationError::OutOfRange {
                field: "circuit_breaker.min_success_rate".to_string(),
                message: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.minimum_samples > self.window_size {
            return Err(ValidationError::OutOfRange {
                field: "circuit_breaker.minimum_samples".to_string(),
                message: "must not exceed window_size".to_string(),
            });
        }
        Ok(())
    }
}

/// Success statistics over a window of attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleHealth {
    pub attempts: usize,
    pub successes: usize,
    pub success_rate: f64,
}

impl RuleHealth {
    /// Compute statistics over history rows, ignoring non-attempt rows
    pub fn from_history(history: &[ReplayHistory]) -> Self {
        let attempts: Vec<&ReplayHistory> = history.iter().filter(|h| h.is_attempt()).collect();
        let successes = attempts.iter().filter(|h| h.is_success()).count();
        let success_rate = if attempts.is_empty() {
            1.0
        } else {
            successes as f64 / attempts.len() as f64
        };

        Self {
            attempts: attempts.len(),
            successes,
            success_rate,
        }
    }
}

/// Outcome of a breaker assessment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreakerDecision {
    /// Success rate at or above the threshold
    Healthy(RuleHealth),
    /// Not enough attempts to judge
    InsufficientSamples(RuleHealth),
    /// Success rate below the threshold; the rule should be disabled
    Trip(RuleHealth),
}

impl BreakerDecision {
    pub fn should_trip(&self) -> bool {
        matches!(self, Self::Trip(_))
    }

    pub fn health(&self) -> RuleHealth {
        match self {
            Self::Healthy(h) | Self::InsufficientSamples(h) | Self::Trip(h) => *h,
        }
    }
}

/// Stateless breaker evaluating recent rule history
#[derive(Debug, Clone, Default)]
pub struct RuleCircuitBreaker {
    config: CircuitBreakerConfig,
}

impl RuleCircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config }
    }

    /// Number of recent attempts to load for an assessment
    pub fn window_size(&self) -> usize {
        self.config.window_size
    }

    /// Assess the most recent attempts of a rule, newest first
    ///
    /// Only the first `window_size` attempt rows are considered.
    pub fn assess(&self, recent: &[ReplayHistory]) -> BreakerDecision {
        let window: Vec<ReplayHistory> = recent
            .iter()
            .filter(|h| h.is_attempt())
            .take(self.config.window_size)
            .cloned()
            .collect();
        let health = RuleHealth::from_history(&window);

        if health.attempts < self.config.minimum_samples.max(1) {
            BreakerDecision::InsufficientSamples(health)
        } else if health.success_rate < self.config.min_success_rate {
            BreakerDecision::Trip(health)
        } else {
            BreakerDecision::Healthy(health)
        }
    }
}

#[cfg(test)]
#[path = "circuit_breaker_tests.rs"]
mod tests;

//! Per-rule sliding window rate limiting.
//!
//! Each rule owns a window of replay reservation times guarded by its own
//! mutex. The outer map lock is held only long enough to look up or insert
//! a rule's window, so replays for different rules never contend.
//!
//! The map is bounded: once `max_tracked_rules` windows exist, inserting a
//! new one evicts the least recently touched window.

use crate::{RuleId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::debug;

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Length of the sliding window
    pub window_seconds: u64,

    /// Maximum number of rules with a tracked window
    pub max_tracked_rules: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 3600,
            max_tracked_rules: 10_000,
        }
    }
}

/// Result of a slot reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// A slot was reserved
    Allowed,
    /// The window is full; a slot frees up after `retry_after`
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

struct RuleWindow {
    events: Mutex<VecDeque<Timestamp>>,
    /// Microseconds since the epoch of the last reservation attempt
    last_touched: AtomicI64,
}

impl RuleWindow {
    fn new(now: Timestamp) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            last_touched: AtomicI64::new(micros(now)),
        }
    }
}

fn micros(ts: Timestamp) -> i64 {
    ts.as_datetime().timestamp_micros()
}

/// Sliding window limiter keyed by rule
pub struct RateLimiter {
    window: Duration,
    max_tracked: usize,
    entries: RwLock<HashMap<RuleId, Arc<RuleWindow>>>,
}

impl RateLimiter {
    /// Create a limiter with the given window and capacity
    pub fn new(window: Duration, max_tracked: usize) -> Self {
        Self {
            window,
            max_tracked: max_tracked.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Create a limiter from configuration
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            Duration::from_secs(config.window_seconds),
            config.max_tracked_rules,
        )
    }

    /// Reserve a replay slot for `rule_id` if fewer than `limit` exist in the window
    pub fn try_acquire(&self, rule_id: &RuleId, limit: u32) -> RateDecision {
        self.try_acquire_at(rule_id, limit, Timestamp::now())
    }

    /// Reserve a slot as of `now`
    pub fn try_acquire_at(&self, rule_id: &RuleId, limit: u32, now: Timestamp) -> RateDecision {
        let window = self.window_for(rule_id, now);
        window.last_touched.store(micros(now), Ordering::Relaxed);

        let mut events = window.events.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = now.subtract_duration(self.window);
        while events.front().is_some_and(|t| *t <= cutoff) {
            events.pop_front();
        }

        if events.len() < limit as usize {
            events.push_back(now);
            return RateDecision::Allowed;
        }

        let retry_after = events
            .front()
            .map(|oldest| oldest.add_duration(self.window).duration_since(now))
            .unwrap_or(self.window);
        RateDecision::Limited { retry_after }
    }

    /// Reservations currently inside the window for a rule
    pub fn count(&self, rule_id: &RuleId) -> usize {
        self.count_at(rule_id, Timestamp::now())
    }

    /// Reservations inside the window ending at `now`
    pub fn count_at(&self, rule_id: &RuleId, now: Timestamp) -> usize {
        let window = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries.get(rule_id).cloned()
        };
        let Some(window) = window else {
            return 0;
        };

        let cutoff = now.subtract_duration(self.window);
        let events = window.events.lock().unwrap_or_else(|e| e.into_inner());
        events.iter().filter(|t| **t > cutoff).count()
    }

    /// Number of rules with a tracked window
    pub fn tracked_rules(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Drop the window of a rule, e.g. after it was deleted
    pub fn forget(&self, rule_id: &RuleId) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(rule_id);
    }

    fn window_for(&self, rule_id: &RuleId, now: Timestamp) -> Arc<RuleWindow> {
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            if let Some(window) = entries.get(rule_id) {
                return window.clone();
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(window) = entries.get(rule_id) {
            return window.clone();
        }

        if entries.len() >= self.max_tracked {
            let oldest = entries
                .iter()
                .min_by_key(|(_, w)| w.last_touched.load(Ordering::Relaxed))
                .map(|(id, _)| *id);
            if let Some(evicted) = oldest {
                entries.remove(&evicted);
                debug!(rule_id = %evicted, "Evicted rate limit window");
            }
        }

        let window = Arc::new(RuleWindow::new(now));
        entries.insert(*rule_id, window.clone());
        window
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

#[cfg(test)]
#[path = "rate_limit_tests.rs"]
mod tests;

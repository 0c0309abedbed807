//! Append-only replay audit trail.
//!
//! One immutable [`ReplayHistory`] row is written per replay attempt. Circuit
//! breaker disablements are also recorded here so the audit trail explains
//! why a rule stopped acting, but they are not replay attempts and never
//! count towards a rule's success rate.

use crate::{DlqMessageId, ReplayHistoryId, RuleId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a replay was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplayStrategy {
    /// Single message replayed on operator request
    Manual,
    /// Replayed by a matching rule during a scan cycle
    AutoReplay,
    /// Replayed by a bulk replay of all messages matching a rule
    ReplayAll,
    /// Rule disablement event written by the circuit breaker
    CircuitBreaker,
}

impl ReplayStrategy {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "Manual",
            Self::AutoReplay => "AutoReplay",
            Self::ReplayAll => "ReplayAll",
            Self::CircuitBreaker => "CircuitBreaker",
        }
    }
}

impl fmt::Display for ReplayStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a replay attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Success,
    Failed,
}

/// One immutable audit row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayHistory {
    pub id: ReplayHistoryId,
    pub dlq_message_id: DlqMessageId,
    /// `None` for manual replays
    pub rule_id: Option<RuleId>,
    pub replayed_at: Timestamp,
    pub replayed_by: String,
    pub replay_strategy: ReplayStrategy,
    pub replayed_to_entity: String,
    pub outcome_status: OutcomeStatus,
    pub new_dead_letter_reason: Option<String>,
    pub error_details: Option<String>,
}

impl ReplayHistory {
    /// Record a successful replay attempt
    pub fn success(
        dlq_message_id: DlqMessageId,
        rule_id: Option<RuleId>,
        replayed_by: impl Into<String>,
        strategy: ReplayStrategy,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: ReplayHistoryId::new(),
            dlq_message_id,
            rule_id,
            replayed_at: Timestamp::now(),
            replayed_by: replayed_by.into(),
            replay_strategy: strategy,
            replayed_to_entity: target.into(),
            outcome_status: OutcomeStatus::Success,
            new_dead_letter_reason: None,
            error_details: None,
        }
    }

    /// Record a failed replay attempt
    pub fn failure(
        dlq_message_id: DlqMessageId,
        rule_id: Option<RuleId>,
        replayed_by: impl Into<String>,
        strategy: ReplayStrategy,
        target: impl Into<String>,
        error_details: impl Into<String>,
    ) -> Self {
        Self {
            outcome_status: OutcomeStatus::Failed,
            error_details: Some(error_details.into()),
            ..Self::success(dlq_message_id, rule_id, replayed_by, strategy, target)
        }
    }

    /// Record a circuit breaker disablement of `rule_id`
    ///
    /// `dlq_message_id` is the message whose replay triggered the evaluation.
    pub fn rule_disabled(
        dlq_message_id: DlqMessageId,
        rule_id: RuleId,
        target: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self::failure(
            dlq_message_id,
            Some(rule_id),
            "circuit-breaker",
            ReplayStrategy::CircuitBreaker,
            target,
            details,
        )
    }

    /// Whether this row is a replay attempt rather than a disablement event
    pub fn is_attempt(&self) -> bool {
        self.replay_strategy != ReplayStrategy::CircuitBreaker
    }

    /// Whether this row records a successful replay
    pub fn is_success(&self) -> bool {
        self.outcome_status == OutcomeStatus::Success
    }
}

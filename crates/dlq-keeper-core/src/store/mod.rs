//! Persistence abstractions for detected messages, rules and replay history.
//!
//! The engine talks to storage only through the repository traits in this
//! module. Every method that changes a row is atomic with respect to that
//! row, so concurrent executors can rely on the store for compare-and-set
//! status transitions and rule counter updates.
//!
//! Rule conditions and actions cross the storage boundary as JSON; inside
//! the engine they are always typed values.

use crate::dlq_message::{DlqMessage, FailureCategory, MessageStatus};
use crate::history::{OutcomeStatus, ReplayHistory, ReplayStrategy};
use crate::rules::AutoReplayRule;
use crate::{DlqMessageId, NamespaceId, RuleId, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

mod memory;
pub use memory::InMemoryDlqStore;

// ============================================================================
// Query Types
// ============================================================================

/// Filter for listing detected messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageFilter {
    pub namespace_id: Option<NamespaceId>,
    pub entity_name: Option<String>,
    pub status: Option<MessageStatus>,
    pub failure_category: Option<FailureCategory>,
}

impl MessageFilter {
    /// Active messages in one namespace
    pub fn active_in(namespace_id: &NamespaceId) -> Self {
        Self {
            namespace_id: Some(namespace_id.clone()),
            status: Some(MessageStatus::Active),
            ..Default::default()
        }
    }

    /// Whether a message passes the filter
    pub fn matches(&self, message: &DlqMessage) -> bool {
        self.namespace_id
            .as_ref()
            .is_none_or(|ns| *ns == message.namespace_id)
            && self
                .entity_name
                .as_ref()
                .is_none_or(|e| *e == message.entity_name)
            && self.status.is_none_or(|s| s == message.status)
            && self
                .failure_category
                .is_none_or(|c| c == message.failure_category)
    }
}

/// Filter for querying replay history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub dlq_message_id: Option<DlqMessageId>,
    pub rule_id: Option<RuleId>,
    pub outcome_status: Option<OutcomeStatus>,
    pub strategy: Option<ReplayStrategy>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
}

impl HistoryFilter {
    /// Whether an entry passes the filter
    pub fn matches(&self, entry: &ReplayHistory) -> bool {
        self.dlq_message_id
            .is_none_or(|id| id == entry.dlq_message_id)
            && self.rule_id.is_none_or(|id| Some(id) == entry.rule_id)
            && self.outcome_status.is_none_or(|s| s == entry.outcome_status)
            && self.strategy.is_none_or(|s| s == entry.replay_strategy)
            && self.since.is_none_or(|t| entry.replayed_at >= t)
            && self.until.is_none_or(|t| entry.replayed_at < t)
    }
}

/// Offset pagination request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Pagination {
    /// Maximum page size accepted
    pub const MAX_LIMIT: usize = 1000;

    /// Create a pagination request, clamping the limit to `1..=MAX_LIMIT`
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(0, 50)
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total number of matching items across all pages
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

// ============================================================================
// Repository Traits
// ============================================================================

/// Storage of detected dead-lettered messages
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a message unless one exists for its (namespace, entity, sequence number)
    ///
    /// Returns `true` when the row was inserted.
    async fn insert_if_absent(&self, message: DlqMessage) -> Result<bool, StoreError>;

    /// Get a message by id
    async fn get_message(&self, id: &DlqMessageId) -> Result<Option<DlqMessage>, StoreError>;

    /// Find a message by its broker key
    async fn find_by_key(
        &self,
        namespace_id: &NamespaceId,
        entity_name: &str,
        sequence_number: i64,
    ) -> Result<Option<DlqMessage>, StoreError>;

    /// List messages in detection order
    async fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<DlqMessage>, StoreError>;

    /// Transition an Active message to Replayed
    ///
    /// Fails with `StoreError::StatusConflict` when the message is not Active.
    async fn mark_replayed(
        &self,
        id: &DlqMessageId,
        at: Timestamp,
    ) -> Result<DlqMessage, StoreError>;

    /// Record a failed replay on an Active message, leaving it Active
    async fn mark_replay_failed(
        &self,
        id: &DlqMessageId,
        at: Timestamp,
    ) -> Result<DlqMessage, StoreError>;

    /// Archive a message that is not already archived
    async fn archive_message(
        &self,
        id: &DlqMessageId,
        at: Timestamp,
    ) -> Result<DlqMessage, StoreError>;

    /// Replace the user notes of a message
    async fn update_notes(
        &self,
        id: &DlqMessageId,
        notes: Option<String>,
    ) -> Result<DlqMessage, StoreError>;

    /// Mark rows of an entity that were not observed in a complete DLQ snapshot
    ///
    /// Rows with `resolved_at` unset whose sequence number is not in
    /// `observed` get `resolved_at = at`. Active rows also become Resolved.
    /// Returns the number of rows updated.
    async fn resolve_missing(
        &self,
        namespace_id: &NamespaceId,
        entity_name: &str,
        observed: &HashSet<i64>,
        at: Timestamp,
    ) -> Result<u64, StoreError>;
}

/// Storage of auto-replay rules
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert a new rule
    async fn insert_rule(&self, rule: AutoReplayRule) -> Result<(), StoreError>;

    /// Get a rule by id
    async fn get_rule(&self, id: &RuleId) -> Result<Option<AutoReplayRule>, StoreError>;

    /// List rules in creation order
    async fn list_rules(&self) -> Result<Vec<AutoReplayRule>, StoreError>;

    /// Replace the user-editable fields of a rule
    ///
    /// Counters are preserved; `enabled` is taken from `rule`. Fails with
    /// `EnabledConflict`, changing nothing, when the stored flag no longer
    /// equals `expected_enabled`.
    async fn update_rule(
        &self,
        rule: AutoReplayRule,
        expected_enabled: bool,
    ) -> Result<AutoReplayRule, StoreError>;

    /// Delete a rule, returning whether it existed
    async fn delete_rule(&self, id: &RuleId) -> Result<bool, StoreError>;

    /// Set the enabled flag only if it still equals `expected`
    ///
    /// Returns `false`, leaving the flag untouched, when another writer
    /// changed it first.
    async fn set_enabled_if(
        &self,
        id: &RuleId,
        expected: bool,
        enabled: bool,
    ) -> Result<bool, StoreError>;

    /// Atomically clear the enabled flag
    ///
    /// Returns `true` only for the caller that changed it from enabled.
    async fn disable_if_enabled(&self, id: &RuleId) -> Result<bool, StoreError>;

    /// Atomically add to the rule's match and success counters
    async fn increment_counters(
        &self,
        id: &RuleId,
        matched: u64,
        succeeded: u64,
    ) -> Result<(), StoreError>;
}

/// Append-only replay audit trail
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append an entry
    ///
    /// Fails with `StoreError::ForeignKey` when the message or rule does not exist.
    async fn append_history(&self, entry: ReplayHistory) -> Result<(), StoreError>;

    /// Query entries, newest first
    async fn query_history(
        &self,
        filter: &HistoryFilter,
        pagination: Pagination,
    ) -> Result<Page<ReplayHistory>, StoreError>;

    /// All entries for one message, oldest first
    async fn history_for_message(
        &self,
        id: &DlqMessageId,
    ) -> Result<Vec<ReplayHistory>, StoreError>;

    /// The most recent replay attempts of a rule, newest first
    ///
    /// Only attempts made after the rule's latest circuit breaker event are
    /// returned, so a re-enabled rule starts with an empty window.
    async fn recent_attempts(
        &self,
        rule_id: &RuleId,
        limit: usize,
    ) -> Result<Vec<ReplayHistory>, StoreError>;
}

/// Complete DLQ Keeper storage
pub trait DlqStore: MessageStore + RuleStore + HistoryStore {}

impl<T> DlqStore for T where T: MessageStore + RuleStore + HistoryStore {}

// ============================================================================
// Errors
// ============================================================================

/// Storage errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("Message {id} is {actual}, expected {expected}")]
    StatusConflict {
        id: DlqMessageId,
        expected: MessageStatus,
        actual: MessageStatus,
    },

    #[error("Rule {id} enabled flag changed concurrently, expected enabled={expected}")]
    EnabledConflict { id: RuleId, expected: bool },

    #[error("Duplicate {resource}: {id}")]
    Duplicate { resource: &'static str, id: String },

    #[error("Referenced {resource} does not exist: {id}")]
    ForeignKey { resource: &'static str, id: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("Storage unavailable: {message}")]
    Unavailable { message: String },

    #[error("Internal storage error: {message}")]
    Internal { message: String },
}

impl StoreError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub(crate) fn lock_poisoned() -> Self {
        Self::Internal {
            message: "store lock poisoned".to_string(),
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

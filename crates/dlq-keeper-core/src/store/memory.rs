//! In-memory implementation of the DLQ Keeper store.
//!
//! Used by tests and the CLI simulator. Locking is kept narrow:
//!
//! - The message table lock is held only to look up, insert or iterate row
//!   handles; each message row has its own mutex for status transitions.
//! - Rule counters and the enabled flag are atomics shared between the rule
//!   row and any in-flight update, so executors never lock the rule table to
//!   count a replay.

use super::{
    HistoryFilter, HistoryStore, MessageFilter, MessageStore, Page, Pagination, RuleStore,
    StoreError,
};
use crate::dlq_message::{DlqMessage, MessageStatus};
use crate::history::ReplayHistory;
use crate::rules::{AutoReplayRule, RuleAction, RuleCondition};
use crate::{DlqMessageId, NamespaceId, RuleId, Timestamp};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

type MessageKey = (NamespaceId, String, i64);

#[derive(Default)]
struct MessageTable {
    rows: HashMap<DlqMessageId, Arc<Mutex<DlqMessage>>>,
    by_key: HashMap<MessageKey, DlqMessageId>,
    order: Vec<DlqMessageId>,
}

#[derive(Default)]
struct RuleState {
    enabled: AtomicBool,
    match_count: AtomicU64,
    success_count: AtomicU64,
}

/// Stored form of a rule; conditions and action are kept as JSON
struct RuleRow {
    id: RuleId,
    name: String,
    description: Option<String>,
    conditions_json: String,
    action_json: String,
    created_at: Timestamp,
    updated_at: Option<Timestamp>,
    max_replays_per_hour: u32,
    state: Arc<RuleState>,
}

impl RuleRow {
    fn from_rule(rule: &AutoReplayRule, state: Arc<RuleState>) -> Result<Self, StoreError> {
        Ok(Self {
            id: rule.id,
            name: rule.name.clone(),
            description: rule.description.clone(),
            conditions_json: to_json(&rule.conditions)?,
            action_json: to_json(&rule.action)?,
            created_at: rule.created_at,
            updated_at: rule.updated_at,
            max_replays_per_hour: rule.max_replays_per_hour,
            state,
        })
    }

    fn to_rule(&self) -> Result<AutoReplayRule, StoreError> {
        let conditions: Vec<RuleCondition> = from_json(&self.conditions_json)?;
        let action: RuleAction = from_json(&self.action_json)?;
        Ok(AutoReplayRule {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            enabled: self.state.enabled.load(Ordering::SeqCst),
            conditions,
            action,
            created_at: self.created_at,
            updated_at: self.updated_at,
            match_count: self.state.match_count.load(Ordering::SeqCst),
            success_count: self.state.success_count.load(Ordering::SeqCst),
            max_replays_per_hour: self.max_replays_per_hour,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization {
        message: e.to_string(),
    })
}

fn from_json<T: serde::de::DeserializeOwned>(value: &str) -> Result<T, StoreError> {
    serde_json::from_str(value).map_err(|e| StoreError::Serialization {
        message: e.to_string(),
    })
}

fn message_not_found(id: &DlqMessageId) -> StoreError {
    StoreError::NotFound {
        resource: "message",
        id: id.to_string(),
    }
}

fn rule_not_found(id: &RuleId) -> StoreError {
    StoreError::NotFound {
        resource: "rule",
        id: id.to_string(),
    }
}

/// In-memory store for messages, rules and history
#[derive(Default)]
pub struct InMemoryDlqStore {
    messages: RwLock<MessageTable>,
    rules: RwLock<Vec<RuleRow>>,
    history: RwLock<Vec<ReplayHistory>>,
}

impl InMemoryDlqStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages
    pub fn message_count(&self) -> usize {
        self.messages.read().map(|t| t.order.len()).unwrap_or(0)
    }

    /// Number of history entries
    pub fn history_count(&self) -> usize {
        self.history.read().map(|h| h.len()).unwrap_or(0)
    }

    fn message_row(&self, id: &DlqMessageId) -> Result<Arc<Mutex<DlqMessage>>, StoreError> {
        let table = self.messages.read().map_err(|_| StoreError::lock_poisoned())?;
        table.rows.get(id).cloned().ok_or_else(|| message_not_found(id))
    }

    fn all_message_rows(&self) -> Result<Vec<Arc<Mutex<DlqMessage>>>, StoreError> {
        let table = self.messages.read().map_err(|_| StoreError::lock_poisoned())?;
        Ok(table
            .order
            .iter()
            .filter_map(|id| table.rows.get(id).cloned())
            .collect())
    }

    /// Apply a mutation to one message under its row lock
    fn update_message<F>(&self, id: &DlqMessageId, mutate: F) -> Result<DlqMessage, StoreError>
    where
        F: FnOnce(&mut DlqMessage) -> Result<(), StoreError>,
    {
        let row = self.message_row(id)?;
        let mut message = row.lock().map_err(|_| StoreError::lock_poisoned())?;
        mutate(&mut message)?;
        Ok(message.clone())
    }

    fn rule_state(&self, id: &RuleId) -> Result<Arc<RuleState>, StoreError> {
        let rules = self.rules.read().map_err(|_| StoreError::lock_poisoned())?;
        rules
            .iter()
            .find(|row| row.id == *id)
            .map(|row| row.state.clone())
            .ok_or_else(|| rule_not_found(id))
    }
}

#[async_trait]
impl MessageStore for InMemoryDlqStore {
    async fn insert_if_absent(&self, message: DlqMessage) -> Result<bool, StoreError> {
        let key = (
            message.namespace_id.clone(),
            message.entity_name.clone(),
            message.sequence_number,
        );

        let mut table = self.messages.write().map_err(|_| StoreError::lock_poisoned())?;
        if table.by_key.contains_key(&key) {
            return Ok(false);
        }
        if table.rows.contains_key(&message.id) {
            return Err(StoreError::Duplicate {
                resource: "message",
                id: message.id.to_string(),
            });
        }

        let id = message.id;
        table.by_key.insert(key, id);
        table.rows.insert(id, Arc::new(Mutex::new(message)));
        table.order.push(id);
        Ok(true)
    }

    async fn get_message(&self, id: &DlqMessageId) -> Result<Option<DlqMessage>, StoreError> {
        let row = {
            let table = self.messages.read().map_err(|_| StoreError::lock_poisoned())?;
            table.rows.get(id).cloned()
        };
        match row {
            Some(row) => {
                let message = row.lock().map_err(|_| StoreError::lock_poisoned())?;
                Ok(Some(message.clone()))
            }
            None => Ok(None),
        }
    }

    async fn find_by_key(
        &self,
        namespace_id: &NamespaceId,
        entity_name: &str,
        sequence_number: i64,
    ) -> Result<Option<DlqMessage>, StoreError> {
        let id = {
            let table = self.messages.read().map_err(|_| StoreError::lock_poisoned())?;
            table
                .by_key
                .get(&(namespace_id.clone(), entity_name.to_string(), sequence_number))
                .copied()
        };
        match id {
            Some(id) => self.get_message(&id).await,
            None => Ok(None),
        }
    }

    async fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<DlqMessage>, StoreError> {
        let mut result = Vec::new();
        for row in self.all_message_rows()? {
            let message = row.lock().map_err(|_| StoreError::lock_poisoned())?;
            if filter.matches(&message) {
                result.push(message.clone());
            }
        }
        Ok(result)
    }

    async fn mark_replayed(
        &self,
        id: &DlqMessageId,
        at: Timestamp,
    ) -> Result<DlqMessage, StoreError> {
        self.update_message(id, |message| {
            if message.status != MessageStatus::Active {
                return Err(StoreError::StatusConflict {
                    id: message.id,
                    expected: MessageStatus::Active,
                    actual: message.status,
                });
            }
            message.status = MessageStatus::Replayed;
            message.replayed_at = Some(at);
            message.replay_success = Some(true);
            Ok(())
        })
    }

    async fn mark_replay_failed(
        &self,
        id: &DlqMessageId,
        at: Timestamp,
    ) -> Result<DlqMessage, StoreError> {
        self.update_message(id, |message| {
            if message.status != MessageStatus::Active {
                return Err(StoreError::StatusConflict {
                    id: message.id,
                    expected: MessageStatus::Active,
                    actual: message.status,
                });
            }
            message.replayed_at = Some(at);
            message.replay_success = Some(false);
            Ok(())
        })
    }

    async fn archive_message(
        &self,
        id: &DlqMessageId,
        at: Timestamp,
    ) -> Result<DlqMessage, StoreError> {
        self.update_message(id, |message| {
            if message.status == MessageStatus::Archived {
                return Err(StoreError::StatusConflict {
                    id: message.id,
                    expected: MessageStatus::Active,
                    actual: message.status,
                });
            }
            message.status = MessageStatus::Archived;
            message.archived_at = Some(at);
            Ok(())
        })
    }

    async fn update_notes(
        &self,
        id: &DlqMessageId,
        notes: Option<String>,
    ) -> Result<DlqMessage, StoreError> {
        self.update_message(id, |message| {
            message.user_notes = notes;
            Ok(())
        })
    }

    async fn resolve_missing(
        &self,
        namespace_id: &NamespaceId,
        entity_name: &str,
        observed: &HashSet<i64>,
        at: Timestamp,
    ) -> Result<u64, StoreError> {
        let mut resolved = 0;
        for row in self.all_message_rows()? {
            let mut message = row.lock().map_err(|_| StoreError::lock_poisoned())?;
            if message.namespace_id != *namespace_id
                || message.entity_name != entity_name
                || message.resolved_at.is_some()
                || observed.contains(&message.sequence_number)
            {
                continue;
            }

            message.resolved_at = Some(at);
            if message.status == MessageStatus::Active {
                message.status = MessageStatus::Resolved;
            }
            resolved += 1;
        }
        Ok(resolved)
    }
}

#[async_trait]
impl RuleStore for InMemoryDlqStore {
    async fn insert_rule(&self, rule: AutoReplayRule) -> Result<(), StoreError> {
        let state = Arc::new(RuleState {
            enabled: AtomicBool::new(rule.enabled),
            match_count: AtomicU64::new(rule.match_count),
            success_count: AtomicU64::new(rule.success_count),
        });
        let row = RuleRow::from_rule(&rule, state)?;

        let mut rules = self.rules.write().map_err(|_| StoreError::lock_poisoned())?;
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(StoreError::Duplicate {
                resource: "rule",
                id: rule.id.to_string(),
            });
        }
        rules.push(row);
        Ok(())
    }

    async fn get_rule(&self, id: &RuleId) -> Result<Option<AutoReplayRule>, StoreError> {
        let rules = self.rules.read().map_err(|_| StoreError::lock_poisoned())?;
        rules
            .iter()
            .find(|row| row.id == *id)
            .map(RuleRow::to_rule)
            .transpose()
    }

    async fn list_rules(&self) -> Result<Vec<AutoReplayRule>, StoreError> {
        let rules = self.rules.read().map_err(|_| StoreError::lock_poisoned())?;
        rules.iter().map(RuleRow::to_rule).collect()
    }

    async fn update_rule(
        &self,
        rule: AutoReplayRule,
        expected_enabled: bool,
    ) -> Result<AutoReplayRule, StoreError> {
        let mut rules = self.rules.write().map_err(|_| StoreError::lock_poisoned())?;
        let row = rules
            .iter_mut()
            .find(|row| row.id == rule.id)
            .ok_or_else(|| rule_not_found(&rule.id))?;

        let state = row.state.clone();
        let mut updated = RuleRow::from_rule(&rule, state.clone())?;
        updated.created_at = row.created_at;

        // The breaker flips the flag without the table lock
        state
            .enabled
            .compare_exchange(expected_enabled, rule.enabled, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| StoreError::EnabledConflict {
                id: rule.id,
                expected: expected_enabled,
            })?;

        *row = updated;
        row.to_rule()
    }

    async fn delete_rule(&self, id: &RuleId) -> Result<bool, StoreError> {
        let mut rules = self.rules.write().map_err(|_| StoreError::lock_poisoned())?;
        let before = rules.len();
        rules.retain(|row| row.id != *id);
        Ok(rules.len() != before)
    }

    async fn set_enabled_if(
        &self,
        id: &RuleId,
        expected: bool,
        enabled: bool,
    ) -> Result<bool, StoreError> {
        let state = self.rule_state(id)?;
        Ok(state
            .enabled
            .compare_exchange(expected, enabled, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    async fn disable_if_enabled(&self, id: &RuleId) -> Result<bool, StoreError> {
        let state = self.rule_state(id)?;
        Ok(state
            .enabled
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    async fn increment_counters(
        &self,
        id: &RuleId,
        matched: u64,
        succeeded: u64,
    ) -> Result<(), StoreError> {
        let state = self.rule_state(id)?;
        state.match_count.fetch_add(matched, Ordering::SeqCst);
        state.success_count.fetch_add(succeeded, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for InMemoryDlqStore {
    async fn append_history(&self, entry: ReplayHistory) -> Result<(), StoreError> {
        {
            let table = self.messages.read().map_err(|_| StoreError::lock_poisoned())?;
            if !table.rows.contains_key(&entry.dlq_message_id) {
                return Err(StoreError::ForeignKey {
                    resource: "message",
                    id: entry.dlq_message_id.to_string(),
                });
            }
        }
        if let Some(rule_id) = entry.rule_id {
            let rules = self.rules.read().map_err(|_| StoreError::lock_poisoned())?;
            if !rules.iter().any(|row| row.id == rule_id) {
                return Err(StoreError::ForeignKey {
                    resource: "rule",
                    id: rule_id.to_string(),
                });
            }
        }

        let mut history = self.history.write().map_err(|_| StoreError::lock_poisoned())?;
        history.push(entry);
        Ok(())
    }

    async fn query_history(
        &self,
        filter: &HistoryFilter,
        pagination: Pagination,
    ) -> Result<Page<ReplayHistory>, StoreError> {
        let history = self.history.read().map_err(|_| StoreError::lock_poisoned())?;
        let matching: Vec<&ReplayHistory> =
            history.iter().rev().filter(|e| filter.matches(e)).collect();

        Ok(Page {
            total: matching.len(),
            items: matching
                .into_iter()
                .skip(pagination.offset)
                .take(pagination.limit)
                .cloned()
                .collect(),
            offset: pagination.offset,
            limit: pagination.limit,
        })
    }

    async fn history_for_message(
        &self,
        id: &DlqMessageId,
    ) -> Result<Vec<ReplayHistory>, StoreError> {
        let history = self.history.read().map_err(|_| StoreError::lock_poisoned())?;
        Ok(history
            .iter()
            .filter(|e| e.dlq_message_id == *id)
            .cloned()
            .collect())
    }

    async fn recent_attempts(
        &self,
        rule_id: &RuleId,
        limit: usize,
    ) -> Result<Vec<ReplayHistory>, StoreError> {
        let history = self.history.read().map_err(|_| StoreError::lock_poisoned())?;
        Ok(history
            .iter()
            .rev()
            .filter(|e| e.rule_id == Some(*rule_id))
            .take_while(|e| e.is_attempt())
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

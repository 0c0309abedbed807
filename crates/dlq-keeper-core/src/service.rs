//! Management operations for rules, replays and reporting.
//!
//! [`DlqService`] is the surface exposed to operators and dashboards. It
//! validates every user-supplied rule before it reaches the store, and maps
//! storage and executor failures onto [`DlqKeeperError`] so callers can
//! distinguish not-found, business-rule and transient errors.

use crate::dlq_message::{DlqMessage, FailureCategory, MessageStatus};
use crate::executor::{ReplayExecutor, ReplayOutcome, RuleReplay};
use crate::history::{ReplayHistory, ReplayStrategy};
use crate::rules::engine::RuleEngine;
use crate::rules::{AutoReplayRule, RuleCondition, RuleDefinition, RuleError};
use crate::store::{DlqStore, HistoryFilter, MessageFilter, Page, Pagination, StoreError};
use crate::{
    DlqKeeperError, DlqKeeperResult, DlqMessageId, NamespaceId, RuleId, Timestamp,
    ValidationError,
};
use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

/// Maximum length of user notes on a message
pub const MAX_NOTES_LENGTH: usize = 4000;

/// Maximum number of messages evaluated by a rule test
pub const MAX_TEST_SAMPLE_SIZE: usize = 1000;

/// Matched messages returned by a rule test
pub const SAMPLE_MATCH_LIMIT: usize = 10;

/// Days covered by the summary trend, today included
pub const TREND_DAYS: i64 = 7;

/// Actor recorded for bulk replays
pub const REPLAY_ALL_ACTOR: &str = "replay-all";

// ============================================================================
// Result Types
// ============================================================================

/// Result of dry-running conditions against stored messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTestResult {
    pub total_tested: usize,
    pub matched_count: usize,
    /// Expected replay success rate for the matched messages, 0..=1
    pub estimated_success_rate: f64,
    pub sample_matches: Vec<DlqMessage>,
}

/// Result of replaying every Active message matching a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkReplayResult {
    pub total_matched: usize,
    pub replayed: usize,
    pub failed: usize,
}

/// Kind of entry on a message timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelineEventKind {
    Enqueued,
    DeadLettered,
    Detected,
    ReplayAttempt,
    RuleDisabled,
    Archived,
    Resolved,
}

/// One entry on a message timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub at: Timestamp,
    pub kind: TimelineEventKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<ReplayHistory>,
}

/// A message with its chronological history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTimeline {
    pub message: DlqMessage,
    pub events: Vec<TimelineEvent>,
}

/// Messages detected on one day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: usize,
}

/// Aggregate view of detected messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DlqSummary {
    pub total: usize,
    pub by_status: BTreeMap<MessageStatus, usize>,
    pub by_category: BTreeMap<FailureCategory, usize>,
    pub by_entity: BTreeMap<String, usize>,
    /// Detections per day, oldest first
    pub daily_trend: Vec<DailyCount>,
}

// ============================================================================
// Service
// ============================================================================

/// Operator-facing management service
#[derive(Clone)]
pub struct DlqService {
    store: Arc<dyn DlqStore>,
    executor: ReplayExecutor,
    engine: RuleEngine,
}

impl DlqService {
    pub fn new(store: Arc<dyn DlqStore>, executor: ReplayExecutor) -> Self {
        Self {
            store,
            executor,
            engine: RuleEngine::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------------

    /// Validate and store a new rule
    pub async fn create_rule(&self, definition: RuleDefinition) -> DlqKeeperResult<AutoReplayRule> {
        definition.validate()?;
        self.ensure_unique_name(&definition.name, None).await?;

        let rule = AutoReplayRule::from_definition(definition);
        self.store.insert_rule(rule.clone()).await?;

        info!(rule_id = %rule.id, rule_name = %rule.name, "Created auto-replay rule");
        Ok(rule)
    }

    /// Replace the user-editable fields of a rule
    pub async fn update_rule(
        &self,
        id: &RuleId,
        definition: RuleDefinition,
    ) -> DlqKeeperResult<AutoReplayRule> {
        definition.validate()?;
        let existing = self.get_rule(id).await?;
        self.ensure_unique_name(&definition.name, Some(id)).await?;

        let updated = AutoReplayRule {
            name: definition.name,
            description: definition.description,
            enabled: definition.enabled,
            conditions: definition.conditions,
            action: definition.action,
            max_replays_per_hour: definition.max_replays_per_hour,
            updated_at: Some(Timestamp::now()),
            ..existing
        };
        let stored = match self.store.update_rule(updated, existing.enabled).await {
            Ok(stored) => stored,
            Err(StoreError::EnabledConflict { .. }) => {
                return Err(enabled_conflict(&existing.name, existing.enabled))
            }
            Err(e) => return Err(e.into()),
        };

        info!(rule_id = %stored.id, rule_name = %stored.name, "Updated auto-replay rule");
        Ok(stored)
    }

    /// Delete a rule; its history rows are kept
    pub async fn delete_rule(&self, id: &RuleId) -> DlqKeeperResult<()> {
        if !self.store.delete_rule(id).await? {
            return Err(not_found("rule", id));
        }
        self.executor.rate_limiter().forget(id);

        info!(rule_id = %id, "Deleted auto-replay rule");
        Ok(())
    }

    /// Flip a rule between enabled and disabled
    pub async fn toggle_rule(&self, id: &RuleId) -> DlqKeeperResult<AutoReplayRule> {
        let rule = self.get_rule(id).await?;
        if !self.store.set_enabled_if(id, rule.enabled, !rule.enabled).await? {
            return Err(enabled_conflict(&rule.name, rule.enabled));
        }

        let rule = self.get_rule(id).await?;
        info!(rule_id = %id, enabled = rule.enabled, "Toggled auto-replay rule");
        Ok(rule)
    }

    pub async fn get_rule(&self, id: &RuleId) -> DlqKeeperResult<AutoReplayRule> {
        self.store
            .get_rule(id)
            .await?
            .ok_or_else(|| not_found("rule", id))
    }

    pub async fn list_rules(&self) -> DlqKeeperResult<Vec<AutoReplayRule>> {
        Ok(self.store.list_rules().await?)
    }

    async fn ensure_unique_name(&self, name: &str, except: Option<&RuleId>) -> DlqKeeperResult<()> {
        let clash = self
            .store
            .list_rules()
            .await?
            .into_iter()
            .any(|r| r.name == name && Some(&r.id) != except);
        if clash {
            return Err(ValidationError::NotAllowed {
                field: "name".to_string(),
                message: format!("a rule named '{}' already exists", name),
            }
            .into());
        }
        Ok(())
    }

    /// Dry-run conditions against the most recently detected messages
    pub async fn test_rule(
        &self,
        conditions: &[RuleCondition],
        sample_size: usize,
    ) -> DlqKeeperResult<RuleTestResult> {
        let errors: Vec<ValidationError> = conditions
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.validate(i).err())
            .collect();
        if !errors.is_empty() {
            return Err(RuleError::Invalid {
                rule: "test".to_string(),
                errors,
            }
            .into());
        }

        let sample_size = sample_size.clamp(1, MAX_TEST_SAMPLE_SIZE);
        let messages = self.store.list_messages(&MessageFilter::default()).await?;
        let sample: Vec<DlqMessage> = messages.iter().rev().take(sample_size).cloned().collect();

        let matched: Vec<DlqMessage> = sample
            .iter()
            .filter(|m| self.engine.evaluate(m, conditions).is_match)
            .cloned()
            .collect();

        let estimated_success_rate = self.estimate_success_rate(&messages, &matched).await?;

        Ok(RuleTestResult {
            total_tested: sample.len(),
            matched_count: matched.len(),
            estimated_success_rate,
            sample_matches: matched.into_iter().take(SAMPLE_MATCH_LIMIT).collect(),
        })
    }

    /// Mean expected success rate of the matched messages
    ///
    /// Each message contributes the historical replay success rate of its
    /// failure category, or the category's prior when it has no history.
    /// Every history row is read, one page at a time.
    async fn estimate_success_rate(
        &self,
        all: &[DlqMessage],
        matched: &[DlqMessage],
    ) -> DlqKeeperResult<f64> {
        if matched.is_empty() {
            return Ok(0.0);
        }

        let category_of: HashMap<DlqMessageId, FailureCategory> =
            all.iter().map(|m| (m.id, m.failure_category)).collect();
        let mut stats: HashMap<FailureCategory, (usize, usize)> = HashMap::new();
        let mut offset = 0;
        loop {
            let page = self
                .store
                .query_history(
                    &HistoryFilter::default(),
                    Pagination::new(offset, Pagination::MAX_LIMIT),
                )
                .await?;

            for entry in page.items.iter().filter(|h| h.is_attempt()) {
                if let Some(category) = category_of.get(&entry.dlq_message_id) {
                    let (attempts, successes) = stats.entry(*category).or_default();
                    *attempts += 1;
                    if entry.is_success() {
                        *successes += 1;
                    }
                }
            }

            offset += page.items.len();
            if page.items.is_empty() || offset >= page.total {
                break;
            }
        }

        let total: f64 = matched
            .iter()
            .map(|m| match stats.get(&m.failure_category) {
                Some((attempts, successes)) if *attempts > 0 => {
                    *successes as f64 / *attempts as f64
                }
                _ => m.failure_category.replay_success_prior(),
            })
            .sum();
        Ok(total / matched.len() as f64)
    }

    // ------------------------------------------------------------------------
    // Replays
    // ------------------------------------------------------------------------

    /// Replay every Active message matching an enabled rule, immediately
    pub async fn replay_all(&self, rule_id: &RuleId) -> DlqKeeperResult<BulkReplayResult> {
        let rule = self.get_rule(rule_id).await?;
        if !rule.enabled {
            return Err(DlqKeeperError::BusinessRule {
                message: format!("rule '{}' is disabled", rule.name),
            });
        }

        let active = MessageFilter {
            status: Some(MessageStatus::Active),
            ..Default::default()
        };
        let matching: Vec<DlqMessage> = self
            .store
            .list_messages(&active)
            .await?
            .into_iter()
            .filter(|m| self.engine.evaluate(m, &rule.conditions).is_match)
            .collect();

        let mut result = BulkReplayResult {
            total_matched: matching.len(),
            replayed: 0,
            failed: 0,
        };
        for message in &matching {
            let outcome = self
                .executor
                .execute_rule(
                    message.id,
                    rule.id,
                    &rule.action,
                    RuleReplay {
                        strategy: ReplayStrategy::ReplayAll,
                        actor: REPLAY_ALL_ACTOR,
                        bypass_delay: true,
                    },
                )
                .await;
            if matches!(outcome, Ok(ReplayOutcome::Replayed { .. })) {
                result.replayed += 1;
            }
        }
        result.failed = result.total_matched - result.replayed;

        info!(
            rule_id = %rule.id,
            matched = result.total_matched,
            replayed = result.replayed,
            failed = result.failed,
            "Bulk replay complete"
        );
        Ok(result)
    }

    /// Replay one message on behalf of an operator
    pub async fn replay_message(
        &self,
        id: &DlqMessageId,
        actor: &str,
    ) -> DlqKeeperResult<ReplayOutcome> {
        if actor.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "actor".to_string(),
            }
            .into());
        }
        Ok(self.executor.replay_manual(id, actor, None).await?)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn get_message(&self, id: &DlqMessageId) -> DlqKeeperResult<DlqMessage> {
        self.store
            .get_message(id)
            .await?
            .ok_or_else(|| not_found("message", id))
    }

    pub async fn list_messages(&self, filter: &MessageFilter) -> DlqKeeperResult<Vec<DlqMessage>> {
        Ok(self.store.list_messages(filter).await?)
    }

    pub async fn get_history(
        &self,
        filter: &HistoryFilter,
        pagination: Pagination,
    ) -> DlqKeeperResult<Page<ReplayHistory>> {
        Ok(self.store.query_history(filter, pagination).await?)
    }

    /// Chronological lifecycle of one message
    pub async fn get_timeline(&self, id: &DlqMessageId) -> DlqKeeperResult<MessageTimeline> {
        let message = self.get_message(id).await?;
        let history = self.store.history_for_message(id).await?;

        let mut events = vec![TimelineEvent {
            at: message.enqueued_time_utc,
            kind: TimelineEventKind::Enqueued,
            description: format!("Enqueued to {}", message.entity_name),
            history: None,
        }];
        if let Some(at) = message.dead_letter_time_utc {
            events.push(TimelineEvent {
                at,
                kind: TimelineEventKind::DeadLettered,
                description: format!(
                    "Dead-lettered: {}",
                    message.dead_letter_reason.as_deref().unwrap_or("no reason given")
                ),
                history: None,
            });
        }
        events.push(TimelineEvent {
            at: message.detected_at_utc,
            kind: TimelineEventKind::Detected,
            description: format!(
                "Detected and classified as {} ({:.0}% confidence)",
                message.failure_category,
                message.category_confidence * 100.0
            ),
            history: None,
        });

        for entry in history {
            let (kind, description) = if entry.is_attempt() {
                (
                    TimelineEventKind::ReplayAttempt,
                    format!(
                        "{} replay to {} by {}: {:?}",
                        entry.replay_strategy,
                        entry.replayed_to_entity,
                        entry.replayed_by,
                        entry.outcome_status
                    ),
                )
            } else {
                (
                    TimelineEventKind::RuleDisabled,
                    entry
                        .error_details
                        .clone()
                        .unwrap_or_else(|| "Rule disabled".to_string()),
                )
            };
            events.push(TimelineEvent {
                at: entry.replayed_at,
                kind,
                description,
                history: Some(entry),
            });
        }

        if let Some(at) = message.archived_at {
            events.push(TimelineEvent {
                at,
                kind: TimelineEventKind::Archived,
                description: "Archived".to_string(),
                history: None,
            });
        }
        if let Some(at) = message.resolved_at {
            events.push(TimelineEvent {
                at,
                kind: TimelineEventKind::Resolved,
                description: "No longer present in the dead-letter queue".to_string(),
                history: None,
            });
        }

        // Stable sort keeps insertion order for equal timestamps
        events.sort_by_key(|e| e.at);
        Ok(MessageTimeline { message, events })
    }

    /// Aggregate counts, optionally for one namespace
    pub async fn get_summary(&self, namespace_id: Option<&NamespaceId>) -> DlqKeeperResult<DlqSummary> {
        let filter = MessageFilter {
            namespace_id: namespace_id.cloned(),
            ..Default::default()
        };
        let messages = self.store.list_messages(&filter).await?;
        Ok(summarize(&messages, Timestamp::now().date()))
    }

    // ------------------------------------------------------------------------
    // User Mutations
    // ------------------------------------------------------------------------

    /// Archive a message so it is no longer remediated
    pub async fn archive_message(&self, id: &DlqMessageId) -> DlqKeeperResult<DlqMessage> {
        match self.store.archive_message(id, Timestamp::now()).await {
            Ok(message) => Ok(message),
            Err(StoreError::StatusConflict { .. }) => Err(DlqKeeperError::BusinessRule {
                message: format!("message {} is already archived", id),
            }),
            Err(StoreError::NotFound { .. }) => Err(not_found("message", id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the notes on a message; blank notes clear them
    pub async fn update_notes(
        &self,
        id: &DlqMessageId,
        notes: Option<String>,
    ) -> DlqKeeperResult<DlqMessage> {
        let notes = notes.filter(|n| !n.trim().is_empty());
        if notes.as_ref().is_some_and(|n| n.chars().count() > MAX_NOTES_LENGTH) {
            return Err(ValidationError::TooLong {
                field: "user_notes".to_string(),
                max_length: MAX_NOTES_LENGTH,
            }
            .into());
        }

        match self.store.update_notes(id, notes).await {
            Ok(message) => Ok(message),
            Err(StoreError::NotFound { .. }) => Err(not_found("message", id)),
            Err(e) => Err(e.into()),
        }
    }
}

fn not_found(resource: &str, id: &impl std::fmt::Display) -> DlqKeeperError {
    DlqKeeperError::NotFound {
        resource: resource.to_string(),
        id: id.to_string(),
    }
}

/// A rule's enabled flag moved between read and write, usually a breaker trip
fn enabled_conflict(name: &str, read_enabled: bool) -> DlqKeeperError {
    let now = if read_enabled { "disabled" } else { "enabled" };
    DlqKeeperError::BusinessRule {
        message: format!("rule '{name}' was {now} concurrently; reload and retry"),
    }
}

/// Aggregate messages with a trend ending on `today`
fn summarize(messages: &[DlqMessage], today: NaiveDate) -> DlqSummary {
    let mut summary = DlqSummary {
        total: messages.len(),
        ..Default::default()
    };

    let first_day = today - ChronoDuration::days(TREND_DAYS - 1);
    let mut per_day: BTreeMap<NaiveDate, usize> = BTreeMap::new();

    for message in messages {
        *summary.by_status.entry(message.status).or_default() += 1;
        *summary.by_category.entry(message.failure_category).or_default() += 1;
        *summary
            .by_entity
            .entry(message.entity_name.clone())
            .or_default() += 1;

        let day = message.detected_at_utc.date();
        if day >= first_day && day <= today {
            *per_day.entry(day).or_default() += 1;
        }
    }

    summary.daily_trend = first_day
        .iter_days()
        .take(TREND_DAYS as usize)
        .map(|date| DailyCount {
            date,
            count: per_day.get(&date).copied().unwrap_or(0),
        })
        .collect();
    summary
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;

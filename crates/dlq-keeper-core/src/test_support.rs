//! Shared fixtures for unit tests.

use crate::dlq_message::{DlqMessage, FailureCategory, MessageStatus};
use crate::rules::{AutoReplayRule, ConditionField, ConditionOperator, RuleCondition, RuleDefinition};
use crate::{DlqMessageId, NamespaceId, Timestamp};
use dlq_broker::EntityRef;
use std::collections::HashMap;

pub const NS: &str = "ns-test";

pub fn namespace() -> NamespaceId {
    NamespaceId::new(NS).unwrap()
}

/// An Active message on queue `entity` with the given sequence number
pub fn sample_message(entity: &str, sequence_number: i64) -> DlqMessage {
    let entity_ref = EntityRef::from_path(entity);
    DlqMessage {
        id: DlqMessageId::new(),
        message_id: format!("msg-{}", sequence_number),
        sequence_number,
        body_hash: String::new(),
        namespace_id: namespace(),
        entity_name: entity_ref.path(),
        entity_type: entity_ref.entity_type(),
        enqueued_time_utc: Timestamp::now(),
        dead_letter_time_utc: Some(Timestamp::now()),
        detected_at_utc: Timestamp::now(),
        dead_letter_reason: Some("MessageLockLost".to_string()),
        dead_letter_error_description: None,
        delivery_count: 2,
        content_type: None,
        message_size: 0,
        body_preview: String::new(),
        application_properties: HashMap::new(),
        failure_category: FailureCategory::Transient,
        category_confidence: 0.95,
        status: MessageStatus::Active,
        replayed_at: None,
        replay_success: None,
        archived_at: None,
        resolved_at: None,
        user_notes: None,
        correlation_id: None,
        session_id: None,
        topic_name: entity_ref.topic_name().map(str::to_string),
    }
}

/// A rule matching dead-letter reasons containing "Lock"
pub fn lock_rule(max_replays_per_hour: u32) -> AutoReplayRule {
    let mut definition = RuleDefinition::new(
        "lock-lost",
        vec![RuleCondition::new(
            ConditionField::DeadLetterReason,
            ConditionOperator::Contains,
            "Lock",
        )],
    );
    definition.max_replays_per_hour = max_replays_per_hour;
    definition.action.max_retries = 1;
    AutoReplayRule::from_definition(definition)
}

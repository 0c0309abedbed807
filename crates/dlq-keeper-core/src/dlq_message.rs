//! Detected dead-letter message model.
//!
//! A [`DlqMessage`] is the snapshot taken when the monitor first observes a
//! dead-lettered message. Broker-derived fields never change after
//! detection; only the lifecycle fields (status, replay and user fields)
//! are mutated afterwards, and rows are never deleted.

use crate::classifier::Classification;
use crate::{DlqMessageId, NamespaceId, ParseError, Timestamp};
use dlq_broker::{BrokerMessage, EntityRef, EntityType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Status and Category
// ============================================================================

/// Lifecycle status of a detected message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Still in the dead-letter sub-queue and eligible for remediation
    Active,
    /// Successfully resubmitted by a replay
    Replayed,
    /// Set aside by a user
    Archived,
    /// No longer observed in the dead-letter sub-queue
    Resolved,
}

impl MessageStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Replayed => "Replayed",
            Self::Archived => "Archived",
            Self::Resolved => "Resolved",
        }
    }

    /// Whether rules may still act on a message with this status
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heuristic category describing why a message was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FailureCategory {
    /// Lock loss, timeouts, throttling and other passing conditions
    Transient,
    /// Consumer exhausted its delivery attempts
    MaxDeliveryExceeded,
    /// Message time-to-live elapsed
    Expired,
    /// Body could not be deserialized or parsed
    Poison,
    /// Payload failed business or schema validation
    Validation,
    /// Consumer lacked permission for a downstream call
    Authorization,
    /// A referenced entity or resource does not exist
    ResourceNotFound,
    /// Size or quota limits were exceeded
    QuotaExceeded,
    /// Generic consumer-side processing failure
    ProcessingError,
    /// No heuristic matched
    Unknown,
}

impl FailureCategory {
    /// All categories in declaration order
    pub const ALL: [FailureCategory; 10] = [
        Self::Transient,
        Self::MaxDeliveryExceeded,
        Self::Expired,
        Self::Poison,
        Self::Validation,
        Self::Authorization,
        Self::ResourceNotFound,
        Self::QuotaExceeded,
        Self::ProcessingError,
        Self::Unknown,
    ];

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "Transient",
            Self::MaxDeliveryExceeded => "MaxDeliveryExceeded",
            Self::Expired => "Expired",
            Self::Poison => "Poison",
            Self::Validation => "Validation",
            Self::Authorization => "Authorization",
            Self::ResourceNotFound => "ResourceNotFound",
            Self::QuotaExceeded => "QuotaExceeded",
            Self::ProcessingError => "ProcessingError",
            Self::Unknown => "Unknown",
        }
    }

    /// Expected replay success rate when no history exists for the category
    pub fn replay_success_prior(&self) -> f64 {
        match self {
            Self::Transient => 0.9,
            Self::MaxDeliveryExceeded => 0.5,
            Self::Expired => 0.6,
            Self::ProcessingError => 0.4,
            Self::QuotaExceeded => 0.3,
            Self::Unknown => 0.3,
            Self::Authorization => 0.2,
            Self::ResourceNotFound => 0.2,
            Self::Poison => 0.05,
            Self::Validation => 0.05,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureCategory {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| ParseError::InvalidFormat {
                expected: "failure category name".to_string(),
                actual: s.to_string(),
            })
    }
}

// ============================================================================
// DlqMessage
// ============================================================================

/// A dead-lettered message as detected by the monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqMessage {
    pub id: DlqMessageId,
    pub message_id: String,
    pub sequence_number: i64,
    /// Hex-encoded SHA-256 of the message body
    pub body_hash: String,
    pub namespace_id: NamespaceId,
    /// Canonical entity path, `topic/subscriptions/name` for subscriptions
    pub entity_name: String,
    pub entity_type: EntityType,
    pub enqueued_time_utc: Timestamp,
    pub dead_letter_time_utc: Option<Timestamp>,
    pub detected_at_utc: Timestamp,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_error_description: Option<String>,
    pub delivery_count: u32,
    pub content_type: Option<String>,
    pub message_size: usize,
    pub body_preview: String,
    #[serde(default)]
    pub application_properties: HashMap<String, String>,
    pub failure_category: FailureCategory,
    pub category_confidence: f64,
    pub status: MessageStatus,
    pub replayed_at: Option<Timestamp>,
    pub replay_success: Option<bool>,
    pub archived_at: Option<Timestamp>,
    pub resolved_at: Option<Timestamp>,
    pub user_notes: Option<String>,
    pub correlation_id: Option<String>,
    pub session_id: Option<String>,
    pub topic_name: Option<String>,
}

impl DlqMessage {
    /// Build a new Active row from a peeked broker message
    pub fn from_broker(
        namespace_id: NamespaceId,
        entity: &EntityRef,
        message: &BrokerMessage,
        classification: Classification,
        preview_bytes: usize,
    ) -> Self {
        Self {
            id: DlqMessageId::new(),
            message_id: message.message_id.clone(),
            sequence_number: message.sequence_number,
            body_hash: body_hash(&message.body),
            namespace_id,
            entity_name: entity.path(),
            entity_type: entity.entity_type(),
            enqueued_time_utc: Timestamp::from(message.enqueued_time_utc),
            dead_letter_time_utc: message.dead_letter_time_utc.map(Timestamp::from),
            detected_at_utc: Timestamp::now(),
            dead_letter_reason: message.dead_letter_reason.clone(),
            dead_letter_error_description: message.dead_letter_error_description.clone(),
            delivery_count: message.delivery_count,
            content_type: message.content_type.clone(),
            message_size: message.size(),
            body_preview: body_preview(&message.body, preview_bytes),
            application_properties: message.application_properties.clone(),
            failure_category: classification.category,
            category_confidence: classification.confidence,
            status: MessageStatus::Active,
            replayed_at: None,
            replay_success: None,
            archived_at: None,
            resolved_at: None,
            user_notes: None,
            correlation_id: message.correlation_id.clone(),
            session_id: message.session_id.clone(),
            topic_name: entity.topic_name().map(str::to_string),
        }
    }

    /// Entity that owns the dead-letter sub-queue holding this message
    pub fn entity(&self) -> EntityRef {
        EntityRef::from_path(&self.entity_name)
    }

    /// Whether rules may act on this message
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Hex-encoded SHA-256 digest of a message body
pub fn body_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Lossy UTF-8 prefix of a body, cut at a character boundary
pub fn body_preview(body: &[u8], max_bytes: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= max_bytes {
        return text.into_owned();
    }

    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
#[path = "dlq_message_tests.rs"]
mod tests;

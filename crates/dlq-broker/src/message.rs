//! Entity references and message snapshots for broker operations.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// Entities
// ============================================================================

/// Kind of broker entity that owns a dead-letter sub-queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Queue,
    Subscription,
}

impl EntityType {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a queue or a topic subscription
///
/// For queues `name` is the queue name. For subscriptions `name` is the
/// topic name and `subscription` carries the subscription name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub name: String,
    pub subscription: Option<String>,
}

impl EntityRef {
    /// Reference a queue
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscription: None,
        }
    }

    /// Reference a subscription on a topic
    pub fn subscription(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            name: topic.into(),
            subscription: Some(subscription.into()),
        }
    }

    /// Parse an entity path as produced by [`EntityRef::path`]
    ///
    /// `topic/subscriptions/name` resolves to a subscription, anything else
    /// is treated as a queue name.
    pub fn from_path(path: &str) -> Self {
        match path.split_once("/subscriptions/") {
            Some((topic, sub)) if !topic.is_empty() && !sub.is_empty() => {
                Self::subscription(topic, sub)
            }
            _ => Self::queue(path),
        }
    }

    /// Get the entity type
    pub fn entity_type(&self) -> EntityType {
        if self.subscription.is_some() {
            EntityType::Subscription
        } else {
            EntityType::Queue
        }
    }

    /// Topic name for subscriptions, `None` for queues
    pub fn topic_name(&self) -> Option<&str> {
        self.subscription.as_ref().map(|_| self.name.as_str())
    }

    /// Canonical entity path, unique within a namespace
    pub fn path(&self) -> String {
        match &self.subscription {
            Some(sub) => format!("{}/subscriptions/{}", self.name, sub),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Snapshot of a message as returned by a peek operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub message_id: String,
    pub sequence_number: i64,
    pub body: Bytes,
    pub enqueued_time_utc: DateTime<Utc>,
    pub dead_letter_time_utc: Option<DateTime<Utc>>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_error_description: Option<String>,
    pub delivery_count: u32,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub session_id: Option<String>,
    pub application_properties: HashMap<String, String>,
}

impl BrokerMessage {
    /// Size of the message body in bytes
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// Message to be sent to an entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub message_id: Option<String>,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub session_id: Option<String>,
    pub application_properties: HashMap<String, String>,
}

impl OutgoingMessage {
    /// Create message with body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Set content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set correlation ID
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Add application property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

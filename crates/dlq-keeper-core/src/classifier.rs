//! Failure-category heuristics for dead-lettered messages.
//!
//! Classification looks at three signals in order of confidence:
//!
//! 1. The dead-letter reason matched exactly against well-known broker reasons
//! 2. Keywords found in the reason or error description
//! 3. The delivery count alone
//!
//! The first signal that produces a category wins.

use crate::dlq_message::FailureCategory;
use serde::{Deserialize, Serialize};

/// Confidence of an exact known-reason match
pub const EXACT_MATCH_CONFIDENCE: f64 = 0.95;

/// Confidence of a keyword match in the reason or description
pub const KEYWORD_CONFIDENCE: f64 = 0.7;

/// Confidence of an inference from the delivery count alone
pub const DELIVERY_COUNT_CONFIDENCE: f64 = 0.5;

/// Result of classifying a dead-lettered message
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: FailureCategory,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
}

impl Classification {
    /// The fallback classification when nothing matched
    pub fn unknown() -> Self {
        Self {
            category: FailureCategory::Unknown,
            confidence: 0.0,
        }
    }
}

const KNOWN_REASONS: &[(&str, FailureCategory)] = &[
    ("MaxDeliveryCountExceeded", FailureCategory::MaxDeliveryExceeded),
    ("TTLExpiredException", FailureCategory::Expired),
    ("MessageLockLost", FailureCategory::Transient),
    ("MessageLockLostException", FailureCategory::Transient),
    ("SessionLockLost", FailureCategory::Transient),
    ("SessionLockLostException", FailureCategory::Transient),
    ("ServerBusy", FailureCategory::Transient),
    ("ServerBusyException", FailureCategory::Transient),
    ("TimeoutException", FailureCategory::Transient),
    ("HeaderSizeExceeded", FailureCategory::QuotaExceeded),
    ("MessageSizeExceeded", FailureCategory::QuotaExceeded),
    ("QuotaExceededException", FailureCategory::QuotaExceeded),
    ("MessagingEntityNotFound", FailureCategory::ResourceNotFound),
    ("UnauthorizedAccessException", FailureCategory::Authorization),
    ("DeserializationFailed", FailureCategory::Poison),
    ("SerializationException", FailureCategory::Poison),
    ("ValidationFailed", FailureCategory::Validation),
];

// Ordered: earlier groups win when several keywords are present
const KEYWORDS: &[(&[&str], FailureCategory)] = &[
    (
        &["expired", "time to live", "time-to-live", "ttlexpired"],
        FailureCategory::Expired,
    ),
    (
        &["deserializ", "serializ", "malformed", "unexpected token", "parse", "json"],
        FailureCategory::Poison,
    ),
    (
        &["validation", "invalid", "schema", "required field"],
        FailureCategory::Validation,
    ),
    (
        &["unauthori", "forbidden", "permission", "access denied", "401", "403"],
        FailureCategory::Authorization,
    ),
    (
        &["not found", "notfound", "does not exist", "404"],
        FailureCategory::ResourceNotFound,
    ),
    (
        &["quota", "too large", "size exceeded", "limit exceeded"],
        FailureCategory::QuotaExceeded,
    ),
    (
        &[
            "timeout",
            "timed out",
            "lock lost",
            "locklost",
            "busy",
            "unavailable",
            "throttl",
            "connection",
            "transient",
            "503",
        ],
        FailureCategory::Transient,
    ),
    (
        &["max delivery", "maxdelivery", "delivery count"],
        FailureCategory::MaxDeliveryExceeded,
    ),
    (
        &["exception", "error", "failed", "failure"],
        FailureCategory::ProcessingError,
    ),
];

/// Heuristic failure classifier
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    max_delivery_count_hint: u32,
}

impl FailureClassifier {
    /// Create a classifier
    ///
    /// `max_delivery_count_hint` is the entity's typical maximum delivery
    /// count; messages at or above it are inferred to have exhausted retries.
    pub fn new(max_delivery_count_hint: u32) -> Self {
        Self {
            max_delivery_count_hint,
        }
    }

    /// Classify a dead-lettered message from its broker metadata
    pub fn classify(
        &self,
        reason: Option<&str>,
        description: Option<&str>,
        delivery_count: u32,
    ) -> Classification {
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        let description = description.map(str::trim).filter(|d| !d.is_empty());

        if let Some(reason) = reason {
            if let Some((_, category)) = KNOWN_REASONS
                .iter()
                .find(|(known, _)| known.eq_ignore_ascii_case(reason))
            {
                return Classification {
                    category: *category,
                    confidence: EXACT_MATCH_CONFIDENCE,
                };
            }
        }

        let haystack = [reason, description]
            .iter()
            .flatten()
            .map(|s| s.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");

        if !haystack.is_empty() {
            for (keywords, category) in KEYWORDS {
                if keywords.iter().any(|k| haystack.contains(k)) {
                    return Classification {
                        category: *category,
                        confidence: KEYWORD_CONFIDENCE,
                    };
                }
            }
        }

        if self.max_delivery_count_hint > 0 && delivery_count >= self.max_delivery_count_hint {
            return Classification {
                category: FailureCategory::MaxDeliveryExceeded,
                confidence: DELIVERY_COUNT_CONFIDENCE,
            };
        }

        Classification::unknown()
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
#[path = "classifier_tests.rs"]
mod tests;

//! # DLQ Keeper Core
//!
//! Core business logic for the DLQ Keeper dead-letter remediation engine.
//!
//! This crate detects dead-lettered messages, classifies why they failed,
//! evaluates user-defined remediation rules and replays matching messages
//! back to their source entity under rate limiting and an automatic
//! success-rate circuit breaker.
//!
//! ## Architecture
//!
//! - Business logic depends only on the [`dlq_broker::MessageBroker`] and
//!   [`store::DlqStore`] trait abstractions
//! - Infrastructure implementations are injected at runtime
//! - Each scan cycle runs Monitor → Rule Engine → Executor per namespace
//!
//! ## Usage
//!
//! ```rust
//! use dlq_keeper_core::{NamespaceId, RuleId};
//!
//! let rule_id = RuleId::new();
//! let namespace = NamespaceId::new("ns-prod").unwrap();
//! assert_eq!(namespace.as_str(), "ns-prod");
//! assert_eq!(rule_id.to_string().len(), 26);
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// Re-export commonly used types
pub use ulid::Ulid;

/// Standard result type for DLQ Keeper operations
pub type DlqKeeperResult<T> = Result<T, DlqKeeperError>;

// ============================================================================
// Domain Identifier Types
// ============================================================================

macro_rules! ulid_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Ulid);

        impl $name {
            /// Generate a new unique identifier
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Get string representation
            pub fn as_str(&self) -> String {
                self.0.to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let ulid = s.parse::<Ulid>().map_err(|_| ParseError::InvalidFormat {
                    expected: "ULID format".to_string(),
                    actual: s.to_string(),
                })?;
                Ok(Self(ulid))
            }
        }
    };
}

ulid_identifier!(
    /// Store-assigned identifier of a detected dead-lettered message
    ///
    /// Uses ULID so identifiers sort by detection time.
    DlqMessageId
);

ulid_identifier!(
    /// Identifier of an auto-replay rule
    RuleId
);

ulid_identifier!(
    /// Identifier of a replay history entry
    ReplayHistoryId
);

/// Opaque identifier of a registered broker namespace
///
/// Namespaces are registered outside of DLQ Keeper; the identifier is only
/// checked for basic well-formedness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamespaceId(String);

impl NamespaceId {
    /// Create new namespace ID with validation
    ///
    /// # Validation Rules
    /// - Must be 1-128 characters
    /// - Must not contain whitespace or control characters
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();

        if value.is_empty() {
            return Err(ValidationError::Required {
                field: "namespace_id".to_string(),
            });
        }

        if value.len() > 128 {
            return Err(ValidationError::TooLong {
                field: "namespace_id".to_string(),
                max_length: 128,
            });
        }

        if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ValidationError::InvalidCharacters {
                field: "namespace_id".to_string(),
                invalid_chars: "whitespace or control characters".to_string(),
            });
        }

        Ok(Self(value))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NamespaceId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for NamespaceId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NamespaceId> for String {
    fn from(value: NamespaceId) -> Self {
        value.0
    }
}

// ============================================================================
// Time Types
// ============================================================================

/// UTC timestamp with microsecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current moment
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Wrap an existing UTC date time
    pub fn from_datetime(value: DateTime<Utc>) -> Self {
        Self(value)
    }

    /// Parse timestamp from RFC3339 string
    pub fn from_rfc3339(s: &str) -> Result<Self, ParseError> {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|_| ParseError::InvalidFormat {
                expected: "RFC3339 datetime".to_string(),
                actual: s.to_string(),
            })?
            .with_timezone(&Utc);
        Ok(Self(dt))
    }

    /// Convert to RFC3339 string
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Calendar date (UTC) of this timestamp
    pub fn date(&self) -> NaiveDate {
        self.0.date_naive()
    }

    /// Add duration to timestamp
    pub fn add_duration(&self, duration: Duration) -> Self {
        let chrono_duration = chrono::Duration::from_std(duration).unwrap_or_default();
        Self(self.0 + chrono_duration)
    }

    /// Subtract duration from timestamp
    pub fn subtract_duration(&self, duration: Duration) -> Self {
        let chrono_duration = chrono::Duration::from_std(duration).unwrap_or_default();
        Self(self.0 - chrono_duration)
    }

    /// Get duration since another timestamp, zero if `other` is later
    pub fn duration_since(&self, other: Self) -> Duration {
        let chrono_duration = self.0.signed_duration_since(other.0);
        chrono_duration.to_std().unwrap_or_default()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// High-level error categorization for retry and alerting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Temporary failures that should be retried
    Transient,
    /// Permanent failures that won't succeed on retry
    Permanent,
    /// Requests rejected by a domain rule, never retried
    BusinessRule,
    /// Configuration errors preventing startup
    Configuration,
}

/// Error type for input validation failures
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' has invalid format: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    TooLong { field: String, max_length: usize },

    #[error("Field '{field}' is out of range: {message}")]
    OutOfRange { field: String, message: String },

    #[error("Field '{field}' contains invalid characters: {invalid_chars}")]
    InvalidCharacters {
        field: String,
        invalid_chars: String,
    },

    #[error("Field '{field}' is not allowed: {message}")]
    NotAllowed { field: String, message: String },
}

/// Error type for string parsing failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid format: expected {expected}, got '{actual}'")]
    InvalidFormat { expected: String, actual: String },
}

/// Top-level error type for DLQ Keeper operations
#[derive(Debug, thiserror::Error)]
pub enum DlqKeeperError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Rule error: {0}")]
    Rule(#[from] rules::RuleError),

    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    #[error("Business rule violation: {message}")]
    BusinessRule { message: String },

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] monitor::MonitorError),

    #[error("Executor error: {0}")]
    Executor(#[from] executor::ExecutorError),

    #[error("Broker error: {0}")]
    Broker(#[from] dlq_broker::BrokerError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] crate::config::ConfigError),
}

impl DlqKeeperError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Monitor(e) => e.is_transient(),
            Self::Executor(e) => e.is_transient(),
            Self::Broker(e) => e.is_transient(),
            Self::Validation(_)
            | Self::Parse(_)
            | Self::Rule(_)
            | Self::NotFound { .. }
            | Self::BusinessRule { .. }
            | Self::Configuration(_) => false,
        }
    }

    /// Get error category for monitoring and alerting
    pub fn error_category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::Parse(_) | Self::Rule(_) | Self::NotFound { .. } => {
                ErrorCategory::Permanent
            }
            Self::BusinessRule { .. } => ErrorCategory::BusinessRule,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Executor(e) if e.is_business_rule() => ErrorCategory::BusinessRule,
            other if other.is_transient() => ErrorCategory::Transient,
            _ => ErrorCategory::Permanent,
        }
    }
}

// ============================================================================
// Module declarations
// ============================================================================

/// Retry delay policies for broker calls
pub mod backoff;

/// Failure-category heuristics for dead-lettered messages
pub mod classifier;

/// Success-rate circuit breaker for auto-replay rules
pub mod circuit_breaker;

/// Layered configuration loading
pub mod config;

/// Detected dead-letter message model
pub mod dlq_message;

/// Replay execution with at-most-once semantics
pub mod executor;

/// Append-only replay audit trail model
pub mod history;

/// Wiring of all engine components
pub mod keeper;

/// DLQ scanning and detection
pub mod monitor;

/// Scan cycle orchestration and polling
pub mod orchestrator;

/// Per-rule sliding window rate limiting
pub mod rate_limit;

/// Auto-replay rules and their evaluation
pub mod rules;

/// Deferred replay scheduling
pub mod scheduler;

/// Management operations for rules, replays and reporting
pub mod service;

/// Persistence abstractions and the in-memory store
pub mod store;

// Re-export key types for convenience
pub use classifier::{Classification, FailureClassifier};
pub use crate::config::{ConfigError, DlqKeeperConfig};
pub use dlq_message::{DlqMessage, FailureCategory, MessageStatus};
pub use executor::{ExecutorError, ReplayExecutor, ReplayOutcome};
pub use history::{OutcomeStatus, ReplayHistory, ReplayStrategy};
pub use keeper::DlqKeeper;
pub use monitor::{DlqMonitor, MonitorError, ScanReport};
pub use orchestrator::{CycleReport, Orchestrator};
pub use rules::{
    AutoReplayRule, ConditionField, ConditionOperator, RuleAction, RuleCondition,
    RuleDefinition, RuleError, RuleSet,
};
pub use rules::engine::{EvaluationResult, RuleEngine, RuleMatch};
pub use service::DlqService;
pub use store::{DlqStore, InMemoryDlqStore, StoreError};

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

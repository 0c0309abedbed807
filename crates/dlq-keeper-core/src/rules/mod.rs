//! Auto-replay rules.
//!
//! A rule is a named, ordered list of [`RuleCondition`]s that are ANDed
//! together plus a [`RuleAction`] describing how matching messages are
//! replayed. Rules are validated when they are saved so the evaluator never
//! has to deal with malformed conditions.
//!
//! Rules can also be authored as YAML or JSON files containing a top-level
//! `rules:` list, see [`RuleSet::load_from_file`].

use crate::{RuleId, Timestamp, ValidationError};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub mod engine;

/// Maximum length of a rule name
pub const MAX_RULE_NAME_LENGTH: usize = 200;

// ============================================================================
// Conditions
// ============================================================================

/// Message field a condition inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionField {
    DeadLetterReason,
    DeadLetterErrorDescription,
    FailureCategory,
    EntityName,
    DeliveryCount,
    ContentType,
    TopicName,
    CorrelationId,
    BodyPreview,
    /// A key of the message's application properties, see `property_key`
    ApplicationProperty,
}

impl ConditionField {
    /// Whether the field holds a number
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::DeliveryCount)
    }
}

impl fmt::Display for ConditionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Comparison applied by a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionOperator {
    Contains,
    NotContains,
    Equals,
    NotEquals,
    StartsWith,
    EndsWith,
    Regex,
    GreaterThan,
    LessThan,
    /// Comma-separated allow-list
    In,
}

impl ConditionOperator {
    /// Whether the operator compares numbers
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::GreaterThan | Self::LessThan)
    }

    /// Whether the operator matches when the inspected value is absent
    pub fn is_negated(&self) -> bool {
        matches!(self, Self::NotContains | Self::NotEquals)
    }
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One predicate over a dead-lettered message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: ConditionField,
    pub operator: ConditionOperator,
    pub value: String,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_key: Option<String>,
}

impl RuleCondition {
    /// Create a case-insensitive condition
    pub fn new(field: ConditionField, operator: ConditionOperator, value: impl Into<String>) -> Self {
        Self {
            field,
            operator,
            value: value.into(),
            case_sensitive: false,
            property_key: None,
        }
    }

    /// Create a condition on an application property
    pub fn property(
        key: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<String>,
    ) -> Self {
        Self {
            property_key: Some(key.into()),
            ..Self::new(ConditionField::ApplicationProperty, operator, value)
        }
    }

    /// Make the comparison case-sensitive
    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    /// Validate the condition, `index` is used to name the offending field
    pub fn validate(&self, index: usize) -> Result<(), ValidationError> {
        let field = |name: &str| format!("conditions[{}].{}", index, name);

        match (&self.field, &self.property_key) {
            (ConditionField::ApplicationProperty, None) => {
                return Err(ValidationError::Required {
                    field: field("property_key"),
                });
            }
            (ConditionField::ApplicationProperty, Some(key)) if key.trim().is_empty() => {
                return Err(ValidationError::Required {
                    field: field("property_key"),
                });
            }
            (other, Some(_)) if *other != ConditionField::ApplicationProperty => {
                return Err(ValidationError::NotAllowed {
                    field: field("property_key"),
                    message: format!("only valid for ApplicationProperty, not {}", other),
                });
            }
            _ => {}
        }

        let allows_empty_value = matches!(
            self.operator,
            ConditionOperator::Equals | ConditionOperator::NotEquals
        );
        if self.value.trim().is_empty() && !allows_empty_value {
            return Err(ValidationError::Required {
                field: field("value"),
            });
        }

        if self.operator.is_numeric() {
            if !self.field.is_numeric() {
                return Err(ValidationError::NotAllowed {
                    field: field("operator"),
                    message: format!("{} requires a numeric field, not {}", self.operator, self.field),
                });
            }
            if self.value.trim().parse::<i64>().is_err() {
                return Err(ValidationError::InvalidFormat {
                    field: field("value"),
                    message: format!("'{}' is not an integer", self.value),
                });
            }
        }

        if self.operator == ConditionOperator::Regex {
            RegexBuilder::new(&self.value)
                .case_insensitive(!self.case_sensitive)
                .build()
                .map_err(|e| ValidationError::InvalidFormat {
                    field: field("value"),
                    message: format!("invalid regular expression: {}", e),
                })?;
        }

        if self.operator == ConditionOperator::In
            && self.value.split(',').all(|token| token.trim().is_empty())
        {
            return Err(ValidationError::InvalidFormat {
                field: field("value"),
                message: "allow-list has no entries".to_string(),
            });
        }

        Ok(())
    }
}

// ============================================================================
// Actions
// ============================================================================

/// What to do with a message that matches a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(default = "default_true")]
    pub auto_replay: bool,
    #[serde(default)]
    pub delay_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
    /// Entity path to replay to; defaults to the message's own entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_entity: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_replays_per_hour() -> u32 {
    100
}

impl Default for RuleAction {
    fn default() -> Self {
        Self {
            auto_replay: true,
            delay_seconds: 0,
            max_retries: default_max_retries(),
            exponential_backoff: true,
            target_entity: None,
        }
    }
}

impl RuleAction {
    /// Validate the action
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_retries == 0 {
            return Err(ValidationError::OutOfRange {
                field: "action.max_retries".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if let Some(target) = &self.target_entity {
            if target.trim().is_empty() {
                return Err(ValidationError::Required {
                    field: "action.target_entity".to_string(),
                });
            }
        }

        Ok(())
    }
}

// ============================================================================
// Rules
// ============================================================================

/// User-authored rule definition, as accepted by create and update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    #[serde(default)]
    pub action: RuleAction,
    #[serde(default = "default_max_replays_per_hour")]
    pub max_replays_per_hour: u32,
}

impl RuleDefinition {
    /// Create an enabled definition with default action and limits
    pub fn new(name: impl Into<String>, conditions: Vec<RuleCondition>) -> Self {
        Self {
            name: name.into(),
            description: None,
            enabled: true,
            conditions,
            action: RuleAction::default(),
            max_replays_per_hour: default_max_replays_per_hour(),
        }
    }

    /// Validate the definition, collecting every problem found
    pub fn validate(&self) -> Result<(), RuleError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError::Required {
                field: "name".to_string(),
            });
        } else if self.name.len() > MAX_RULE_NAME_LENGTH {
            errors.push(ValidationError::TooLong {
                field: "name".to_string(),
                max_length: MAX_RULE_NAME_LENGTH,
            });
        }

        if self.max_replays_per_hour == 0 {
            errors.push(ValidationError::OutOfRange {
                field: "max_replays_per_hour".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        for (index, condition) in self.conditions.iter().enumerate() {
            if let Err(e) = condition.validate(index) {
                errors.push(e);
            }
        }

        if let Err(e) = self.action.validate() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RuleError::Invalid {
                rule: self.name.clone(),
                errors,
            })
        }
    }
}

/// A stored auto-replay rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoReplayRule {
    pub id: RuleId,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub conditions: Vec<RuleCondition>,
    pub action: RuleAction,
    pub created_at: Timestamp,
    pub updated_at: Option<Timestamp>,
    /// Replays attempted by this rule
    pub match_count: u64,
    /// Replays that succeeded
    pub success_count: u64,
    pub max_replays_per_hour: u32,
}

impl AutoReplayRule {
    /// Create a new rule from a definition
    pub fn from_definition(definition: RuleDefinition) -> Self {
        Self {
            id: RuleId::new(),
            name: definition.name,
            description: definition.description,
            enabled: definition.enabled,
            conditions: definition.conditions,
            action: definition.action,
            created_at: Timestamp::now(),
            updated_at: None,
            match_count: 0,
            success_count: 0,
            max_replays_per_hour: definition.max_replays_per_hour,
        }
    }

    /// The user-editable part of the rule
    pub fn definition(&self) -> RuleDefinition {
        RuleDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            enabled: self.enabled,
            conditions: self.conditions.clone(),
            action: self.action.clone(),
            max_replays_per_hour: self.max_replays_per_hour,
        }
    }
}

// ============================================================================
// Rule Files
// ============================================================================

/// A file of rule definitions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

impl RuleSet {
    /// Load rule definitions from a YAML or JSON file
    ///
    /// The format is chosen from the file extension; unknown extensions are
    /// tried as JSON and then as YAML. Every rule is validated and all
    /// problems are reported together.
    ///
    /// # Errors
    ///
    /// - `RuleError::FileNotFound` - File missing
    /// - `RuleError::Parse` - Invalid YAML/JSON syntax
    /// - `RuleError::InvalidFile` - One or more rules failed validation
    pub fn load_from_file(path: &Path) -> Result<Self, RuleError> {
        if !path.exists() {
            return Err(RuleError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path).map_err(|e| RuleError::Parse {
            message: format!("Failed to read file: {}", e),
        })?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let rule_set: RuleSet = match extension.to_lowercase().as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| RuleError::Parse {
                message: format!("Invalid YAML: {}", e),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| RuleError::Parse {
                message: format!("Invalid JSON: {}", e),
            })?,
            _ => serde_json::from_str(&contents)
                .or_else(|_| serde_yaml::from_str(&contents))
                .map_err(|e| RuleError::Parse {
                    message: format!("Failed to parse as JSON or YAML: {}", e),
                })?,
        };

        rule_set.validate()?;

        Ok(rule_set)
    }

    /// Validate every rule in the set
    pub fn validate(&self) -> Result<(), RuleError> {
        let mut errors = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for rule in &self.rules {
            if !seen.insert(rule.name.as_str()) {
                errors.push(format!("Duplicate rule name: {}", rule.name));
            }
            if let Err(RuleError::Invalid {
                rule: name,
                errors: rule_errors,
            }) = rule.validate()
            {
                errors.extend(
                    rule_errors
                        .into_iter()
                        .map(|e| format!("Rule '{}': {}", name, e)),
                );
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RuleError::InvalidFile { errors })
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while validating or loading rules
#[derive(Debug, Clone, Error)]
pub enum RuleError {
    #[error("Rule '{rule}' is invalid: {}", format_errors(.errors))]
    Invalid {
        rule: String,
        errors: Vec<ValidationError>,
    },

    #[error("Rule file not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to parse rule file: {message}")]
    Parse { message: String },

    #[error("Rule file validation failed: {errors:?}")]
    InvalidFile { errors: Vec<String> },
}

impl RuleError {
    /// Rule errors never succeed on retry
    pub fn is_transient(&self) -> bool {
        false
    }
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

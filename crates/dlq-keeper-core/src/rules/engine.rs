//! Stateless rule evaluation.
//!
//! Conditions are ANDed and evaluation stops at the first condition that
//! does not hold. A rule with no conditions never matches. Malformed
//! conditions (an uncompilable pattern, a numeric operator on a text field)
//! never raise errors here; they simply do not match.
//!
//! Regex patterns are compiled once and shared by every clone of an engine.

use super::{AutoReplayRule, ConditionField, ConditionOperator, RuleAction, RuleCondition};
use crate::dlq_message::DlqMessage;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Outcome of evaluating a rule's conditions against one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub is_match: bool,
    /// Conditions that held before evaluation stopped
    pub matched_condition_count: usize,
    pub reason: String,
}

/// A rule that matched a message, with the action to apply
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub rule: AutoReplayRule,
    pub action: RuleAction,
}

/// Compiled patterns keyed by source text and case sensitivity
///
/// `None` records a pattern that failed to compile.
type PatternCache = HashMap<(String, bool), Option<Regex>>;

/// Upper bound on cached patterns; the cache is cleared when it fills
const MAX_CACHED_PATTERNS: usize = 512;

/// Condition evaluator and rule selector
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    patterns: Arc<RwLock<PatternCache>>,
}

impl RuleEngine {
    /// Create an engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate ANDed conditions against a message
    pub fn evaluate(&self, message: &DlqMessage, conditions: &[RuleCondition]) -> EvaluationResult {
        if conditions.is_empty() {
            return EvaluationResult {
                is_match: false,
                matched_condition_count: 0,
                reason: "rule has no conditions".to_string(),
            };
        }

        for (index, condition) in conditions.iter().enumerate() {
            if !self.condition_holds(message, condition) {
                return EvaluationResult {
                    is_match: false,
                    matched_condition_count: index,
                    reason: format!(
                        "condition {} failed: {} {} '{}'",
                        index + 1,
                        describe_field(condition),
                        condition.operator,
                        condition.value
                    ),
                };
            }
        }

        EvaluationResult {
            is_match: true,
            matched_condition_count: conditions.len(),
            reason: format!("all {} conditions matched", conditions.len()),
        }
    }

    /// Select the enabled rules matching a message, in stored order
    pub fn find_matching_rules(
        &self,
        message: &DlqMessage,
        rules: &[AutoReplayRule],
    ) -> Vec<RuleMatch> {
        rules
            .iter()
            .filter(|rule| rule.enabled)
            .filter(|rule| {
                let result = self.evaluate(message, &rule.conditions);
                debug!(
                    message_id = %message.id,
                    rule_id = %rule.id,
                    is_match = result.is_match,
                    reason = %result.reason,
                    "Evaluated rule"
                );
                result.is_match
            })
            .map(|rule| RuleMatch {
                rule: rule.clone(),
                action: rule.action.clone(),
            })
            .collect()
    }

    /// Check a single condition
    pub fn condition_holds(&self, message: &DlqMessage, condition: &RuleCondition) -> bool {
        if condition.operator.is_numeric() {
            return numeric_condition_holds(message, condition);
        }

        let actual = match field_value(message, condition) {
            FieldValue::Present(value) => value,
            FieldValue::Absent if condition.operator.is_negated() => return true,
            FieldValue::Absent => Cow::Borrowed(""),
            FieldValue::MissingProperty => return false,
        };

        if condition.operator == ConditionOperator::Regex {
            return self
                .compiled(&condition.value, condition.case_sensitive)
                .is_some_and(|re| re.is_match(&actual));
        }

        let (actual, expected) = if condition.case_sensitive {
            (actual, Cow::Borrowed(condition.value.as_str()))
        } else {
            (
                Cow::Owned(actual.to_lowercase()),
                Cow::Owned(condition.value.to_lowercase()),
            )
        };

        match condition.operator {
            ConditionOperator::Contains => actual.contains(expected.as_ref()),
            ConditionOperator::NotContains => !actual.contains(expected.as_ref()),
            ConditionOperator::Equals => actual == expected,
            ConditionOperator::NotEquals => actual != expected,
            ConditionOperator::StartsWith => actual.starts_with(expected.as_ref()),
            ConditionOperator::EndsWith => actual.ends_with(expected.as_ref()),
            ConditionOperator::In => expected
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .any(|token| token == actual.trim()),
            ConditionOperator::Regex
            | ConditionOperator::GreaterThan
            | ConditionOperator::LessThan => false,
        }
    }

    /// Look up or compile a pattern
    fn compiled(&self, pattern: &str, case_sensitive: bool) -> Option<Regex> {
        let key = (pattern.to_string(), case_sensitive);
        if let Ok(patterns) = self.patterns.read() {
            if let Some(cached) = patterns.get(&key) {
                return cached.clone();
            }
        }

        let compiled = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .ok();

        if let Ok(mut patterns) = self.patterns.write() {
            if patterns.len() >= MAX_CACHED_PATTERNS {
                patterns.clear();
            }
            patterns.insert(key, compiled.clone());
        }
        compiled
    }
}

enum FieldValue<'a> {
    Present(Cow<'a, str>),
    /// Optional field not set on the message
    Absent,
    /// Application property key not present
    MissingProperty,
}

fn field_value<'a>(message: &'a DlqMessage, condition: &RuleCondition) -> FieldValue<'a> {
    let optional = |value: &'a Option<String>| match value {
        Some(v) => FieldValue::Present(Cow::Borrowed(v.as_str())),
        None => FieldValue::Absent,
    };

    match condition.field {
        ConditionField::DeadLetterReason => optional(&message.dead_letter_reason),
        ConditionField::DeadLetterErrorDescription => {
            optional(&message.dead_letter_error_description)
        }
        ConditionField::FailureCategory => {
            FieldValue::Present(Cow::Borrowed(message.failure_category.as_str()))
        }
        ConditionField::EntityName => FieldValue::Present(Cow::Borrowed(&message.entity_name)),
        ConditionField::DeliveryCount => {
            FieldValue::Present(Cow::Owned(message.delivery_count.to_string()))
        }
        ConditionField::ContentType => optional(&message.content_type),
        ConditionField::TopicName => optional(&message.topic_name),
        ConditionField::CorrelationId => optional(&message.correlation_id),
        ConditionField::BodyPreview => FieldValue::Present(Cow::Borrowed(&message.body_preview)),
        ConditionField::ApplicationProperty => {
            let key = condition.property_key.as_deref().unwrap_or_default();
            match message.application_properties.get(key) {
                Some(v) => FieldValue::Present(Cow::Borrowed(v.as_str())),
                None => FieldValue::MissingProperty,
            }
        }
    }
}

fn numeric_condition_holds(message: &DlqMessage, condition: &RuleCondition) -> bool {
    if !condition.field.is_numeric() {
        return false;
    }

    let Ok(threshold) = condition.value.trim().parse::<i64>() else {
        return false;
    };
    let actual = i64::from(message.delivery_count);

    match condition.operator {
        ConditionOperator::GreaterThan => actual > threshold,
        ConditionOperator::LessThan => actual < threshold,
        _ => false,
    }
}

fn describe_field(condition: &RuleCondition) -> String {
    match &condition.property_key {
        Some(key) => format!("{}[{}]", condition.field, key),
        None => condition.field.to_string(),
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

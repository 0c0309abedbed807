//! Replay execution with at-most-once semantics.
//!
//! The executor turns a rule match (or an operator request) into a broker
//! replay. A message is replayed at most once:
//!
//! 1. only Active messages are accepted;
//! 2. an in-process claim on the message id is held from the status check
//!    until the outcome is recorded, including while a delayed replay waits;
//! 3. the store transition to Replayed is a compare-and-set from Active.
//!
//! Rule replays are additionally guarded by the per-rule rate limiter and
//! the success-rate circuit breaker. History rows are written only after the
//! broker call has completed.
//!
//! Once the executor is cancelled, replays stop before their next broker
//! attempt and leave the message and its history untouched. A broker call
//! already in flight completes and is recorded.

use crate::backoff::BackoffPolicy;
use crate::circuit_breaker::{BreakerDecision, RuleCircuitBreaker, RuleHealth};
use crate::dlq_message::DlqMessage;
use crate::history::{ReplayHistory, ReplayStrategy};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::rules::{AutoReplayRule, RuleAction};
use crate::store::{DlqStore, StoreError};
use crate::{DlqMessageId, ReplayHistoryId, RuleId, Timestamp};
use dlq_broker::{BrokerError, EntityRef, MessageBroker};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Actor recorded on history rows written by rule-driven replays
pub const AUTO_REPLAY_ACTOR: &str = "auto-replay";

// ============================================================================
// Configuration
// ============================================================================

/// Executor retry and timeout settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Delay before the first retry of a failed broker call
    pub retry_base_delay_ms: u64,

    /// Cap on exponential retry delays
    pub retry_max_delay_ms: u64,

    /// Timeout applied to each broker replay call
    pub broker_timeout_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            broker_timeout_seconds: 30,
        }
    }
}

impl ExecutorConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_secs(self.broker_timeout_seconds)
    }
}

// ============================================================================
// Outcomes and Errors
// ============================================================================

/// Successful result of a replay request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplayOutcome {
    /// The message was resubmitted to `target`
    Replayed {
        history_id: ReplayHistoryId,
        attempts: u32,
        target: String,
    },
    /// The replay was deferred and will run at `run_at`
    Scheduled { run_at: Timestamp },
}

/// Errors returned by the executor
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Rule {rule_id} exceeded its hourly replay limit, retry after {retry_after:?}")]
    RateLimited {
        rule_id: RuleId,
        retry_after: Duration,
    },

    #[error("Replay failed after {attempts} attempt(s): {source}")]
    Broker {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("Message {message_id} is not active or is already being replayed")]
    AlreadyReplayed { message_id: DlqMessageId },

    #[error("Rule {rule_id} is disabled")]
    RuleDisabled { rule_id: RuleId },

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("Executor is shutting down")]
    ShuttingDown,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ExecutorError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::ShuttingDown => true,
            Self::Broker { source, .. } => source.is_transient(),
            Self::Store(e) => e.is_transient(),
            Self::AlreadyReplayed { .. } | Self::RuleDisabled { .. } | Self::NotFound { .. } => {
                false
            }
        }
    }

    /// Check if the request was rejected by a domain rule
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            Self::AlreadyReplayed { .. } | Self::RuleDisabled { .. }
        )
    }
}

// ============================================================================
// Message Claims
// ============================================================================

type ClaimSet = Arc<Mutex<HashSet<DlqMessageId>>>;

/// Exclusive in-process claim on a message, released on drop
struct ClaimGuard {
    claims: ClaimSet,
    message_id: DlqMessageId,
}

impl ClaimGuard {
    fn acquire(claims: &ClaimSet, message_id: DlqMessageId) -> Option<Self> {
        let mut held = claims.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(message_id) {
            return None;
        }
        Some(Self {
            claims: claims.clone(),
            message_id,
        })
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut held = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.message_id);
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Options for a rule-driven replay
#[derive(Debug, Clone, Copy)]
pub(crate) struct RuleReplay<'a> {
    pub strategy: ReplayStrategy,
    pub actor: &'a str,
    /// Run immediately even when the action asks for a delay
    pub bypass_delay: bool,
}

/// Performs replays against the broker and records their outcome
#[derive(Clone)]
pub struct ReplayExecutor {
    broker: Arc<dyn MessageBroker>,
    store: Arc<dyn DlqStore>,
    rate_limiter: Arc<RateLimiter>,
    breaker: RuleCircuitBreaker,
    scheduler: Arc<crate::scheduler::ReplayScheduler>,
    claims: ClaimSet,
    config: ExecutorConfig,
}

impl ReplayExecutor {
    /// Create an executor
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        store: Arc<dyn DlqStore>,
        rate_limiter: Arc<RateLimiter>,
        breaker: RuleCircuitBreaker,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            broker,
            store,
            rate_limiter,
            breaker,
            scheduler: Arc::new(crate::scheduler::ReplayScheduler::new()),
            claims: Arc::new(Mutex::new(HashSet::new())),
            config,
        }
    }

    /// The limiter shared by all clones of this executor
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// The scheduler holding deferred replays
    pub fn scheduler(&self) -> &Arc<crate::scheduler::ReplayScheduler> {
        &self.scheduler
    }

    /// Stop deferred and in-flight replays without waiting for them
    pub fn cancel(&self) {
        self.scheduler.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.scheduler.is_shutting_down()
    }

    /// Cancel deferred replays and wait for running ones
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    /// Replay a message matched by `rule`, applying `action`
    pub async fn execute(
        &self,
        message: &DlqMessage,
        rule: &AutoReplayRule,
        action: &RuleAction,
    ) -> Result<ReplayOutcome, ExecutorError> {
        self.execute_rule(
            message.id,
            rule.id,
            action,
            RuleReplay {
                strategy: ReplayStrategy::AutoReplay,
                actor: AUTO_REPLAY_ACTOR,
                bypass_delay: false,
            },
        )
        .await
    }

    /// Replay a message on behalf of an operator, without a rule
    ///
    /// Rate limits and the circuit breaker do not apply. `target` overrides
    /// the message's own entity.
    pub async fn replay_manual(
        &self,
        message_id: &DlqMessageId,
        actor: &str,
        target: Option<String>,
    ) -> Result<ReplayOutcome, ExecutorError> {
        let (claim, message) = self.claim_active(message_id).await?;

        let action = RuleAction {
            target_entity: target,
            ..RuleAction::default()
        };
        self.perform(claim, &message, None, &action, ReplayStrategy::Manual, actor)
            .await
    }

    pub(crate) async fn execute_rule(
        &self,
        message_id: DlqMessageId,
        rule_id: RuleId,
        action: &RuleAction,
        options: RuleReplay<'_>,
    ) -> Result<ReplayOutcome, ExecutorError> {
        let (claim, message) = self.claim_active(&message_id).await?;

        // Re-read the rule so a concurrent disablement is observed
        let rule = self
            .store
            .get_rule(&rule_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound {
                resource: "rule",
                id: rule_id.to_string(),
            })?;
        if !rule.enabled {
            return Err(ExecutorError::RuleDisabled { rule_id });
        }

        if self.check_breaker(&rule, &message).await? {
            return Err(ExecutorError::RuleDisabled { rule_id });
        }

        if let RateDecision::Limited { retry_after } = self
            .rate_limiter
            .try_acquire(&rule.id, rule.max_replays_per_hour)
        {
            warn!(
                rule_id = %rule.id,
                message_id = %message.id,
                limit = rule.max_replays_per_hour,
                retry_after_secs = retry_after.as_secs(),
                "Rule rate limit reached, skipping replay"
            );
            return Err(ExecutorError::RateLimited {
                rule_id: rule.id,
                retry_after,
            });
        }

        if action.delay_seconds > 0 && !options.bypass_delay {
            return self.defer(claim, message, rule, action.clone(), options.strategy);
        }

        self.perform(
            claim,
            &message,
            Some(&rule),
            action,
            options.strategy,
            options.actor,
        )
        .await
    }

    /// Claim a message, then confirm it is still Active
    ///
    /// The status is read under the claim, so a replay that finished while
    /// this caller waited is observed.
    async fn claim_active(
        &self,
        message_id: &DlqMessageId,
    ) -> Result<(ClaimGuard, DlqMessage), ExecutorError> {
        let claim = ClaimGuard::acquire(&self.claims, *message_id).ok_or(
            ExecutorError::AlreadyReplayed {
                message_id: *message_id,
            },
        )?;
        let message = self.load_active(message_id).await?;
        Ok((claim, message))
    }

    async fn load_active(&self, message_id: &DlqMessageId) -> Result<DlqMessage, ExecutorError> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound {
                resource: "message",
                id: message_id.to_string(),
            })?;
        if !message.is_active() {
            return Err(ExecutorError::AlreadyReplayed {
                message_id: message.id,
            });
        }
        Ok(message)
    }

    /// Hand a claimed, rate-limited replay to the scheduler
    fn defer(
        &self,
        claim: ClaimGuard,
        message: DlqMessage,
        rule: AutoReplayRule,
        action: RuleAction,
        strategy: ReplayStrategy,
    ) -> Result<ReplayOutcome, ExecutorError> {
        let delay = Duration::from_secs(action.delay_seconds);
        let run_at = Timestamp::now().add_duration(delay);
        let executor = self.clone();
        let message_id = message.id;
        let rule_id = rule.id;

        let scheduled = self.scheduler.schedule(delay, async move {
            executor
                .run_deferred(claim, message_id, rule_id, action, strategy)
                .await;
        });
        if !scheduled {
            return Err(ExecutorError::ShuttingDown);
        }

        debug!(
            message_id = %message_id,
            rule_id = %rule_id,
            run_at = %run_at,
            "Deferred replay scheduled"
        );
        Ok(ReplayOutcome::Scheduled { run_at })
    }

    async fn run_deferred(
        &self,
        claim: ClaimGuard,
        message_id: DlqMessageId,
        rule_id: RuleId,
        action: RuleAction,
        strategy: ReplayStrategy,
    ) {
        let message = match self.load_active(&message_id).await {
            Ok(message) => message,
            Err(e) => {
                debug!(message_id = %message_id, error = %e, "Deferred replay no longer applicable");
                return;
            }
        };
        let rule = match self.store.get_rule(&rule_id).await {
            Ok(Some(rule)) if rule.enabled => rule,
            Ok(_) => {
                debug!(rule_id = %rule_id, "Rule removed or disabled before deferred replay");
                return;
            }
            Err(e) => {
                error!(rule_id = %rule_id, error = %e, "Failed to load rule for deferred replay");
                return;
            }
        };

        if let Err(e) = self
            .perform(claim, &message, Some(&rule), &action, strategy, AUTO_REPLAY_ACTOR)
            .await
        {
            debug!(message_id = %message_id, error = %e, "Deferred replay did not succeed");
        }
    }

    /// Call the broker with retries and record the outcome
    async fn perform(
        &self,
        _claim: ClaimGuard,
        message: &DlqMessage,
        rule: Option<&AutoReplayRule>,
        action: &RuleAction,
        strategy: ReplayStrategy,
        actor: &str,
    ) -> Result<ReplayOutcome, ExecutorError> {
        let target = action
            .target_entity
            .clone()
            .unwrap_or_else(|| message.entity_name.clone());
        let target_ref = EntityRef::from_path(&target);
        let source = message.entity();
        let policy = BackoffPolicy::for_action(
            action,
            self.config.retry_base_delay(),
            self.config.retry_max_delay(),
        );
        let max_attempts = action.max_retries.max(1);
        let timeout = self.config.broker_timeout();

        let mut attempts = 0;
        let result = loop {
            if self.is_cancelled() {
                info!(
                    message_id = %message.id,
                    attempts,
                    "Replay stopped by shutdown before its next attempt"
                );
                return Err(ExecutorError::ShuttingDown);
            }
            attempts += 1;
            let call = self.broker.replay(
                message.namespace_id.as_str(),
                &source,
                message.sequence_number,
                &target_ref,
            );
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Timeout { duration: timeout }),
            };

            match result {
                Ok(()) => break Ok(()),
                Err(e) if e.is_transient() && attempts < max_attempts => {
                    let delay = policy.delay_for(attempts - 1);
                    warn!(
                        message_id = %message.id,
                        attempt = attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Replay attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;

                        _ = self.scheduler.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let rule_id = rule.map(|r| r.id);
        let now = Timestamp::now();

        match result {
            Ok(()) => {
                tolerate_conflict(self.store.mark_replayed(&message.id, now).await, message)?;
                if let Some(rule_id) = rule_id {
                    self.store.increment_counters(&rule_id, 1, 1).await?;
                }

                let entry = ReplayHistory::success(message.id, rule_id, actor, strategy, &target);
                let history_id = entry.id;
                self.store.append_history(entry).await?;

                info!(
                    message_id = %message.id,
                    rule_id = ?rule_id,
                    strategy = %strategy,
                    target = %target,
                    attempts,
                    "Message replayed"
                );

                if let Some(rule) = rule {
                    self.check_breaker(rule, message).await?;
                }

                Ok(ReplayOutcome::Replayed {
                    history_id,
                    attempts,
                    target,
                })
            }
            Err(source) => {
                tolerate_conflict(
                    self.store.mark_replay_failed(&message.id, now).await,
                    message,
                )?;
                if let Some(rule_id) = rule_id {
                    self.store.increment_counters(&rule_id, 1, 0).await?;
                }

                let details = format!("{} [{}] after {} attempt(s)", source, source.code(), attempts);
                self.store
                    .append_history(ReplayHistory::failure(
                        message.id, rule_id, actor, strategy, &target, details,
                    ))
                    .await?;

                error!(
                    message_id = %message.id,
                    rule_id = ?rule_id,
                    strategy = %strategy,
                    target = %target,
                    attempts,
                    error = %source,
                    "Replay failed after exhausting retries"
                );

                if let Some(rule) = rule {
                    self.check_breaker(rule, message).await?;
                }

                Err(ExecutorError::Broker { attempts, source })
            }
        }
    }

    /// Assess the rule's recent attempts, disabling it when the breaker trips
    ///
    /// Returns `true` when the rule is tripped, whether or not this call was
    /// the one that disabled it.
    async fn check_breaker(
        &self,
        rule: &AutoReplayRule,
        message: &DlqMessage,
    ) -> Result<bool, ExecutorError> {
        let recent = self
            .store
            .recent_attempts(&rule.id, self.breaker.window_size())
            .await?;
        let health = match self.breaker.assess(&recent) {
            BreakerDecision::Trip(health) => health,
            BreakerDecision::Healthy(_) | BreakerDecision::InsufficientSamples(_) => {
                return Ok(false)
            }
        };

        if self.store.disable_if_enabled(&rule.id).await? {
            self.record_trip(rule, message, health).await?;
        }
        Ok(true)
    }

    async fn record_trip(
        &self,
        rule: &AutoReplayRule,
        message: &DlqMessage,
        health: RuleHealth,
    ) -> Result<(), ExecutorError> {
        let details = format!(
            "Circuit breaker disabled rule: {} of {} recent replays succeeded ({:.1}%)",
            health.successes,
            health.attempts,
            health.success_rate * 100.0
        );
        self.store
            .append_history(ReplayHistory::rule_disabled(
                message.id,
                rule.id,
                &message.entity_name,
                &details,
            ))
            .await?;

        warn!(
            rule_id = %rule.id,
            rule_name = %rule.name,
            attempts = health.attempts,
            successes = health.successes,
            success_rate = health.success_rate,
            "Circuit breaker disabled auto-replay rule"
        );
        Ok(())
    }
}

/// Accept a status conflict after the broker call already happened
///
/// The broker state is authoritative at that point; the history row is
/// still written so the replay is auditable.
fn tolerate_conflict(
    result: Result<DlqMessage, StoreError>,
    message: &DlqMessage,
) -> Result<(), StoreError> {
    match result {
        Ok(_) => Ok(()),
        Err(StoreError::StatusConflict { actual, .. }) => {
            warn!(
                message_id = %message.id,
                status = %actual,
                "Message status changed during replay"
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;

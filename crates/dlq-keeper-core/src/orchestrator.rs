//! Scan cycle orchestration and polling.
//!
//! One cycle for a namespace runs Monitor → Rule Engine → Executor:
//!
//! 1. scan the namespace for newly dead-lettered messages;
//! 2. evaluate every Active message against the enabled rules;
//! 3. submit each auto-replay match to the executor.
//!
//! Messages are remediated as independent tasks bounded by a semaphore, so a
//! slow or failing replay never holds up the rest of the cycle. Namespaces
//! are likewise processed concurrently up to a configured limit.

use crate::dlq_message::DlqMessage;
use crate::executor::{ExecutorError, ReplayExecutor, ReplayOutcome};
use crate::monitor::{DlqMonitor, MonitorError, ScanReport};
use crate::rules::engine::RuleEngine;
use crate::rules::AutoReplayRule;
use crate::store::{DlqStore, MessageFilter};
use crate::NamespaceId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Pause between polling cycles
    pub scan_interval_seconds: u64,

    /// Namespaces processed at the same time
    pub max_concurrent_namespaces: usize,

    /// Replays in flight at the same time within one namespace cycle
    pub max_concurrent_replays: usize,

    /// Namespaces polled by the service
    pub namespaces: Vec<NamespaceId>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scan_interval_seconds: 60,
            max_concurrent_namespaces: 4,
            max_concurrent_replays: 16,
            namespaces: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_seconds)
    }
}

/// Tallies of one namespace cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub namespace_id: Option<NamespaceId>,
    pub scan: ScanReport,
    /// Active messages evaluated against the rules
    pub scanned: usize,
    /// Messages newly detected by the scan
    pub detected: usize,
    /// Rule matches submitted for replay
    pub matched: usize,
    pub replayed: usize,
    pub scheduled: usize,
    pub rate_limited: usize,
    pub failed: usize,
    /// Matches not acted on: manual-only rules, disabled rules, claimed messages
    pub skipped: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
struct MessageTally {
    matched: usize,
    replayed: usize,
    scheduled: usize,
    rate_limited: usize,
    failed: usize,
    skipped: usize,
}

impl CycleReport {
    fn absorb(&mut self, tally: MessageTally) {
        self.matched += tally.matched;
        self.replayed += tally.replayed;
        self.scheduled += tally.scheduled;
        self.rate_limited += tally.rate_limited;
        self.failed += tally.failed;
        self.skipped += tally.skipped;
    }
}

/// Drives scan cycles across namespaces
#[derive(Clone)]
pub struct Orchestrator {
    monitor: DlqMonitor,
    executor: ReplayExecutor,
    store: Arc<dyn DlqStore>,
    engine: RuleEngine,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        monitor: DlqMonitor,
        executor: ReplayExecutor,
        store: Arc<dyn DlqStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            monitor,
            executor,
            store,
            engine: RuleEngine::new(),
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one scan and remediation cycle for a namespace
    pub async fn run_cycle(&self, namespace_id: &NamespaceId) -> Result<CycleReport, MonitorError> {
        let started = Instant::now();
        let scan = self.monitor.scan_namespace(namespace_id).await?;

        let rules = Arc::new(self.store.list_rules().await?);
        let messages = self
            .store
            .list_messages(&MessageFilter::active_in(namespace_id))
            .await?;

        let mut report = CycleReport {
            namespace_id: Some(namespace_id.clone()),
            detected: scan.newly_detected,
            scanned: messages.len(),
            scan,
            ..Default::default()
        };

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_replays.max(1)));
        let mut tasks = JoinSet::new();
        for message in messages {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if self.executor.is_cancelled() {
                debug!(namespace = %namespace_id, "Shutdown requested, not starting further remediation");
                break;
            }
            let executor = self.executor.clone();
            let engine = self.engine.clone();
            let rules = rules.clone();
            tasks.spawn(async move {
                let _permit = permit;
                remediate(&engine, &executor, &message, &rules).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(tally) => report.absorb(tally),
                Err(e) => {
                    error!(namespace = %namespace_id, error = %e, "Remediation task failed");
                    report.failed += 1;
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            namespace = %namespace_id,
            scanned = report.scanned,
            detected = report.detected,
            matched = report.matched,
            replayed = report.replayed,
            scheduled = report.scheduled,
            rate_limited = report.rate_limited,
            failed = report.failed,
            skipped = report.skipped,
            duration_ms = report.duration_ms,
            "Remediation cycle complete"
        );
        Ok(report)
    }

    /// Run one cycle for each namespace, bounded by `max_concurrent_namespaces`
    ///
    /// Results are returned in the order of `namespaces`.
    pub async fn run_all(
        &self,
        namespaces: &[NamespaceId],
    ) -> Vec<(NamespaceId, Result<CycleReport, MonitorError>)> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_namespaces.max(1)));
        let mut tasks = JoinSet::new();

        for (index, namespace_id) in namespaces.iter().cloned().enumerate() {
            let orchestrator = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => orchestrator.run_cycle(&namespace_id).await,
                    Err(_) => Ok(CycleReport::default()),
                };
                (index, namespace_id, result)
            });
        }

        let mut results = Vec::with_capacity(namespaces.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "Namespace cycle task failed"),
            }
        }

        results.sort_by_key(|(index, _, _)| *index);
        results
            .into_iter()
            .map(|(_, namespace_id, result)| (namespace_id, result))
            .collect()
    }

    /// Poll the namespaces every `interval` until `shutdown` is cancelled
    ///
    /// Cancellation reaches the cycle in progress: no further remediation is
    /// started and running replays stop before their next broker attempt.
    /// Deferred replays are cancelled on exit.
    pub async fn run_forever(
        &self,
        namespaces: Vec<NamespaceId>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        info!(
            namespaces = namespaces.len(),
            interval_secs = interval.as_secs(),
            "Starting remediation polling loop"
        );

        let stop_replays = {
            let executor = self.executor.clone();
            let shutdown = shutdown.clone();
            async move {
                shutdown.cancelled().await;
                executor.cancel();
            }
        };
        tokio::join!(self.poll(&namespaces, interval, &shutdown), stop_replays);

        self.executor.shutdown().await;
        info!("Remediation polling loop stopped");
    }

    async fn poll(&self, namespaces: &[NamespaceId], interval: Duration, shutdown: &CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            for (namespace_id, result) in self.run_all(namespaces).await {
                if let Err(e) = result {
                    warn!(
                        namespace = %namespace_id,
                        error = %e,
                        transient = e.is_transient(),
                        "Namespace cycle failed"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested during poll wait");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

/// Apply matching rules to one message until one of them takes it
async fn remediate(
    engine: &RuleEngine,
    executor: &ReplayExecutor,
    message: &DlqMessage,
    rules: &[AutoReplayRule],
) -> MessageTally {
    let mut tally = MessageTally::default();

    for rule_match in engine.find_matching_rules(message, rules) {
        if !rule_match.action.auto_replay {
            tally.skipped += 1;
            continue;
        }
        tally.matched += 1;

        let result = executor
            .execute(message, &rule_match.rule, &rule_match.action)
            .await;
        debug!(
            message_id = %message.id,
            rule_id = %rule_match.rule.id,
            outcome = ?result.as_ref().map_err(|e| e.to_string()),
            "Applied rule"
        );

        match result {
            Ok(ReplayOutcome::Replayed { .. }) => {
                tally.replayed += 1;
                break;
            }
            Ok(ReplayOutcome::Scheduled { .. }) => {
                tally.scheduled += 1;
                break;
            }
            Err(ExecutorError::AlreadyReplayed { .. }) => {
                tally.skipped += 1;
                break;
            }
            Err(ExecutorError::RateLimited { .. }) => {
                tally.rate_limited += 1;
            }
            Err(ExecutorError::RuleDisabled { .. }) => {
                tally.skipped += 1;
            }
            Err(ExecutorError::ShuttingDown) => {
                tally.skipped += 1;
                break;
            }
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    rule_id = %rule_match.rule.id,
                    error = %e,
                    "Remediation failed"
                );
                tally.failed += 1;
                break;
            }
        }
    }

    tally
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;

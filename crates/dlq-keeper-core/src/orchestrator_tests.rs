//! Tests for scan cycle orchestration

use super::*;
use crate::circuit_breaker::RuleCircuitBreaker;
use crate::executor::ExecutorConfig;
use crate::monitor::MonitorConfig;
use crate::rate_limit::RateLimiter;
use crate::rules::{ConditionField, ConditionOperator, RuleCondition, RuleDefinition};
use crate::store::{InMemoryDlqStore, MessageStore, RuleStore};
use crate::test_support::{lock_rule, namespace, NS};
use crate::MessageStatus;
use dlq_broker::{EntityRef, InMemoryBroker, OutgoingMessage};

struct Harness {
    broker: Arc<InMemoryBroker>,
    store: Arc<InMemoryDlqStore>,
    orchestrator: Orchestrator,
}

fn harness() -> Harness {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_namespace(NS).unwrap();
    let store = Arc::new(InMemoryDlqStore::new());
    let monitor = DlqMonitor::new(broker.clone(), store.clone(), MonitorConfig::default());
    let executor = ReplayExecutor::new(
        broker.clone(),
        store.clone(),
        Arc::new(RateLimiter::default()),
        RuleCircuitBreaker::default(),
        ExecutorConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            broker_timeout_seconds: 5,
        },
    );
    let orchestrator = Orchestrator::new(
        monitor,
        executor,
        store.clone(),
        OrchestratorConfig {
            max_concurrent_replays: 4,
            ..Default::default()
        },
    );
    Harness {
        broker,
        store,
        orchestrator,
    }
}

impl Harness {
    fn dead_letter(&self, entity: &EntityRef, reason: &str) -> i64 {
        self.broker.create_entity(NS, entity).unwrap();
        self.broker
            .seed_dead_letter(NS, entity, OutgoingMessage::new("payload"), Some(reason), None, 2)
            .unwrap()
    }

    async fn add_rule(&self, rule: &AutoReplayRule) {
        self.store.insert_rule(rule.clone()).await.unwrap();
    }
}

fn poison_rule() -> AutoReplayRule {
    AutoReplayRule::from_definition(RuleDefinition::new(
        "poison",
        vec![RuleCondition::new(
            ConditionField::DeadLetterReason,
            ConditionOperator::Equals,
            "PoisonMessage",
        )],
    ))
}

mod cycle_tests {
    use super::*;

    /// Verify a cycle detects, matches and replays messages
    #[tokio::test]
    async fn test_cycle_replays_matching_messages() {
        let h = harness();
        let orders = EntityRef::queue("orders");
        h.dead_letter(&orders, "MessageLockLost");
        h.dead_letter(&orders, "MessageLockLost");
        h.dead_letter(&orders, "PoisonMessage");
        h.add_rule(&lock_rule(100)).await;

        let report = h.orchestrator.run_cycle(&namespace()).await.unwrap();

        assert_eq!(report.detected, 3);
        assert_eq!(report.scanned, 3);
        assert_eq!(report.matched, 2);
        assert_eq!(report.replayed, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(h.broker.dead_letter_count(NS, &orders).unwrap(), 1);

        let second = h.orchestrator.run_cycle(&namespace()).await.unwrap();
        assert_eq!(second.detected, 0);
        assert_eq!(second.scanned, 1);
        assert_eq!(second.matched, 0);
    }

    /// Verify the per-rule hourly limit is honored within a cycle
    #[tokio::test]
    async fn test_cycle_respects_rate_limit() {
        let h = harness();
        let orders = EntityRef::queue("orders");
        for _ in 0..5 {
            h.dead_letter(&orders, "MessageLockLost");
        }
        h.add_rule(&lock_rule(3)).await;

        let report = h.orchestrator.run_cycle(&namespace()).await.unwrap();

        assert_eq!(report.replayed, 3);
        assert_eq!(report.rate_limited, 2);
        assert_eq!(h.broker.replay_calls(), 3);
    }

    /// Verify only the first matching rule replays a message
    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let h = harness();
        h.dead_letter(&EntityRef::queue("orders"), "MessageLockLost");
        let first = lock_rule(100);
        let mut second = lock_rule(100);
        second.id = crate::RuleId::new();
        second.name = "lock-lost-copy".to_string();
        h.add_rule(&first).await;
        h.add_rule(&second).await;

        let report = h.orchestrator.run_cycle(&namespace()).await.unwrap();

        assert_eq!(report.replayed, 1);
        assert_eq!(h.broker.replay_calls(), 1);
        let first_stored = h.store.get_rule(&first.id).await.unwrap().unwrap();
        let second_stored = h.store.get_rule(&second.id).await.unwrap().unwrap();
        assert_eq!(first_stored.match_count, 1);
        assert_eq!(second_stored.match_count, 0);
    }

    /// Verify rules without auto replay are only counted as skipped
    #[tokio::test]
    async fn test_manual_only_rule_is_skipped() {
        let h = harness();
        h.dead_letter(&EntityRef::queue("orders"), "PoisonMessage");
        let mut rule = poison_rule();
        rule.action.auto_replay = false;
        h.add_rule(&rule).await;

        let report = h.orchestrator.run_cycle(&namespace()).await.unwrap();

        assert_eq!(report.matched, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(h.broker.replay_calls(), 0);
    }

    /// Verify a failing replay does not block other messages
    #[tokio::test]
    async fn test_failures_are_isolated() {
        let h = harness();
        let orders = EntityRef::queue("orders");
        let payments = EntityRef::queue("payments");
        h.dead_letter(&orders, "MessageLockLost");
        h.dead_letter(&payments, "MessageLockLost");
        h.broker.fail_replays(NS, &orders, u32::MAX).unwrap();
        h.add_rule(&lock_rule(100)).await;

        let report = h.orchestrator.run_cycle(&namespace()).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.replayed, 1);
        let rows = h
            .store
            .list_messages(&MessageFilter::default())
            .await
            .unwrap();
        let payments_row = rows.iter().find(|m| m.entity_name == "payments").unwrap();
        assert_eq!(payments_row.status, MessageStatus::Replayed);
    }
}

mod polling_tests {
    use super::*;

    /// Verify results come back in namespace order, failures included
    #[tokio::test]
    async fn test_run_all_preserves_order() {
        let h = harness();
        h.dead_letter(&EntityRef::queue("orders"), "MessageLockLost");
        let missing = NamespaceId::new("ns-missing").unwrap();

        let results = h
            .orchestrator
            .run_all(&[missing.clone(), namespace()])
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, missing);
        assert!(results[0].1.is_err());
        assert_eq!(results[1].0, namespace());
        assert_eq!(results[1].1.as_ref().unwrap().detected, 1);
    }

    /// Verify a cancelled cycle still scans but starts no remediation
    #[tokio::test]
    async fn test_cancelled_cycle_starts_no_remediation() {
        let h = harness();
        h.dead_letter(&EntityRef::queue("orders"), "MessageLockLost");
        h.add_rule(&lock_rule(10)).await;

        h.orchestrator.executor.cancel();
        let report = h.orchestrator.run_cycle(&namespace()).await.unwrap();

        assert_eq!(report.detected, 1);
        assert_eq!(report.matched, 0);
        assert_eq!(report.replayed, 0);
        assert_eq!(h.broker.replay_calls(), 0);
    }

    /// Verify the polling loop stops on cancellation
    #[tokio::test(start_paused = true)]
    async fn test_run_forever_stops_on_shutdown() {
        let h = harness();
        h.dead_letter(&EntityRef::queue("orders"), "MessageLockLost");
        let shutdown = CancellationToken::new();

        let orchestrator = h.orchestrator.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            orchestrator
                .run_forever(vec![namespace()], Duration::from_secs(60), token)
                .await;
        });

        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // Three cycles ran: at t=0, t=60 and t=120
        assert_eq!(h.broker.peek_calls(), 3);
        assert!(h.orchestrator.executor.scheduler().is_shutting_down());
    }
}

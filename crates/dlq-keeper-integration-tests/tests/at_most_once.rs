//! Concurrent replay paths never replay a message twice

mod common;

use common::{namespace, reason_rule, Engine};
use dlq_broker::EntityRef;
use dlq_keeper_core::{OutcomeStatus, ReplayOutcome, ReplayStrategy};
use std::collections::HashMap;
use std::time::Duration;

/// Verify overlapping cycles, bulk and manual replays call the broker once per message
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_paths_replay_once() -> anyhow::Result<()> {
    let engine = Engine::new();
    let orders = EntityRef::queue("orders");
    for i in 0..6 {
        engine.dead_letter(&orders, &format!("m{i}"), "MessageLockLost");
    }
    let rule = engine
        .keeper
        .service()
        .create_rule(reason_rule("lock-lost", "Lock"))
        .await?;
    engine.keeper.monitor().scan_namespace(&namespace()).await?;
    let ids: Vec<_> = engine.messages().await.iter().map(|m| m.id).collect();
    engine
        .broker
        .set_replay_latency(Some(Duration::from_millis(20)));

    let orchestrator = engine.keeper.orchestrator().clone();
    let first = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run_cycle(&namespace()).await }
    });
    let second = tokio::spawn(async move { orchestrator.run_cycle(&namespace()).await });
    let service = engine.keeper.service().clone();
    let bulk = tokio::spawn({
        let service = service.clone();
        async move { service.replay_all(&rule.id).await }
    });
    let manual = tokio::spawn(async move {
        let mut replayed = 0;
        for id in ids {
            if let Ok(ReplayOutcome::Replayed { .. }) = service.replay_message(&id, "operator").await {
                replayed += 1;
            }
        }
        replayed
    });

    let first = first.await??;
    let second = second.await??;
    let bulk = bulk.await??;
    let manual = manual.await?;

    assert_eq!(engine.broker.replay_calls(), 6);
    assert_eq!(first.replayed + second.replayed + bulk.replayed + manual, 6);
    assert_eq!(engine.broker.dead_letter_count(common::NS, &orders)?, 0);
    assert_eq!(engine.broker.active_messages(common::NS, &orders)?.len(), 6);

    let mut successes: HashMap<_, usize> = HashMap::new();
    for row in engine.history().await {
        assert_ne!(row.replay_strategy, ReplayStrategy::CircuitBreaker);
        if row.outcome_status == OutcomeStatus::Success {
            *successes.entry(row.dlq_message_id).or_default() += 1;
        }
    }
    assert_eq!(successes.len(), 6);
    assert!(successes.values().all(|count| *count == 1));
    Ok(())
}

/// Verify a replayed message is not replayed again by a later cycle
#[tokio::test]
async fn test_replayed_message_stays_replayed() -> anyhow::Result<()> {
    let engine = Engine::new();
    let orders = EntityRef::queue("orders");
    engine.dead_letter(&orders, "m0", "MessageLockLost");
    let message_rule = engine
        .keeper
        .service()
        .create_rule(reason_rule("lock-lost", "Lock"))
        .await?;

    let first = engine.keeper.orchestrator().run_cycle(&namespace()).await?;
    let second = engine.keeper.orchestrator().run_cycle(&namespace()).await?;

    assert_eq!(first.replayed, 1);
    assert_eq!(second.matched, 0);
    assert_eq!(engine.broker.replay_calls(), 1);

    let message = engine.messages().await.remove(0);
    let again = engine.keeper.service().replay_message(&message.id, "operator").await;
    assert!(again.is_err());
    let bulk = engine.keeper.service().replay_all(&message_rule.id).await?;
    assert_eq!(bulk.total_matched, 0);
    assert_eq!(engine.broker.replay_calls(), 1);
    Ok(())
}

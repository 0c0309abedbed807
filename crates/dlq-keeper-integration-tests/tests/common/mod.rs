//! Common test utilities for DLQ Keeper integration tests
//!
//! This module provides:
//! - An engine fixture over the in-memory broker and store
//! - Helpers for seeding dead letters and building rules

use dlq_broker::{EntityRef, InMemoryBroker, OutgoingMessage};
use dlq_keeper_core::store::{HistoryFilter, HistoryStore, MessageFilter, MessageStore, Pagination};
use dlq_keeper_core::{
    ConditionField, ConditionOperator, DlqKeeper, DlqKeeperConfig, DlqMessage, InMemoryDlqStore,
    NamespaceId, ReplayHistory, RuleCondition, RuleDefinition,
};
use std::sync::Arc;

pub const NS: &str = "ns-integration";

pub fn namespace() -> NamespaceId {
    NamespaceId::new(NS).unwrap()
}

/// Configuration with fast retries
pub fn test_config() -> DlqKeeperConfig {
    let mut config = DlqKeeperConfig::default();
    config.executor.retry_base_delay_ms = 1;
    config.executor.retry_max_delay_ms = 5;
    config.executor.broker_timeout_seconds = 5;
    config.orchestrator.namespaces = vec![namespace()];
    config
}

/// A wired engine with handles on its broker and store
#[allow(dead_code)]
pub struct Engine {
    pub broker: Arc<InMemoryBroker>,
    pub store: Arc<InMemoryDlqStore>,
    pub keeper: DlqKeeper,
}

#[allow(dead_code)]
impl Engine {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: DlqKeeperConfig) -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_namespace(NS).unwrap();
        let store = Arc::new(InMemoryDlqStore::new());
        let keeper = DlqKeeper::new(&config, broker.clone(), store.clone()).unwrap();
        Self {
            broker,
            store,
            keeper,
        }
    }

    /// Dead-letter a message on `entity`, creating the entity if needed
    pub fn dead_letter(&self, entity: &EntityRef, body: &str, reason: &str) -> i64 {
        self.broker.create_entity(NS, entity).unwrap();
        self.broker
            .seed_dead_letter(NS, entity, OutgoingMessage::new(body.to_string()), Some(reason), None, 2)
            .unwrap()
    }

    pub async fn messages(&self) -> Vec<DlqMessage> {
        self.store.list_messages(&MessageFilter::default()).await.unwrap()
    }

    pub async fn history(&self) -> Vec<ReplayHistory> {
        self.store
            .query_history(&HistoryFilter::default(), Pagination::new(0, Pagination::MAX_LIMIT))
            .await
            .unwrap()
            .items
    }
}

/// A rule replaying messages whose dead-letter reason contains `needle`
#[allow(dead_code)]
pub fn reason_rule(name: &str, needle: &str) -> RuleDefinition {
    let mut definition = RuleDefinition::new(
        name,
        vec![RuleCondition::new(
            ConditionField::DeadLetterReason,
            ConditionOperator::Contains,
            needle,
        )],
    );
    definition.action.max_retries = 1;
    definition
}

//! Wiring of all engine components.

use crate::circuit_breaker::RuleCircuitBreaker;
use crate::config::{ConfigError, DlqKeeperConfig};
use crate::executor::ReplayExecutor;
use crate::monitor::DlqMonitor;
use crate::orchestrator::Orchestrator;
use crate::rate_limit::RateLimiter;
use crate::service::DlqService;
use crate::store::DlqStore;
use dlq_broker::MessageBroker;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A fully wired engine over one broker and one store
///
/// All components share the same rate limiter and claim set, so manual,
/// bulk and automatic replays observe each other's limits.
#[derive(Clone)]
pub struct DlqKeeper {
    monitor: DlqMonitor,
    executor: ReplayExecutor,
    orchestrator: Orchestrator,
    service: DlqService,
}

impl DlqKeeper {
    /// Build every component from a validated configuration
    pub fn new(
        config: &DlqKeeperConfig,
        broker: Arc<dyn MessageBroker>,
        store: Arc<dyn DlqStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let monitor = DlqMonitor::new(broker.clone(), store.clone(), config.monitor.clone());
        let executor = ReplayExecutor::new(
            broker,
            store.clone(),
            Arc::new(RateLimiter::from_config(&config.rate_limit)),
            RuleCircuitBreaker::new(config.circuit_breaker.clone()),
            config.executor.clone(),
        );
        let orchestrator = Orchestrator::new(
            monitor.clone(),
            executor.clone(),
            store.clone(),
            config.orchestrator.clone(),
        );
        let service = DlqService::new(store, executor.clone());

        Ok(Self {
            monitor,
            executor,
            orchestrator,
            service,
        })
    }

    pub fn monitor(&self) -> &DlqMonitor {
        &self.monitor
    }

    pub fn executor(&self) -> &ReplayExecutor {
        &self.executor
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn service(&self) -> &DlqService {
        &self.service
    }

    /// Poll the configured namespaces until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        let config = self.orchestrator.config();
        self.orchestrator
            .run_forever(config.namespaces.clone(), config.scan_interval(), shutdown)
            .await;
    }
}

#[cfg(test)]
#[path = "keeper_tests.rs"]
mod tests;

//! DLQ scanning and detection.
//!
//! A scan walks every queue and subscription of a namespace, peeks a bounded
//! batch from each dead-letter sub-queue and records every message not seen
//! before. Peeking never locks or removes messages.
//!
//! Detection is idempotent: a message is identified by its namespace, entity
//! and sequence number, and rows that already exist are left untouched, so
//! the failure classification is frozen at first detection.

use crate::classifier::FailureClassifier;
use crate::dlq_message::DlqMessage;
use crate::store::{DlqStore, StoreError};
use crate::{NamespaceId, Timestamp};
use dlq_broker::{BrokerError, BrokerMessage, EntityRef, MessageBroker};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Monitor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Maximum messages peeked from one dead-letter sub-queue per scan
    pub peek_batch_size: u32,

    /// Bytes of the body kept as a preview
    pub body_preview_bytes: usize,

    /// Timeout applied to each broker call made by a scan
    pub peek_timeout_seconds: u64,

    /// Delivery count at which the broker dead-letters a message
    pub max_delivery_count_hint: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            peek_batch_size: 100,
            body_preview_bytes: 512,
            peek_timeout_seconds: 30,
            max_delivery_count_hint: 10,
        }
    }
}

impl MonitorConfig {
    pub fn peek_timeout(&self) -> Duration {
        Duration::from_secs(self.peek_timeout_seconds)
    }
}

/// Summary of one namespace scan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub namespace_id: Option<NamespaceId>,
    pub entities_scanned: usize,
    /// Entities whose peek failed; their messages were not examined
    pub entities_failed: usize,
    pub messages_peeked: usize,
    /// Rows persisted by this scan
    pub newly_detected: usize,
    pub already_known: usize,
    /// Rows marked as no longer present in their DLQ
    pub resolved: u64,
}

/// Errors that abort a namespace scan
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Broker unavailable while scanning namespace {namespace}: {source}")]
    BrokerUnavailable {
        namespace: String,
        #[source]
        source: BrokerError,
    },

    #[error("Scanning namespace {namespace} timed out after {duration:?}")]
    Timeout { namespace: String, duration: Duration },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl MonitorError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::BrokerUnavailable { source, .. } => source.is_transient(),
            Self::Timeout { .. } => true,
            Self::Store(e) => e.is_transient(),
        }
    }
}

/// Scans dead-letter sub-queues and persists newly detected messages
#[derive(Clone)]
pub struct DlqMonitor {
    broker: Arc<dyn MessageBroker>,
    store: Arc<dyn DlqStore>,
    classifier: FailureClassifier,
    config: MonitorConfig,
}

impl DlqMonitor {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        store: Arc<dyn DlqStore>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            broker,
            store,
            classifier: FailureClassifier::new(config.max_delivery_count_hint),
            config,
        }
    }

    /// Scan every entity of a namespace
    ///
    /// Fails only when the entity listing fails. A failure peeking one
    /// entity is logged and the remaining entities are still scanned.
    pub async fn scan_namespace(
        &self,
        namespace_id: &NamespaceId,
    ) -> Result<ScanReport, MonitorError> {
        let started = Instant::now();
        let timeout = self.config.peek_timeout();

        let entities = match tokio::time::timeout(
            timeout,
            self.broker.list_entities(namespace_id.as_str()),
        )
        .await
        {
            Ok(Ok(entities)) => entities,
            Ok(Err(BrokerError::Timeout { duration })) => {
                return Err(MonitorError::Timeout {
                    namespace: namespace_id.to_string(),
                    duration,
                })
            }
            Ok(Err(source)) => {
                return Err(MonitorError::BrokerUnavailable {
                    namespace: namespace_id.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(MonitorError::Timeout {
                    namespace: namespace_id.to_string(),
                    duration: timeout,
                })
            }
        };

        let mut report = ScanReport {
            namespace_id: Some(namespace_id.clone()),
            ..Default::default()
        };

        for entity in &entities {
            let peeked = match self.peek_dead_letters(namespace_id, entity).await {
                Ok(peeked) => peeked,
                Err(e) => {
                    warn!(
                        namespace = %namespace_id,
                        entity = %entity,
                        error = %e,
                        "Failed to peek dead-letter queue, skipping entity"
                    );
                    report.entities_failed += 1;
                    continue;
                }
            };

            report.entities_scanned += 1;
            report.messages_peeked += peeked.len();
            self.record_entity(namespace_id, entity, &peeked, &mut report)
                .await?;
        }

        info!(
            namespace = %namespace_id,
            entities = report.entities_scanned,
            failed_entities = report.entities_failed,
            peeked = report.messages_peeked,
            new = report.newly_detected,
            resolved = report.resolved,
            duration_ms = started.elapsed().as_millis() as u64,
            "Namespace scan complete"
        );

        Ok(report)
    }

    async fn peek_dead_letters(
        &self,
        namespace_id: &NamespaceId,
        entity: &EntityRef,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        let timeout = self.config.peek_timeout();
        match tokio::time::timeout(
            timeout,
            self.broker.peek(
                namespace_id.as_str(),
                entity,
                true,
                self.config.peek_batch_size,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout { duration: timeout }),
        }
    }

    async fn record_entity(
        &self,
        namespace_id: &NamespaceId,
        entity: &EntityRef,
        peeked: &[BrokerMessage],
        report: &mut ScanReport,
    ) -> Result<(), MonitorError> {
        let entity_name = entity.path();
        let mut observed = HashSet::with_capacity(peeked.len());

        for message in peeked {
            observed.insert(message.sequence_number);

            if self
                .store
                .find_by_key(namespace_id, &entity_name, message.sequence_number)
                .await?
                .is_some()
            {
                report.already_known += 1;
                continue;
            }

            let classification = self.classifier.classify(
                message.dead_letter_reason.as_deref(),
                message.dead_letter_error_description.as_deref(),
                message.delivery_count,
            );
            let row = DlqMessage::from_broker(
                namespace_id.clone(),
                entity,
                message,
                classification,
                self.config.body_preview_bytes,
            );

            if self.store.insert_if_absent(row).await? {
                debug!(
                    namespace = %namespace_id,
                    entity = %entity_name,
                    sequence_number = message.sequence_number,
                    category = %classification.category,
                    confidence = classification.confidence,
                    "Detected dead-lettered message"
                );
                report.newly_detected += 1;
            } else {
                report.already_known += 1;
            }
        }

        // Only a batch smaller than the limit is a complete view of the DLQ
        if peeked.len() < self.config.peek_batch_size as usize {
            report.resolved += self
                .store
                .resolve_missing(namespace_id, &entity_name, &observed, Timestamp::now())
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;

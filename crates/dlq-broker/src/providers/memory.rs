//! In-memory broker provider for testing and offline simulation.
//!
//! This module provides a fully functional in-memory broker that:
//! - Keeps an active queue and a dead-letter sub-queue per entity
//! - Assigns monotonically increasing sequence numbers per entity
//! - Replays dead-lettered messages into a target entity
//! - Supports fault injection for peek, listing and replay operations
//!
//! This provider is intended for:
//! - Unit and integration testing of the DLQ Keeper engine
//! - The CLI simulator, seeded from a JSON [`BrokerSnapshot`]

use crate::broker::MessageBroker;
use crate::error::BrokerError;
use crate::message::{BrokerMessage, EntityRef, OutgoingMessage};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::debug;

const PROVIDER: &str = "in-memory";

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Default)]
struct BrokerState {
    namespaces: HashMap<String, NamespaceState>,
    faults: FaultPlan,
}

#[derive(Default)]
struct NamespaceState {
    /// Entities keyed by canonical path
    entities: BTreeMap<String, EntityState>,
}

struct EntityState {
    entity: EntityRef,
    active: VecDeque<BrokerMessage>,
    dead_letter: BTreeMap<i64, BrokerMessage>,
    next_sequence: i64,
}

impl EntityState {
    fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            active: VecDeque::new(),
            dead_letter: BTreeMap::new(),
            next_sequence: 1,
        }
    }

    fn allocate_sequence(&mut self) -> i64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}

/// Injected failures, keyed by `(namespace, entity path)`
#[derive(Default)]
struct FaultPlan {
    listing: HashSet<String>,
    peeks: HashSet<(String, String)>,
    /// Remaining transient replay failures; `u32::MAX` never runs out
    replays: HashMap<(String, String), u32>,
}

// ============================================================================
// Snapshot Types
// ============================================================================

/// Serializable description of broker contents used to seed the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub namespaces: Vec<NamespaceSnapshot>,
}

/// Namespace contents within a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceSnapshot {
    pub id: String,
    #[serde(default)]
    pub entities: Vec<EntitySnapshot>,
}

/// Entity contents within a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub name: String,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub dead_letters: Vec<SnapshotMessage>,
}

/// Dead-lettered message within a snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotMessage {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub dead_letter_reason: Option<String>,
    #[serde(default)]
    pub dead_letter_error_description: Option<String>,
    #[serde(default = "default_delivery_count")]
    pub delivery_count: u32,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub application_properties: HashMap<String, String>,
}

fn default_delivery_count() -> u32 {
    1
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory broker provider implementation
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<RwLock<BrokerState>>,
    replay_calls: Arc<AtomicU64>,
    peek_calls: Arc<AtomicU64>,
    replay_latency: Arc<RwLock<Option<Duration>>>,
}

impl InMemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a broker seeded from a snapshot
    ///
    /// Every snapshot message lands directly in its entity's dead-letter sub-queue.
    pub fn from_snapshot(snapshot: &BrokerSnapshot) -> Result<Self, BrokerError> {
        let broker = Self::new();
        for namespace in &snapshot.namespaces {
            broker.create_namespace(&namespace.id)?;
            for entity in &namespace.entities {
                let entity_ref = EntityRef {
                    name: entity.name.clone(),
                    subscription: entity.subscription.clone(),
                };
                broker.create_entity(&namespace.id, &entity_ref)?;
                for message in &entity.dead_letters {
                    let mut outgoing = OutgoingMessage::new(Bytes::from(message.body.clone()));
                    outgoing.message_id = message.message_id.clone();
                    outgoing.content_type = message.content_type.clone();
                    outgoing.correlation_id = message.correlation_id.clone();
                    outgoing.session_id = message.session_id.clone();
                    outgoing.application_properties = message.application_properties.clone();
                    broker.seed_dead_letter(
                        &namespace.id,
                        &entity_ref,
                        outgoing,
                        message.dead_letter_reason.as_deref(),
                        message.dead_letter_error_description.as_deref(),
                        message.delivery_count,
                    )?;
                }
            }
        }
        Ok(broker)
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, BrokerState>, BrokerError> {
        self.state.read().map_err(|_| lock_poisoned())
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, BrokerState>, BrokerError> {
        self.state.write().map_err(|_| lock_poisoned())
    }

    /// Register a namespace (idempotent)
    pub fn create_namespace(&self, namespace: &str) -> Result<(), BrokerError> {
        let mut state = self.write_state()?;
        state.namespaces.entry(namespace.to_string()).or_default();
        Ok(())
    }

    /// Register a queue or subscription, creating the namespace if needed (idempotent)
    pub fn create_entity(&self, namespace: &str, entity: &EntityRef) -> Result<(), BrokerError> {
        let mut state = self.write_state()?;
        state
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .entities
            .entry(entity.path())
            .or_insert_with(|| EntityState::new(entity.clone()));
        Ok(())
    }

    /// Place a message directly into an entity's dead-letter sub-queue
    ///
    /// Returns the assigned sequence number.
    pub fn seed_dead_letter(
        &self,
        namespace: &str,
        entity: &EntityRef,
        message: OutgoingMessage,
        reason: Option<&str>,
        description: Option<&str>,
        delivery_count: u32,
    ) -> Result<i64, BrokerError> {
        let mut state = self.write_state()?;
        let entity_state = entity_mut(&mut state, namespace, entity)?;
        let sequence_number = entity_state.allocate_sequence();
        let now = Utc::now();
        let mut stored = to_broker_message(message, sequence_number);
        stored.enqueued_time_utc = now - ChronoDuration::minutes(5);
        stored.dead_letter_time_utc = Some(now);
        stored.dead_letter_reason = reason.map(str::to_string);
        stored.dead_letter_error_description = description.map(str::to_string);
        stored.delivery_count = delivery_count;
        entity_state.dead_letter.insert(sequence_number, stored);
        Ok(sequence_number)
    }

    /// Make `list_entities` fail for a namespace
    pub fn fail_listing(&self, namespace: &str) -> Result<(), BrokerError> {
        self.write_state()?.faults.listing.insert(namespace.to_string());
        Ok(())
    }

    /// Make peeks on one entity fail until cleared
    pub fn fail_peeks(&self, namespace: &str, entity: &EntityRef) -> Result<(), BrokerError> {
        self.write_state()?
            .faults
            .peeks
            .insert((namespace.to_string(), entity.path()));
        Ok(())
    }

    /// Make the next `count` replays from an entity fail with a transient error
    ///
    /// `u32::MAX` makes every replay fail.
    pub fn fail_replays(
        &self,
        namespace: &str,
        entity: &EntityRef,
        count: u32,
    ) -> Result<(), BrokerError> {
        self.write_state()?
            .faults
            .replays
            .insert((namespace.to_string(), entity.path()), count);
        Ok(())
    }

    /// Remove all injected failures
    pub fn clear_faults(&self) -> Result<(), BrokerError> {
        self.write_state()?.faults = FaultPlan::default();
        Ok(())
    }

    /// Add artificial latency to every replay call
    pub fn set_replay_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.replay_latency.write() {
            *guard = latency;
        }
    }

    /// Number of replay calls received, including failed ones
    pub fn replay_calls(&self) -> u64 {
        self.replay_calls.load(Ordering::SeqCst)
    }

    /// Number of peek calls received, including failed ones
    pub fn peek_calls(&self) -> u64 {
        self.peek_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of an entity's active queue
    pub fn active_messages(
        &self,
        namespace: &str,
        entity: &EntityRef,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        let state = self.read_state()?;
        let entity_state = entity_ref(&state, namespace, entity)?;
        Ok(entity_state.active.iter().cloned().collect())
    }

    /// Number of messages in an entity's dead-letter sub-queue
    pub fn dead_letter_count(&self, namespace: &str, entity: &EntityRef) -> Result<usize, BrokerError> {
        let state = self.read_state()?;
        Ok(entity_ref(&state, namespace, entity)?.dead_letter.len())
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn list_entities(&self, namespace: &str) -> Result<Vec<EntityRef>, BrokerError> {
        let state = self.read_state()?;
        if state.faults.listing.contains(namespace) {
            return Err(BrokerError::Unavailable {
                message: format!("injected listing failure for {}", namespace),
            });
        }
        let ns = state
            .namespaces
            .get(namespace)
            .ok_or_else(|| BrokerError::NamespaceNotFound {
                namespace: namespace.to_string(),
            })?;
        Ok(ns.entities.values().map(|e| e.entity.clone()).collect())
    }

    async fn peek(
        &self,
        namespace: &str,
        entity: &EntityRef,
        from_dead_letter: bool,
        max_count: u32,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        self.peek_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.read_state()?;
        if state
            .faults
            .peeks
            .contains(&(namespace.to_string(), entity.path()))
        {
            return Err(BrokerError::Unavailable {
                message: format!("injected peek failure for {}", entity),
            });
        }

        let entity_state = entity_ref(&state, namespace, entity)?;
        let limit = max_count as usize;
        let messages = if from_dead_letter {
            entity_state.dead_letter.values().take(limit).cloned().collect()
        } else {
            entity_state.active.iter().take(limit).cloned().collect()
        };
        Ok(messages)
    }

    async fn replay(
        &self,
        namespace: &str,
        entity: &EntityRef,
        sequence_number: i64,
        target: &EntityRef,
    ) -> Result<(), BrokerError> {
        self.replay_calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.replay_latency.read().ok().and_then(|guard| *guard);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.write_state()?;

        let fault_key = (namespace.to_string(), entity.path());
        if let Some(remaining) = state.faults.replays.get_mut(&fault_key) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(BrokerError::Unavailable {
                    message: format!("injected replay failure for {}", entity),
                });
            }
        }

        // Validate the target before removing anything from the source
        entity_mut(&mut state, namespace, target)?;

        let source = entity_mut(&mut state, namespace, entity)?;
        let mut message = source.dead_letter.remove(&sequence_number).ok_or_else(|| {
            BrokerError::MessageNotFound {
                entity: entity.path(),
                sequence_number,
            }
        })?;

        let destination = entity_mut(&mut state, namespace, target)?;
        message.sequence_number = destination.allocate_sequence();
        message.enqueued_time_utc = Utc::now();
        message.delivery_count = 0;
        message.dead_letter_time_utc = None;
        message.dead_letter_reason = None;
        message.dead_letter_error_description = None;
        destination.active.push_back(message);

        debug!(
            namespace = namespace,
            source = %entity,
            target = %target,
            sequence_number,
            "Replayed dead-lettered message"
        );
        Ok(())
    }

    async fn purge(
        &self,
        namespace: &str,
        entity: &EntityRef,
        from_dead_letter: bool,
    ) -> Result<u64, BrokerError> {
        let mut state = self.write_state()?;
        let entity_state = entity_mut(&mut state, namespace, entity)?;
        let removed = if from_dead_letter {
            let count = entity_state.dead_letter.len();
            entity_state.dead_letter.clear();
            count
        } else {
            let count = entity_state.active.len();
            entity_state.active.clear();
            count
        };
        Ok(removed as u64)
    }

    async fn send(
        &self,
        namespace: &str,
        entity: &EntityRef,
        message: OutgoingMessage,
    ) -> Result<i64, BrokerError> {
        let mut state = self.write_state()?;
        let entity_state = entity_mut(&mut state, namespace, entity)?;
        let sequence_number = entity_state.allocate_sequence();
        entity_state
            .active
            .push_back(to_broker_message(message, sequence_number));
        Ok(sequence_number)
    }

    async fn dead_letter(
        &self,
        namespace: &str,
        entity: &EntityRef,
        sequence_number: i64,
        reason: &str,
        description: Option<&str>,
    ) -> Result<(), BrokerError> {
        let mut state = self.write_state()?;
        let entity_state = entity_mut(&mut state, namespace, entity)?;
        let position = entity_state
            .active
            .iter()
            .position(|m| m.sequence_number == sequence_number)
            .ok_or_else(|| BrokerError::MessageNotFound {
                entity: entity.path(),
                sequence_number,
            })?;

        if let Some(mut message) = entity_state.active.remove(position) {
            message.delivery_count += 1;
            message.dead_letter_time_utc = Some(Utc::now());
            message.dead_letter_reason = Some(reason.to_string());
            message.dead_letter_error_description = description.map(str::to_string);
            entity_state.dead_letter.insert(sequence_number, message);
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn lock_poisoned() -> BrokerError {
    BrokerError::ProviderError {
        provider: PROVIDER.to_string(),
        code: "lock_poisoned".to_string(),
        message: "broker state lock poisoned".to_string(),
    }
}

fn entity_ref<'a>(
    state: &'a BrokerState,
    namespace: &str,
    entity: &EntityRef,
) -> Result<&'a EntityState, BrokerError> {
    state
        .namespaces
        .get(namespace)
        .ok_or_else(|| BrokerError::NamespaceNotFound {
            namespace: namespace.to_string(),
        })?
        .entities
        .get(&entity.path())
        .ok_or_else(|| BrokerError::EntityNotFound {
            entity: entity.path(),
        })
}

fn entity_mut<'a>(
    state: &'a mut BrokerState,
    namespace: &str,
    entity: &EntityRef,
) -> Result<&'a mut EntityState, BrokerError> {
    state
        .namespaces
        .get_mut(namespace)
        .ok_or_else(|| BrokerError::NamespaceNotFound {
            namespace: namespace.to_string(),
        })?
        .entities
        .get_mut(&entity.path())
        .ok_or_else(|| BrokerError::EntityNotFound {
            entity: entity.path(),
        })
}

fn to_broker_message(message: OutgoingMessage, sequence_number: i64) -> BrokerMessage {
    BrokerMessage {
        message_id: message
            .message_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        sequence_number,
        body: message.body,
        enqueued_time_utc: Utc::now(),
        dead_letter_time_utc: None,
        dead_letter_reason: None,
        dead_letter_error_description: None,
        delivery_count: 0,
        content_type: message.content_type,
        correlation_id: message.correlation_id,
        session_id: message.session_id,
        application_properties: message.application_properties,
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

//! Broker trait consumed by the DLQ Keeper engine.

use crate::error::BrokerError;
use crate::message::{BrokerMessage, EntityRef, OutgoingMessage};
use async_trait::async_trait;

/// Interface implemented by specific broker providers
///
/// All operations are scoped to a namespace. Namespaces are registered
/// outside of this crate and referenced by their opaque identifier.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// List all queues and subscriptions in a namespace
    async fn list_entities(&self, namespace: &str) -> Result<Vec<EntityRef>, BrokerError>;

    /// Peek messages without locking or removing them
    ///
    /// # Arguments
    ///
    /// - `entity`: Queue or subscription to read
    /// - `from_dead_letter`: Read the dead-letter sub-queue instead of the main queue
    /// - `max_count`: Upper bound on returned messages
    ///
    /// Messages are returned in ascending sequence number order.
    async fn peek(
        &self,
        namespace: &str,
        entity: &EntityRef,
        from_dead_letter: bool,
        max_count: u32,
    ) -> Result<Vec<BrokerMessage>, BrokerError>;

    /// Resubmit a dead-lettered message and remove it from the dead-letter sub-queue
    ///
    /// # Arguments
    ///
    /// - `entity`: Entity whose dead-letter sub-queue holds the message
    /// - `sequence_number`: Broker sequence number of the dead-lettered message
    /// - `target`: Entity that receives the resubmitted message
    async fn replay(
        &self,
        namespace: &str,
        entity: &EntityRef,
        sequence_number: i64,
        target: &EntityRef,
    ) -> Result<(), BrokerError>;

    /// Remove all messages from an entity or its dead-letter sub-queue
    ///
    /// Returns the number of messages removed.
    async fn purge(
        &self,
        namespace: &str,
        entity: &EntityRef,
        from_dead_letter: bool,
    ) -> Result<u64, BrokerError>;

    /// Send a message to an entity, returning its sequence number
    async fn send(
        &self,
        namespace: &str,
        entity: &EntityRef,
        message: OutgoingMessage,
    ) -> Result<i64, BrokerError>;

    /// Move an active message to the entity's dead-letter sub-queue
    async fn dead_letter(
        &self,
        namespace: &str,
        entity: &EntityRef,
        sequence_number: i64,
        reason: &str,
        description: Option<&str>,
    ) -> Result<(), BrokerError>;

    /// Provider name for logs and error context
    fn provider_name(&self) -> &'static str;
}

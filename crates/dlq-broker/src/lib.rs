//! # DLQ Broker
//!
//! Provider-agnostic access to a message broker's dead-letter sub-queues.
//!
//! This library provides:
//! - The [`MessageBroker`] trait consumed by the DLQ Keeper engine
//! - Entity and message types shared by all providers
//! - Error types with transient/permanent classification
//! - An in-memory reference provider for tests and offline simulation
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all broker operations
//! - [`message`] - Entity references and peeked message snapshots
//! - [`broker`] - The broker trait
//! - [`providers`] - Provider implementations

pub mod broker;
pub mod error;
pub mod message;
pub mod providers;

// Re-export commonly used types at crate root for convenience
pub use broker::MessageBroker;
pub use error::BrokerError;
pub use message::{BrokerMessage, EntityRef, EntityType, OutgoingMessage};
pub use providers::{
    BrokerSnapshot, EntitySnapshot, InMemoryBroker, NamespaceSnapshot, SnapshotMessage,
};

//! Broker provider implementations.

pub mod memory;

pub use memory::{
    BrokerSnapshot, EntitySnapshot, InMemoryBroker, NamespaceSnapshot, SnapshotMessage,
};

//! # ferrobus-memory
//!
//! In-memory reference adapters for every ferrobus port: a process-wide
//! named network with peek-lock queues, delivery counts and
//! dead-lettering; a saga store with optimistic concurrency; a
//! subscription store; and a timeout store with lease semantics.
//!
//! Intended for deterministic tests and single-process deployments.

pub mod network;
pub mod saga_store;
pub mod subscription_store;
pub mod timeout_store;
pub mod transport;

pub use network::{InMemNetwork, Lease, DEAD_LETTER_QUEUE, DEFAULT_LEASE, DEFAULT_MAX_DELIVERIES};
pub use saga_store::InMemSagaStore;
pub use subscription_store::InMemSubscriptionStore;
pub use timeout_store::InMemTimeoutStore;
pub use transport::InMemTransport;

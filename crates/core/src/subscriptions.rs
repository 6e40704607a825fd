//! # Subscription Storage Port
//!
//! Topic → subscriber-queue mapping with set semantics. In centralized mode
//! the broker owns the topology and any node may register on behalf of any
//! subscriber; in decentralized mode the store is authoritative and only the
//! subscriber node itself registers.

use async_trait::async_trait;

use crate::error::Result;

/// Storage contract for topic subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync + 'static {
    /// All queue addresses subscribed to `topic`.
    async fn subscriber_addresses(&self, topic: &str) -> Result<Vec<String>>;

    /// Add `subscriber_address` to `topic`. Registering an existing pair is
    /// a no-op (set semantics).
    async fn register_subscriber(&self, topic: &str, subscriber_address: &str) -> Result<()>;

    /// Remove `subscriber_address` from `topic`. Unknown pairs are a no-op.
    async fn unregister_subscriber(&self, topic: &str, subscriber_address: &str) -> Result<()>;

    /// Whether the broker performs fan-out natively. When true, any node may
    /// register/unregister on behalf of any subscriber.
    fn is_centralized(&self) -> bool;
}

//! # In-Memory Subscription Store
//!
//! Decentralized topic → subscriber-queue mapping with set semantics. A
//! `centralized` flag is available for topologies where the same store
//! fronts a broker that owns fan-out.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use ferrobus_core::{Result, SubscriptionStore};

#[derive(Default)]
struct Inner {
    topics: HashMap<String, BTreeSet<String>>,
}

/// In-memory [`SubscriptionStore`] implementation.
#[derive(Default, Clone)]
pub struct InMemSubscriptionStore {
    inner: Arc<RwLock<Inner>>,
    centralized: bool,
}

impl InMemSubscriptionStore {
    /// A decentralized store: each subscriber registers itself.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store fronting broker-owned topology: any node may register on
    /// behalf of any subscriber.
    pub fn centralized() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            centralized: true,
        }
    }
}

#[async_trait]
impl SubscriptionStore for InMemSubscriptionStore {
    async fn subscriber_addresses(&self, topic: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .topics
            .get(topic)
            .map(|subscribers| subscribers.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn register_subscriber(&self, topic: &str, subscriber_address: &str) -> Result<()> {
        self.inner
            .write()
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(subscriber_address.to_string());
        Ok(())
    }

    async fn unregister_subscriber(&self, topic: &str, subscriber_address: &str) -> Result<()> {
        if let Some(subscribers) = self.inner.write().topics.get_mut(topic) {
            subscribers.remove(subscriber_address);
        }
        Ok(())
    }

    fn is_centralized(&self) -> bool {
        self.centralized
    }
}

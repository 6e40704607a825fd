//! # Router
//!
//! Maps a logical message type to its destination queue (point-to-point) or
//! to the list of subscriber queues (publish). Topic fan-out is resolved
//! through the subscription store, which may in turn delegate to the broker
//! when subscriptions are centralized.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{BusError, Result};
use crate::subscriptions::SubscriptionStore;

/// Destination resolution contract consumed by the outgoing pipeline.
#[async_trait]
pub trait Router: Send + Sync + 'static {
    /// The queue that owns `message_type` (point-to-point sends).
    async fn destination_for(&self, message_type: &str) -> Result<String>;

    /// All queues subscribed to `topic` (publish). An empty list is valid:
    /// publishing to nobody delivers nothing.
    async fn subscribers_for(&self, topic: &str) -> Result<Vec<String>>;
}

/// Explicit type-map router with an optional fallback address.
pub struct TypeBasedRouter {
    routes: HashMap<String, String>,
    fallback: Option<String>,
    subscriptions: Option<Arc<dyn SubscriptionStore>>,
}

impl TypeBasedRouter {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            fallback: None,
            subscriptions: None,
        }
    }

    /// Map `message_type` to `destination`.
    pub fn map(mut self, message_type: impl Into<String>, destination: impl Into<String>) -> Self {
        self.routes.insert(message_type.into(), destination.into());
        self
    }

    /// Destination for any type without an explicit mapping.
    pub fn with_fallback(mut self, destination: impl Into<String>) -> Self {
        self.fallback = Some(destination.into());
        self
    }

    /// Resolve publish fan-out through `store`.
    pub fn with_subscriptions(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.subscriptions = Some(store);
        self
    }
}

impl Default for TypeBasedRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Router for TypeBasedRouter {
    async fn destination_for(&self, message_type: &str) -> Result<String> {
        self.routes
            .get(message_type)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| {
                BusError::configuration(format!(
                    "no route registered for message type {message_type:?}"
                ))
            })
    }

    async fn subscribers_for(&self, topic: &str) -> Result<Vec<String>> {
        match &self.subscriptions {
            Some(store) => store.subscriber_addresses(topic).await,
            None => Err(BusError::configuration(
                "publish requires a subscription store",
            )),
        }
    }
}

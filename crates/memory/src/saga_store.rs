//! # In-Memory Saga Store
//!
//! Map keyed by saga id with a secondary correlation index
//! `(saga type, property, value) → id`, enforcing the optimistic
//! concurrency contract: correlation collisions fail inserts, revision
//! mismatches fail updates, and successful updates bump the revision.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use ferrobus_core::{BusError, CorrelationValue, Result, SagaInstance, SagaStore};

type IndexKey = (String, String, String);

#[derive(Default)]
struct Inner {
    instances: HashMap<Uuid, SagaInstance>,
    index: HashMap<IndexKey, Uuid>,
}

impl Inner {
    fn remove_index_entries(&mut self, id: Uuid) {
        self.index.retain(|_, indexed| *indexed != id);
    }

    fn add_index_entries(
        &mut self,
        instance: &SagaInstance,
        correlations: &[CorrelationValue],
    ) {
        for correlation in correlations {
            self.index.insert(
                (
                    instance.saga_type.clone(),
                    correlation.property.clone(),
                    correlation.value.clone(),
                ),
                instance.id,
            );
        }
    }

    fn check_collisions(
        &self,
        instance: &SagaInstance,
        correlations: &[CorrelationValue],
    ) -> Result<()> {
        for correlation in correlations {
            let key = (
                instance.saga_type.clone(),
                correlation.property.clone(),
                correlation.value.clone(),
            );
            if let Some(existing) = self.index.get(&key) {
                if *existing != instance.id {
                    return Err(BusError::ConcurrencyConflict {
                        saga_id: instance.id,
                        revision: instance.revision,
                    });
                }
            }
        }
        Ok(())
    }
}

/// In-memory [`SagaStore`] implementation.
#[derive(Default, Clone)]
pub struct InMemSagaStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemSagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted sagas.
    pub fn count(&self) -> usize {
        self.inner.read().instances.len()
    }

    /// Snapshot of a stored instance by id.
    pub fn get(&self, id: Uuid) -> Option<SagaInstance> {
        self.inner.read().instances.get(&id).cloned()
    }

    /// Snapshot of every stored instance of one saga type.
    pub fn all_of_type(&self, saga_type: &str) -> Vec<SagaInstance> {
        self.inner
            .read()
            .instances
            .values()
            .filter(|instance| instance.saga_type == saga_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SagaStore for InMemSagaStore {
    async fn find(
        &self,
        saga_type: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<SagaInstance>> {
        let inner = self.inner.read();
        let key = (
            saga_type.to_string(),
            property.to_string(),
            value.to_string(),
        );
        Ok(inner
            .index
            .get(&key)
            .and_then(|id| inner.instances.get(id))
            .cloned())
    }

    async fn insert(
        &self,
        instance: &SagaInstance,
        correlations: &[CorrelationValue],
    ) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.instances.contains_key(&instance.id) {
            return Err(BusError::ConcurrencyConflict {
                saga_id: instance.id,
                revision: instance.revision,
            });
        }
        inner.check_collisions(instance, correlations)?;
        inner.add_index_entries(instance, correlations);
        inner.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn update(
        &self,
        instance: &SagaInstance,
        correlations: &[CorrelationValue],
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let stored_revision = inner
            .instances
            .get(&instance.id)
            .map(|stored| stored.revision)
            .ok_or_else(|| {
                BusError::store(format!("saga {} does not exist", instance.id))
            })?;
        if stored_revision != instance.revision {
            return Err(BusError::ConcurrencyConflict {
                saga_id: instance.id,
                revision: instance.revision,
            });
        }
        inner.check_collisions(instance, correlations)?;

        let mut updated = instance.clone();
        updated.revision += 1;
        inner.remove_index_entries(instance.id);
        inner.add_index_entries(&updated, correlations);
        inner.instances.insert(updated.id, updated);
        Ok(())
    }

    async fn delete(&self, instance: &SagaInstance) -> Result<()> {
        let mut inner = self.inner.write();
        let stored_revision = inner
            .instances
            .get(&instance.id)
            .map(|stored| stored.revision)
            .ok_or_else(|| {
                BusError::store(format!("saga {} does not exist", instance.id))
            })?;
        if stored_revision != instance.revision {
            return Err(BusError::ConcurrencyConflict {
                saga_id: instance.id,
                revision: instance.revision,
            });
        }
        inner.remove_index_entries(instance.id);
        inner.instances.remove(&instance.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn correlations(value: &str) -> Vec<CorrelationValue> {
        vec![CorrelationValue {
            property: "order_id".into(),
            value: value.into(),
        }]
    }

    fn instance(value: &str) -> SagaInstance {
        SagaInstance::fresh("OrderSaga", json!({"order_id": value}), false)
    }

    #[tokio::test]
    async fn insert_then_find_by_correlation() {
        let store = InMemSagaStore::new();
        let saga = instance("o-1");
        store.insert(&saga, &correlations("o-1")).await.unwrap();

        let found = store
            .find("OrderSaga", "order_id", "o-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, saga.id);
        assert_eq!(found.revision, 0);

        assert!(store
            .find("OrderSaga", "order_id", "o-2")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find("OtherSaga", "order_id", "o-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn correlation_collision_on_insert_conflicts() {
        let store = InMemSagaStore::new();
        store
            .insert(&instance("o-1"), &correlations("o-1"))
            .await
            .unwrap();

        let duplicate = store.insert(&instance("o-1"), &correlations("o-1")).await;
        assert!(matches!(
            duplicate.unwrap_err(),
            BusError::ConcurrencyConflict { .. }
        ));
    }

    #[tokio::test]
    async fn update_bumps_revision_and_guards_lost_updates() {
        let store = InMemSagaStore::new();
        let saga = instance("o-1");
        store.insert(&saga, &correlations("o-1")).await.unwrap();

        // Two racers load revision 0.
        let first = store
            .find("OrderSaga", "order_id", "o-1")
            .await
            .unwrap()
            .unwrap();
        let second = first.clone();

        store.update(&first, &correlations("o-1")).await.unwrap();
        assert_eq!(store.get(saga.id).unwrap().revision, 1);

        let loser = store.update(&second, &correlations("o-1")).await;
        assert!(matches!(
            loser.unwrap_err(),
            BusError::ConcurrencyConflict { .. }
        ));
    }

    #[tokio::test]
    async fn concurrent_updates_yield_distinct_revisions() {
        let store = InMemSagaStore::new();
        let saga = instance("o-1");
        store.insert(&saga, &correlations("o-1")).await.unwrap();

        let mut successes = 0u64;
        for _ in 0..10 {
            let loaded = store
                .find("OrderSaga", "order_id", "o-1")
                .await
                .unwrap()
                .unwrap();
            if store.update(&loaded, &correlations("o-1")).await.is_ok() {
                successes += 1;
            }
        }
        // Sequential load-update pairs: every update succeeds, and the
        // final revision equals the number of successful updates.
        assert_eq!(store.get(saga.id).unwrap().revision, successes);
    }

    #[tokio::test]
    async fn delete_removes_row_and_index() {
        let store = InMemSagaStore::new();
        let saga = instance("o-1");
        store.insert(&saga, &correlations("o-1")).await.unwrap();

        let loaded = store
            .find("OrderSaga", "order_id", "o-1")
            .await
            .unwrap()
            .unwrap();
        store.delete(&loaded).await.unwrap();

        assert_eq!(store.count(), 0);
        assert!(store
            .find("OrderSaga", "order_id", "o-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stale_delete_conflicts() {
        let store = InMemSagaStore::new();
        let saga = instance("o-1");
        store.insert(&saga, &correlations("o-1")).await.unwrap();

        let stale = store
            .find("OrderSaga", "order_id", "o-1")
            .await
            .unwrap()
            .unwrap();
        store.update(&stale, &correlations("o-1")).await.unwrap();

        assert!(matches!(
            store.delete(&stale).await.unwrap_err(),
            BusError::ConcurrencyConflict { .. }
        ));
    }
}

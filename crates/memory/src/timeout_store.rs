//! # In-Memory Timeout Store
//!
//! Deferred messages as due-time rows with snapshot-with-lease semantics:
//! `due_messages` hides the returned rows from other callers; a row is
//! deleted only by `mark_completed`, and a dropped lease puts the row back
//! in the pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use ferrobus_core::envelope::Headers;
use ferrobus_core::timeouts::{DeferredMessage, DueLease, DueMessage, TimeoutStore};
use ferrobus_core::Result;

struct Row {
    due_at: DateTime<Utc>,
    headers: Headers,
    body: Vec<u8>,
    leased: bool,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<Uuid, Row>,
}

/// In-memory [`TimeoutStore`] implementation.
#[derive(Default, Clone)]
pub struct InMemTimeoutStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemTimeoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of parked messages, leased or not.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().rows.len()
    }
}

struct MemDueLease {
    inner: Arc<Mutex<Inner>>,
    id: Uuid,
    completed: bool,
}

#[async_trait]
impl DueLease for MemDueLease {
    async fn mark_completed(&mut self) -> Result<()> {
        self.inner.lock().rows.remove(&self.id);
        self.completed = true;
        Ok(())
    }
}

impl Drop for MemDueLease {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        // Not completed: the row goes back to the pool.
        if let Some(row) = self.inner.lock().rows.get_mut(&self.id) {
            row.leased = false;
        }
    }
}

#[async_trait]
impl TimeoutStore for InMemTimeoutStore {
    async fn defer(&self, message: DeferredMessage) -> Result<()> {
        self.inner.lock().rows.insert(
            Uuid::new_v4(),
            Row {
                due_at: message.due_at,
                headers: message.headers,
                body: message.body,
                leased: false,
            },
        );
        Ok(())
    }

    async fn due_messages(&self) -> Result<Vec<DueMessage>> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let due_ids: Vec<Uuid> = inner
            .rows
            .iter()
            .filter(|(_, row)| !row.leased && row.due_at <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut batch = Vec::with_capacity(due_ids.len());
        for id in due_ids {
            let row = inner.rows.get_mut(&id).expect("row exists");
            row.leased = true;
            batch.push(DueMessage::new(
                row.headers.clone(),
                row.body.clone(),
                Box::new(MemDueLease {
                    inner: self.inner.clone(),
                    id,
                    completed: false,
                }),
            ));
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deferred(offset: chrono::Duration) -> DeferredMessage {
        DeferredMessage::new(Utc::now() + offset, Headers::new(), b"body".to_vec())
    }

    #[tokio::test]
    async fn future_rows_are_invisible_until_due() {
        let store = InMemTimeoutStore::new();
        store
            .defer(deferred(chrono::Duration::milliseconds(40)))
            .await
            .unwrap();

        assert!(store.due_messages().await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.due_messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn leased_rows_are_hidden_from_concurrent_callers() {
        let store = InMemTimeoutStore::new();
        store
            .defer(deferred(chrono::Duration::milliseconds(-10)))
            .await
            .unwrap();

        let batch = store.due_messages().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(store.due_messages().await.unwrap().is_empty());
        drop(batch);

        // Lease dropped without completion: visible again.
        assert_eq!(store.due_messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completed_rows_are_gone_for_good() {
        let store = InMemTimeoutStore::new();
        store
            .defer(deferred(chrono::Duration::milliseconds(-10)))
            .await
            .unwrap();

        let mut batch = store.due_messages().await.unwrap();
        batch.pop().unwrap().mark_completed().await.unwrap();

        assert!(store.due_messages().await.unwrap().is_empty());
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn due_rows_keep_reappearing_until_completed() {
        let store = InMemTimeoutStore::new();
        store
            .defer(deferred(chrono::Duration::milliseconds(-10)))
            .await
            .unwrap();

        for _ in 0..3 {
            let batch = store.due_messages().await.unwrap();
            assert_eq!(batch.len(), 1);
            drop(batch);
        }
    }
}

//! # Transaction Context
//!
//! Per-message unit of work. Components register commit/rollback/cleanup
//! callbacks on the context at the point they acquire a resource; the worker
//! drives the terminal transitions.
//!
//! State machine:
//!
//! ```text
//!         ┌── commit ──► Committed ─(on_committed, then on_completed)─┐
//! Active ─┤                                                           ├─► Disposed
//!         └── abort  ──► Aborted ───(on_aborted)───────────────────────┘
//! ```
//!
//! Exactly one of commit or abort runs; a second terminal call is a no-op.
//! Dispose runs exactly once and last, on every path. Callbacks within a
//! list fire serially in registration order; a failing callback aborts the
//! remainder of its list but never skips dispose.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::Result;

/// Item bag key under which transports buffer outgoing messages.
pub const OUTGOING_MESSAGES_KEY: &str = "outgoing-messages";

/// Item bag key the worker uses to hand the terminal error to the transport
/// (which copies it into `rbs2-error-details` when dead-lettering).
pub const ERROR_DETAILS_KEY: &str = "error-details";

/// An async callback tied to a transaction phase.
pub type TxCallback =
    Box<dyn for<'a> FnOnce(&'a TransactionContext) -> BoxFuture<'a, Result<()>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    Aborted,
}

/// A per-message scratch space with a keyed item bag and four ordered
/// callback lists.
pub struct TransactionContext {
    items: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    on_committed: Mutex<Vec<TxCallback>>,
    on_aborted: Mutex<Vec<TxCallback>>,
    on_completed: Mutex<Vec<TxCallback>>,
    on_disposed: Mutex<Vec<TxCallback>>,
    state: Mutex<TxState>,
    disposed: AtomicBool,
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("state", &*self.state.lock())
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

impl TransactionContext {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            on_committed: Mutex::new(Vec::new()),
            on_aborted: Mutex::new(Vec::new()),
            on_completed: Mutex::new(Vec::new()),
            on_disposed: Mutex::new(Vec::new()),
            state: Mutex::new(TxState::Active),
            disposed: AtomicBool::new(false),
        }
    }

    /// Fetch the item under `key`, inserting `factory()` first if absent.
    ///
    /// The factory runs outside the bag lock, so it may register callbacks
    /// on this same context.
    pub fn get_or_add<T, F>(&self, key: &str, factory: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get::<T>(key) {
            return existing;
        }
        let created = Arc::new(factory());
        let mut items = self.items.lock();
        // Racing inserters: first one in wins, late factory result is dropped.
        let entry = items
            .entry(key.to_string())
            .or_insert_with(|| created.clone() as Arc<dyn Any + Send + Sync>);
        entry
            .clone()
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("transaction item {key:?} holds a different type"))
    }

    /// Fetch the item under `key` if present and of type `T`.
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let items = self.items.lock();
        items.get(key).cloned()?.downcast::<T>().ok()
    }

    /// Insert (or replace) the item under `key`.
    pub fn insert<T: Send + Sync + 'static>(&self, key: &str, value: T) {
        self.items
            .lock()
            .insert(key.to_string(), Arc::new(value) as Arc<dyn Any + Send + Sync>);
    }

    /// Register a callback fired when the transaction commits.
    pub fn on_committed(&self, callback: TxCallback) {
        self.on_committed.lock().push(callback);
    }

    /// Register a callback fired when the transaction aborts.
    pub fn on_aborted(&self, callback: TxCallback) {
        self.on_aborted.lock().push(callback);
    }

    /// Register a post-commit cleanup callback. Runs after every commit
    /// callback has succeeded.
    pub fn on_completed(&self, callback: TxCallback) {
        self.on_completed.lock().push(callback);
    }

    /// Register a callback that always runs, last, exactly once.
    pub fn on_disposed(&self, callback: TxCallback) {
        self.on_disposed.lock().push(callback);
    }

    /// Commit the unit of work: fire `on_committed`, then `on_completed`.
    ///
    /// A failing commit callback skips the remaining commit callbacks and
    /// the whole completed list; the error is returned to the caller. The
    /// transaction is terminal either way. No-op if already terminal.
    pub async fn commit(&self) -> Result<()> {
        if !self.transition(TxState::Committed) {
            return Ok(());
        }
        debug!("committing transaction");
        self.run_list(&self.on_committed).await?;
        self.run_list(&self.on_completed).await
    }

    /// Abort the unit of work: fire `on_aborted`. No-op if already terminal.
    pub async fn abort(&self) -> Result<()> {
        if !self.transition(TxState::Aborted) {
            return Ok(());
        }
        debug!("aborting transaction");
        self.run_list(&self.on_aborted).await
    }

    /// Fire `on_disposed`. Runs exactly once; later calls are no-ops.
    /// Errors from dispose callbacks are logged and swallowed: cleanup
    /// failures must not propagate across components.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.run_list(&self.on_disposed).await {
            error!(%err, "error during transaction dispose");
        }
    }

    /// Whether neither commit nor abort has run yet.
    pub fn is_active(&self) -> bool {
        *self.state.lock() == TxState::Active
    }

    fn transition(&self, target: TxState) -> bool {
        let mut state = self.state.lock();
        if *state != TxState::Active {
            return false;
        }
        *state = target;
        true
    }

    async fn run_list(&self, list: &Mutex<Vec<TxCallback>>) -> Result<()> {
        let callbacks = std::mem::take(&mut *list.lock());
        for callback in callbacks {
            callback(self).await?;
        }
        Ok(())
    }
}

/// Per-transaction buffer of outgoing messages, appended in send order and
/// flushed in destination-grouped batches when the transaction commits.
#[derive(Default)]
pub struct OutgoingMessages {
    entries: Mutex<Vec<(String, crate::envelope::TransportMessage)>>,
    flush_registered: AtomicBool,
}

impl OutgoingMessages {
    /// Append a message bound for `destination`.
    pub fn enqueue(&self, destination: String, message: crate::envelope::TransportMessage) {
        self.entries.lock().push((destination, message));
    }

    /// Number of buffered messages. Used by the idempotency layer to diff
    /// the outbox around a handler invocation.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of the entries appended at or after `start`.
    pub fn entries_from(
        &self,
        start: usize,
    ) -> Vec<(String, crate::envelope::TransportMessage)> {
        self.entries.lock()[start..].to_vec()
    }

    /// Drain all buffered messages grouped by destination, preserving the
    /// per-destination send order.
    pub fn drain_grouped(&self) -> Vec<(String, Vec<crate::envelope::TransportMessage>)> {
        let entries = std::mem::take(&mut *self.entries.lock());
        let mut grouped: Vec<(String, Vec<crate::envelope::TransportMessage>)> = Vec::new();
        for (destination, message) in entries {
            match grouped.iter_mut().find(|(d, _)| *d == destination) {
                Some((_, batch)) => batch.push(message),
                None => grouped.push((destination, vec![message])),
            }
        }
        grouped
    }

    /// Returns true exactly once, for the caller that must register the
    /// commit-time flush callback.
    pub fn claim_flush_registration(&self) -> bool {
        !self.flush_registered.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, entry: &'static str) -> TxCallback {
        let log = log.clone();
        Box::new(move |_| {
            Box::pin(async move {
                log.lock().push(entry);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn commit_fires_committed_then_completed_then_disposed() {
        let tx = TransactionContext::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        tx.on_completed(record(&log, "completed"));
        tx.on_committed(record(&log, "committed-1"));
        tx.on_committed(record(&log, "committed-2"));
        tx.on_disposed(record(&log, "disposed"));

        tx.commit().await.unwrap();
        tx.dispose().await;

        assert_eq!(
            *log.lock(),
            vec!["committed-1", "committed-2", "completed", "disposed"]
        );
    }

    #[tokio::test]
    async fn abort_fires_only_aborted_and_disposed() {
        let tx = TransactionContext::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        tx.on_committed(record(&log, "committed"));
        tx.on_aborted(record(&log, "aborted"));
        tx.on_disposed(record(&log, "disposed"));

        tx.abort().await.unwrap();
        tx.dispose().await;

        assert_eq!(*log.lock(), vec!["aborted", "disposed"]);
    }

    #[tokio::test]
    async fn second_terminal_call_is_noop() {
        let tx = TransactionContext::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        tx.on_aborted(Box::new(move |_| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));

        tx.commit().await.unwrap();
        tx.abort().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_commit_callback_skips_rest_but_not_dispose() {
        let tx = TransactionContext::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        tx.on_committed(Box::new(|_| {
            Box::pin(async { Err(crate::error::BusError::transport("ack lost", true)) })
        }));
        tx.on_committed(record(&log, "committed-2"));
        tx.on_completed(record(&log, "completed"));
        tx.on_disposed(record(&log, "disposed"));

        assert!(tx.commit().await.is_err());
        tx.dispose().await;

        assert_eq!(*log.lock(), vec!["disposed"]);
    }

    #[tokio::test]
    async fn dispose_runs_exactly_once() {
        let tx = TransactionContext::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        tx.on_disposed(Box::new(move |_| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));

        tx.commit().await.unwrap();
        tx.dispose().await;
        tx.dispose().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn item_bag_get_or_add_returns_same_instance() {
        let tx = TransactionContext::new();
        let first: Arc<OutgoingMessages> =
            tx.get_or_add(OUTGOING_MESSAGES_KEY, OutgoingMessages::default);
        first.enqueue(
            "q".into(),
            crate::envelope::TransportMessage::new(Default::default(), vec![1]),
        );

        let second: Arc<OutgoingMessages> =
            tx.get_or_add(OUTGOING_MESSAGES_KEY, OutgoingMessages::default);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn outgoing_messages_group_by_destination_in_order() {
        let outgoing = OutgoingMessages::default();
        let msg = |n: u8| crate::envelope::TransportMessage::new(Default::default(), vec![n]);
        outgoing.enqueue("a".into(), msg(1));
        outgoing.enqueue("b".into(), msg(2));
        outgoing.enqueue("a".into(), msg(3));

        let grouped = outgoing.drain_grouped();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, "a");
        assert_eq!(grouped[0].1.len(), 2);
        assert_eq!(grouped[0].1[0].body, vec![1]);
        assert_eq!(grouped[0].1[1].body, vec![3]);
        assert_eq!(grouped[1].0, "b");
    }

    #[test]
    fn flush_registration_claimed_once() {
        let outgoing = OutgoingMessages::default();
        assert!(outgoing.claim_flush_registration());
        assert!(!outgoing.claim_flush_registration());
    }
}

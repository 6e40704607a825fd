//! # Timeout Manager
//!
//! Defers a message until a future time, then re-emits it. The store hands
//! out due messages under a lease: a row stays hidden from other callers
//! until its handle is dropped, and only `mark_completed` deletes it. Rows
//! whose handle is dropped without completion return to the pool.
//!
//! A background poller drains due messages at a small interval and re-sends
//! each one to its `rbs2-defer-recipient`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::envelope::{headers, Headers, TransportMessage};
use crate::error::Result;
use crate::transaction::TransactionContext;
use crate::transport::Transport;

/// A message parked until `due_at`.
#[derive(Debug, Clone)]
pub struct DeferredMessage {
    pub due_at: DateTime<Utc>,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl DeferredMessage {
    pub fn new(due_at: DateTime<Utc>, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            due_at,
            headers,
            body,
        }
    }
}

/// Lease handle for one due row. Implementations delete the row on
/// `mark_completed` and return un-completed rows to the pool on drop.
#[async_trait]
pub trait DueLease: Send {
    async fn mark_completed(&mut self) -> Result<()>;
}

/// A due message plus its lease.
pub struct DueMessage {
    pub headers: Headers,
    pub body: Vec<u8>,
    lease: Box<dyn DueLease>,
}

impl DueMessage {
    pub fn new(headers: Headers, body: Vec<u8>, lease: Box<dyn DueLease>) -> Self {
        Self {
            headers,
            body,
            lease,
        }
    }

    /// Delete the backing row. Consumes the message so a completed row can
    /// never also be returned to the pool.
    pub async fn mark_completed(mut self) -> Result<()> {
        self.lease.mark_completed().await
    }
}

/// Storage contract for deferred messages.
#[async_trait]
pub trait TimeoutStore: Send + Sync + 'static {
    /// Park a message until its due time.
    async fn defer(&self, message: DeferredMessage) -> Result<()>;

    /// Every row with `due_at <= now` that is neither completed nor leased
    /// by another caller. Returned rows are leased to the caller.
    async fn due_messages(&self) -> Result<Vec<DueMessage>>;
}

/// Background worker that re-sends due messages to their recipients.
pub struct TimeoutPoller {
    handle: JoinHandle<()>,
    running: Arc<AtomicBool>,
}

impl TimeoutPoller {
    /// Spawn the poll loop. `fallback_recipient` is used when a stored
    /// message carries no `rbs2-defer-recipient` header.
    pub fn spawn(
        store: Arc<dyn TimeoutStore>,
        transport: Arc<dyn Transport>,
        poll_interval: Duration,
        fallback_recipient: Option<String>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = tokio::spawn(async move {
            while flag.load(Ordering::SeqCst) {
                if let Err(err) =
                    Self::drain_once(&store, &transport, fallback_recipient.as_deref()).await
                {
                    warn!(%err, "timeout poller pass failed");
                }
                tokio::time::sleep(poll_interval).await;
            }
        });
        Self { handle, running }
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        self.handle.abort();
        let _ = self.handle.await;
    }

    async fn drain_once(
        store: &Arc<dyn TimeoutStore>,
        transport: &Arc<dyn Transport>,
        fallback_recipient: Option<&str>,
    ) -> Result<()> {
        let due = store.due_messages().await?;
        if due.is_empty() {
            return Ok(());
        }
        debug!(count = due.len(), "re-sending due deferred messages");

        for message in due {
            let recipient = message
                .headers
                .get(headers::DEFER_RECIPIENT)
                .map(String::as_str)
                .or(fallback_recipient)
                .map(str::to_string);
            let Some(recipient) = recipient else {
                warn!("deferred message has no recipient and no fallback is configured");
                continue;
            };

            // The deferral bookkeeping headers do not travel any further.
            let mut outgoing_headers = message.headers.clone();
            outgoing_headers.remove(headers::DEFERRED_UNTIL);
            outgoing_headers.remove(headers::DEFER_RECIPIENT);

            let tx = Arc::new(TransactionContext::new());
            let wire = TransportMessage::new(outgoing_headers, message.body.clone());
            let sent = transport.send(&recipient, wire, &tx).await;
            let committed = match sent {
                Ok(()) => tx.commit().await,
                Err(err) => {
                    let _ = tx.abort().await;
                    Err(err)
                }
            };
            tx.dispose().await;

            match committed {
                // Completed only after the re-send committed; a crash in
                // between re-delivers rather than losing the message.
                Ok(()) => message.mark_completed().await?,
                Err(err) => {
                    warn!(%err, %recipient, "failed to re-send due message, returning it to the pool");
                }
            }
        }
        Ok(())
    }
}

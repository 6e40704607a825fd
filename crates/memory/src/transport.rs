//! # In-Memory Transport
//!
//! [`Transport`] adapter over the [`InMemNetwork`]. Sends buffer on the
//! transaction and flush on commit through the transient-error retrier;
//! receives take a peek lock and register ack (on commit), abandon (on
//! abort) and an undecided-lock safety net (on dispose) before the message
//! is handed to the pipeline.
//!
//! The ack callback is registered at receive time, which places it ahead of
//! the outgoing flush in the commit order: when an ack is lost, nothing is
//! flushed either, and redelivery (or the idempotent-saga layer) reproduces
//! the batch.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use ferrobus_core::transaction::ERROR_DETAILS_KEY;
use ferrobus_core::{
    BusError, OutgoingMessages, ReceiveMode, Result, Retrier, TransactionContext,
    Transport, TransportMessage, OUTGOING_MESSAGES_KEY,
};

use crate::network::{InMemNetwork, Lease, DEFAULT_LEASE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Undecided,
    Acked,
    Nacked,
}

type AckFault = Box<dyn Fn(u64) -> bool + Send + Sync>;

#[derive(Default)]
struct AckFaults {
    counter: AtomicU64,
    fault: Mutex<Option<AckFault>>,
}

impl AckFaults {
    /// Returns an error for acks the injected fault selects.
    fn check(&self) -> Result<()> {
        let attempt = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let faulted = self
            .fault
            .lock()
            .as_ref()
            .map(|fault| fault(attempt))
            .unwrap_or(false);
        if faulted {
            return Err(BusError::transport(
                format!("injected ack failure on attempt {attempt}"),
                true,
            ));
        }
        Ok(())
    }
}

/// Transport over a process-local [`InMemNetwork`].
pub struct InMemTransport {
    network: Arc<InMemNetwork>,
    address: Option<String>,
    mode: ReceiveMode,
    lease: Duration,
    retrier: Retrier,
    prefetched: Mutex<VecDeque<Lease>>,
    ack_faults: Arc<AckFaults>,
}

impl InMemTransport {
    /// A receiving endpoint with its own input queue.
    pub fn new(network: Arc<InMemNetwork>, address: impl Into<String>) -> Self {
        let address = address.into();
        network.create_queue(&address);
        Self {
            network,
            address: Some(address),
            mode: ReceiveMode::default(),
            lease: DEFAULT_LEASE,
            retrier: Retrier::on_transient(),
            prefetched: Mutex::new(VecDeque::new()),
            ack_faults: Arc::new(AckFaults::default()),
        }
    }

    /// A send-only endpoint: no input queue, `receive` is an error.
    pub fn send_only(network: Arc<InMemNetwork>) -> Self {
        Self {
            network,
            address: None,
            mode: ReceiveMode::default(),
            lease: DEFAULT_LEASE,
            retrier: Retrier::on_transient(),
            prefetched: Mutex::new(VecDeque::new()),
            ack_faults: Arc::new(AckFaults::default()),
        }
    }

    pub fn with_receive_mode(mut self, mode: ReceiveMode) -> Self {
        self.mode = mode;
        self
    }

    /// Peek-lock duration handed to the network on receive.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retrier(mut self, retrier: Retrier) -> Self {
        self.retrier = retrier;
        self
    }

    /// Test hook: fail the n-th ack (1-based) for which `fault` returns
    /// true, simulating an ack lost after commit.
    pub fn inject_ack_fault(&self, fault: impl Fn(u64) -> bool + Send + Sync + 'static) {
        *self.ack_faults.fault.lock() = Some(Box::new(fault));
    }

    fn require_address(&self) -> Result<&str> {
        self.address.as_deref().ok_or_else(|| {
            BusError::configuration("this endpoint is send-only and cannot receive")
        })
    }

    async fn acquire_lease(&self, address: &str) -> Option<Lease> {
        match self.mode {
            ReceiveMode::Prefetch(count) => {
                if let Some(lease) = self.prefetched.lock().pop_front() {
                    return Some(lease);
                }
                let fetched = self
                    .network
                    .receive_many(address, count, self.lease, Duration::from_secs(1))
                    .await;
                let mut buffer = self.prefetched.lock();
                buffer.extend(fetched);
                buffer.pop_front()
            }
            _ => {
                self.network
                    .receive(address, self.lease, Duration::from_millis(50))
                    .await
            }
        }
    }

    fn register_transaction_hooks(&self, tx: &TransactionContext, lease: &Lease) {
        let decision = Arc::new(Mutex::new(Decision::Undecided));
        let address = self.address.clone().expect("receive requires an address");
        let token = lease.token;
        let renewal_stop = Arc::new(Notify::new());

        // Ack on commit. Registered at receive time, so it runs before any
        // outgoing flush registered later in the same transaction.
        {
            let network = self.network.clone();
            let address = address.clone();
            let decision = decision.clone();
            let faults = self.ack_faults.clone();
            tx.on_committed(Box::new(move |_tx| {
                Box::pin(async move {
                    faults.check()?;
                    network.ack(&address, token)?;
                    *decision.lock() = Decision::Acked;
                    Ok(())
                })
            }));
        }

        // Abandon on abort, carrying the worker's error details along for
        // the dead-letter path.
        {
            let network = self.network.clone();
            let address = address.clone();
            let decision = decision.clone();
            tx.on_aborted(Box::new(move |tx| {
                Box::pin(async move {
                    let details = tx.get::<String>(ERROR_DETAILS_KEY);
                    network.nack(&address, token, details.as_deref().map(|d| &**d))?;
                    *decision.lock() = Decision::Nacked;
                    Ok(())
                })
            }));
        }

        // Safety net: a transaction that ends without a decision (a failed
        // ack, an abandoned worker) must not strand the peek lock.
        {
            let network = self.network.clone();
            let decision = decision.clone();
            let renewal_stop = renewal_stop.clone();
            tx.on_disposed(Box::new(move |_tx| {
                Box::pin(async move {
                    renewal_stop.notify_waiters();
                    if *decision.lock() == Decision::Undecided {
                        debug!(token = %token, "abandoning undecided peek lock");
                        let _ = network.nack(&address, token, Some("message processing was abandoned"));
                    }
                    Ok(())
                })
            }));
        }

        if matches!(self.mode, ReceiveMode::RenewOnLease) {
            self.spawn_renewal_task(token, lease.expires_at, renewal_stop);
        }
    }

    /// Extends the peek lock at 80 % of the remaining lease until the
    /// transaction ends. The interval is refreshed from the actual expiry
    /// after every successful renewal, so long handlers never under-renew.
    fn spawn_renewal_task(&self, token: Uuid, expires_at: Instant, stop: Arc<Notify>) {
        let network = self.network.clone();
        let address = self.address.clone().expect("renewal requires an address");
        let lease = self.lease;
        tokio::spawn(async move {
            let mut expires_at = expires_at;
            loop {
                let remaining = expires_at.saturating_duration_since(Instant::now());
                let sleep_for = remaining.mul_f32(0.8);
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = tokio::time::sleep(sleep_for) => {}
                }
                match network.renew(&address, token, lease) {
                    Ok(new_expiry) => {
                        debug!(token = %token, "peek lock renewed");
                        expires_at = new_expiry;
                    }
                    Err(err) => {
                        debug!(token = %token, %err, "peek lock renewal stopped");
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Transport for InMemTransport {
    async fn create_queue(&self, address: &str) -> Result<()> {
        self.network.create_queue(address);
        Ok(())
    }

    async fn send(
        &self,
        destination: &str,
        mut message: TransportMessage,
        tx: &TransactionContext,
    ) -> Result<()> {
        message.truncate_oversized_headers();

        let outgoing = tx.get_or_add(OUTGOING_MESSAGES_KEY, OutgoingMessages::default);
        if outgoing.claim_flush_registration() {
            let network = self.network.clone();
            let retrier = self.retrier.clone();
            tx.on_committed(Box::new(move |tx| {
                Box::pin(async move {
                    let Some(outgoing) = tx.get::<OutgoingMessages>(OUTGOING_MESSAGES_KEY)
                    else {
                        return Ok(());
                    };
                    for (destination, batch) in outgoing.drain_grouped() {
                        for message in batch {
                            retrier
                                .execute(|| {
                                    let network = network.clone();
                                    let destination = destination.clone();
                                    let message = message.clone();
                                    async move { network.deliver(&destination, message) }
                                })
                                .await?;
                        }
                    }
                    Ok(())
                })
            }));
        }
        outgoing.enqueue(destination.to_string(), message);
        Ok(())
    }

    async fn receive(&self, tx: &TransactionContext) -> Result<Option<TransportMessage>> {
        let address = self.require_address()?.to_string();
        let Some(lease) = self.acquire_lease(&address).await else {
            return Ok(None);
        };
        self.register_transaction_hooks(tx, &lease);
        Ok(Some(lease.message))
    }

    fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

impl Drop for InMemTransport {
    fn drop(&mut self) {
        // Prefetched-but-unhandled messages must not stay invisible until
        // their lease expires.
        let Some(address) = self.address.clone() else {
            return;
        };
        let mut buffer = self.prefetched.lock();
        for lease in buffer.drain(..) {
            warn!(token = %lease.token, "abandoning prefetched message on transport dispose");
            let _ = self.network.nack(
                &address,
                lease.token,
                Some("prefetched message abandoned on transport dispose"),
            );
        }
    }
}

//! # Transport Port
//!
//! Send/receive under a transaction context with peek-lock semantics.
//!
//! Send buffers on the transaction's outgoing-messages bag; no I/O happens
//! until the transaction commits, at which point each destination's batch is
//! flushed. A handler that sends N messages and then fails sends zero.
//!
//! Receive returns a message that stays invisible to other consumers until
//! the transaction commits (transport ack) or aborts (transport abandon,
//! making it immediately re-deliverable). The transport registers its
//! ack/abandon callbacks on the transaction before returning the message,
//! which puts the ack ahead of the outgoing flush in the commit order: a
//! lost ack means the outgoing batch is not flushed either, and redelivery
//! (or the idempotency layer) reproduces it.

use async_trait::async_trait;

use crate::envelope::TransportMessage;
use crate::error::Result;
use crate::transaction::TransactionContext;

/// How the transport acquires messages. Lock renewal assumes long-running
/// handlers; prefetching assumes short ones. The two are mutually exclusive
/// by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiveMode {
    /// One message per receive call, no renewal.
    #[default]
    Plain,
    /// Spawn a renewal task per received message that extends the peek lock
    /// at 80 % of the remaining lease until the transaction ends.
    RenewOnLease,
    /// Drain a local buffer first; when empty, fetch up to N messages in one
    /// broker round-trip (short server-side timeout). Prefetched but
    /// unhandled messages are abandoned when the transport is dropped.
    Prefetch(usize),
}

/// Contract every broker driver satisfies.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Create the queue at `address` if the broker supports management.
    /// Idempotent.
    async fn create_queue(&self, address: &str) -> Result<()>;

    /// Buffer `message` for `destination` on the transaction; flushed on
    /// commit. Broker calls made by the flush are wrapped in the transport's
    /// retrier with its transient-error classifier.
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        tx: &TransactionContext,
    ) -> Result<()>;

    /// Receive one message under peek-lock, or `None` when the input queue
    /// is empty. Implementations use a short server-side timeout (at most
    /// one second) to keep workers responsive to shutdown.
    async fn receive(&self, tx: &TransactionContext) -> Result<Option<TransportMessage>>;

    /// The endpoint's own queue address; `None` for send-only endpoints.
    fn address(&self) -> Option<&str>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_mode_defaults_to_plain() {
        assert_eq!(ReceiveMode::default(), ReceiveMode::Plain);
    }

    #[test]
    fn prefetch_and_renewal_are_distinct_modes() {
        // Encoding the exclusivity in the enum means a config carrying
        // Prefetch can never also renew.
        let mode = ReceiveMode::Prefetch(10);
        assert!(!matches!(mode, ReceiveMode::RenewOnLease));
    }
}

//! # ferrobus-core
//!
//! Core messaging runtime: moves messages between endpoints with
//! transactional semantics, dispatches them to handlers under bounded
//! parallelism, and coordinates long-running correlated conversations
//! (sagas) whose state persists across messages.
//!
//! ## Architecture
//!
//! This crate defines the ports (traits) the runtime consumes and all of
//! the runtime machinery. It has zero infrastructure dependencies; broker
//! drivers and stores plug in through the ports:
//!
//! - [`transport`]: [`Transport`] — send/receive under a transaction with
//!   peek-lock semantics
//! - [`transaction`]: [`TransactionContext`] — commit/rollback/cleanup
//!   callbacks for one unit of work
//! - [`pipeline`] + [`steps`]: ordered, composable middleware over a keyed
//!   step context
//! - [`retry`]: [`Retrier`] — bounded backoff over classified transient
//!   failures
//! - [`bottleneck`]: [`Bottleneck`] — bounded concurrent admission gate
//! - `worker`: the receive loop pumping messages through the pipeline
//! - [`serializer`]: [`Serializer`] contract plus the JSON reference codec
//! - [`router`] / [`subscriptions`]: destination resolution and topic
//!   fan-out
//! - [`timeouts`]: deferred delivery via [`TimeoutStore`] and the poller
//! - [`saga`]: correlation, optimistic-concurrency persistence and the
//!   idempotent re-delivery layer
//! - [`bus`]: the user-facing [`Bus`] façade
//!
//! ## Delivery guarantees
//!
//! At-least-once. Sends issued inside a handler are buffered on the
//! transaction and flushed only on commit, so a failing handler sends
//! nothing; a lost ack redelivers, which handler idempotency or the
//! idempotent-saga layer absorbs.

pub mod bottleneck;
pub mod bus;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod retry;
pub mod router;
pub mod saga;
pub mod serializer;
pub mod steps;
pub mod subscriptions;
pub mod timeouts;
pub mod transaction;
pub mod transport;
mod worker;

pub use bottleneck::{Bottleneck, BottleneckToken};
pub use bus::{Bus, BusBuilder};
pub use config::BusConfig;
pub use envelope::{headers, BusMessage, Headers, LogicalMessage, TransportMessage};
pub use error::{BusError, Result};
pub use handler::{Handler, HandlerRegistry, MessageContext};
pub use pipeline::{Next, Pipeline, Step, StepContext};
pub use retry::Retrier;
pub use router::{Router, TypeBasedRouter};
pub use saga::{
    CorrelationConfig, CorrelationValue, IdempotencyData, OutgoingRecord, Saga, SagaContext,
    SagaInstance, SagaStore,
};
pub use serializer::{JsonSerializer, Serializer};
pub use subscriptions::SubscriptionStore;
pub use timeouts::{DeferredMessage, DueLease, DueMessage, TimeoutStore};
pub use transaction::{OutgoingMessages, TransactionContext, OUTGOING_MESSAGES_KEY};
pub use transport::{ReceiveMode, Transport};

//! # Handlers and the Outbound Gateway
//!
//! User code meets the runtime here: typed handlers are registered per
//! message type at bus-build time (the wire type tag drives the lookup),
//! and every handler invocation receives a [`MessageContext`] whose send
//! operations ride the ambient transaction — nothing leaves the endpoint
//! unless the incoming message commits.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::envelope::{headers, BusMessage, Headers, LogicalMessage, TransportMessage};
use crate::error::{BusError, Result};
use crate::pipeline::{keys, Pipeline, StepContext};
use crate::router::Router;
use crate::saga::{DynSaga, SagaInstance};
use crate::transaction::TransactionContext;
use crate::transport::Transport;

/// A message handler, type-erased. Handlers for one message run serially in
/// registration order; different messages run independently.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn invoke(&self, ctx: &MessageContext, message: &LogicalMessage) -> Result<()>;
}

/// Adapts an async closure over a concrete message type into a [`Handler`].
pub struct TypedHandler<M, F> {
    handler: F,
    _message: PhantomData<fn(M)>,
}

impl<M, F> TypedHandler<M, F> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<M, F, Fut> Handler for TypedHandler<M, F>
where
    M: BusMessage,
    F: Fn(MessageContext, M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn invoke(&self, ctx: &MessageContext, message: &LogicalMessage) -> Result<()> {
        let decoded: M = message.decode()?;
        (self.handler)(ctx.clone(), decoded).await
    }
}

/// Adapts an async closure over the raw [`LogicalMessage`]. Used for
/// messages without a type tag (dynamic dispatch).
pub struct UntypedHandler<F> {
    handler: F,
}

impl<F> UntypedHandler<F> {
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F, Fut> Handler for UntypedHandler<F>
where
    F: Fn(MessageContext, LogicalMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn invoke(&self, ctx: &MessageContext, message: &LogicalMessage) -> Result<()> {
        (self.handler)(ctx.clone(), message.clone()).await
    }
}

/// Explicit registry populated at bus-build time: wire type tag → handlers,
/// plus the registered sagas and the fallback list for untagged messages.
#[derive(Default)]
pub struct HandlerRegistry {
    typed: HashMap<String, Vec<Arc<dyn Handler>>>,
    fallback: Vec<Arc<dyn Handler>>,
    sagas: Vec<Arc<dyn DynSaga>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M, F, Fut>(&mut self, handler: F)
    where
        M: BusMessage,
        F: Fn(MessageContext, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.typed
            .entry(M::message_type().to_string())
            .or_default()
            .push(Arc::new(TypedHandler::new(handler)));
    }

    pub fn register_fallback<F, Fut>(&mut self, handler: F)
    where
        F: Fn(MessageContext, LogicalMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.fallback.push(Arc::new(UntypedHandler::new(handler)));
    }

    pub fn register_saga(&mut self, saga: Arc<dyn DynSaga>) {
        self.sagas.push(saga);
    }

    /// Handlers for a tagged message: typed handlers first, then the sagas
    /// handling that type, each in registration order.
    pub fn resolve(&self, message_type: &str) -> Vec<HandlerInvoker> {
        let mut invokers: Vec<HandlerInvoker> = self
            .typed
            .get(message_type)
            .into_iter()
            .flatten()
            .cloned()
            .map(HandlerInvoker::Plain)
            .collect();
        for saga in &self.sagas {
            if saga.handles(message_type) {
                invokers.push(HandlerInvoker::Saga(SagaWork::new(saga.clone())));
            }
        }
        invokers
    }

    /// Handlers for a message without a type tag.
    pub fn resolve_fallback(&self) -> Vec<HandlerInvoker> {
        self.fallback
            .iter()
            .cloned()
            .map(HandlerInvoker::Plain)
            .collect()
    }

    pub fn has_sagas(&self) -> bool {
        !self.sagas.is_empty()
    }
}

/// One handler scheduled for the current message.
pub enum HandlerInvoker {
    Plain(Arc<dyn Handler>),
    Saga(SagaWork),
}

/// Mutable coordination state for one saga handler across the load,
/// dispatch and save steps.
pub struct SagaWork {
    pub saga: Arc<dyn DynSaga>,
    pub state: SagaWorkState,
}

impl SagaWork {
    fn new(saga: Arc<dyn DynSaga>) -> Self {
        Self {
            saga,
            state: SagaWorkState::Pending,
        }
    }
}

/// Lifecycle of one saga handler for one message.
pub enum SagaWorkState {
    /// Not yet looked up.
    Pending,
    /// Instance loaded (or freshly created) and ready for dispatch.
    Loaded {
        instance: SagaInstance,
        is_new: bool,
        completed: bool,
    },
    /// The message correlates with nothing and does not initiate; the
    /// handler is skipped.
    Uncorrelated,
}

/// The shared invoker list steps pass through the step context.
pub type InvokerList = Mutex<Vec<HandlerInvoker>>;

/// Everything needed to push a message out of the endpoint: the outgoing
/// pipeline plus routing and the transport. Shared by the bus façade and
/// every [`MessageContext`].
pub struct OutboundGateway {
    pipeline: Pipeline,
    router: Arc<dyn Router>,
    transport: Arc<dyn Transport>,
}

impl OutboundGateway {
    pub fn new(
        pipeline: Pipeline,
        router: Arc<dyn Router>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            pipeline,
            router,
            transport,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Route a message point-to-point via the type map.
    pub async fn send<M: BusMessage>(
        &self,
        tx: &Arc<TransactionContext>,
        incoming: Option<&Headers>,
        message: &M,
    ) -> Result<()> {
        let destination = self.router.destination_for(M::message_type()).await?;
        self.send_to(tx, incoming, &destination, message).await
    }

    /// Send a message to an explicit queue address.
    pub async fn send_to<M: BusMessage>(
        &self,
        tx: &Arc<TransactionContext>,
        incoming: Option<&Headers>,
        destination: &str,
        message: &M,
    ) -> Result<()> {
        self.dispatch(
            tx,
            incoming,
            vec![destination.to_string()],
            Some(M::message_type()),
            serde_json::to_value(message)?,
            headers::intent::POINT_TO_POINT,
            Headers::new(),
        )
        .await
    }

    /// Publish to every subscriber of the message type's topic. Zero
    /// subscribers is valid and delivers nothing.
    pub async fn publish<M: BusMessage>(
        &self,
        tx: &Arc<TransactionContext>,
        incoming: Option<&Headers>,
        message: &M,
    ) -> Result<()> {
        let subscribers = self.router.subscribers_for(M::message_type()).await?;
        if subscribers.is_empty() {
            return Ok(());
        }
        self.dispatch(
            tx,
            incoming,
            subscribers,
            Some(M::message_type()),
            serde_json::to_value(message)?,
            headers::intent::PUBLISH,
            Headers::new(),
        )
        .await
    }

    /// Park a message with the timeout manager until `delay` has elapsed,
    /// then deliver it to its routed destination. Extra headers travel with
    /// the message and survive the deferral round-trip.
    pub async fn defer<M: BusMessage>(
        &self,
        tx: &Arc<TransactionContext>,
        incoming: Option<&Headers>,
        delay: Duration,
        extra_headers: Headers,
        message: &M,
    ) -> Result<()> {
        let own_address = self
            .transport
            .address()
            .ok_or_else(|| {
                BusError::configuration("a send-only endpoint cannot defer messages")
            })?
            .to_string();
        let recipient = match self.router.destination_for(M::message_type()).await {
            Ok(destination) => destination,
            Err(_) => own_address.clone(),
        };

        let due = Utc::now()
            + chrono::Duration::from_std(delay)
                .map_err(|e| BusError::configuration(format!("defer delay out of range: {e}")))?;

        let mut extra = extra_headers;
        extra.insert(headers::DEFERRED_UNTIL.to_string(), due.to_rfc3339());
        extra.insert(headers::DEFER_RECIPIENT.to_string(), recipient);

        // The deferral itself goes to our own input queue, where the
        // incoming pipeline hands it to the timeout manager.
        self.dispatch(
            tx,
            incoming,
            vec![own_address],
            Some(M::message_type()),
            serde_json::to_value(message)?,
            headers::intent::POINT_TO_POINT,
            extra,
        )
        .await
    }

    async fn dispatch(
        &self,
        tx: &Arc<TransactionContext>,
        incoming: Option<&Headers>,
        destinations: Vec<String>,
        type_tag: Option<&str>,
        body: serde_json::Value,
        intent: &str,
        mut extra_headers: Headers,
    ) -> Result<()> {
        if let Some(tag) = type_tag {
            extra_headers.insert(headers::MESSAGE_TYPE.to_string(), tag.to_string());
        }
        extra_headers.insert(headers::INTENT.to_string(), intent.to_string());

        let ctx = StepContext::new();
        ctx.insert_arc(keys::TRANSACTION, tx.clone());
        ctx.insert(keys::DESTINATIONS, destinations);
        ctx.insert(
            keys::OUTGOING_MESSAGE,
            Mutex::new(LogicalMessage::new(extra_headers, body)),
        );
        if let Some(incoming) = incoming {
            ctx.insert(keys::INCOMING_HEADERS, incoming.clone());
        }
        self.pipeline.process(ctx).await
    }
}

/// Handler-facing view of one message being processed: the incoming
/// headers, the ambient transaction, and transactional bus operations.
#[derive(Clone)]
pub struct MessageContext {
    tx: Arc<TransactionContext>,
    gateway: Arc<OutboundGateway>,
    transport_message: Arc<TransportMessage>,
}

impl MessageContext {
    pub fn new(
        tx: Arc<TransactionContext>,
        gateway: Arc<OutboundGateway>,
        transport_message: Arc<TransportMessage>,
    ) -> Self {
        Self {
            tx,
            gateway,
            transport_message,
        }
    }

    /// Headers of the message being handled.
    pub fn headers(&self) -> &Headers {
        &self.transport_message.headers
    }

    /// The unit of work this handler runs under.
    pub fn transaction(&self) -> &Arc<TransactionContext> {
        &self.tx
    }

    /// Route a message to its mapped destination. Buffered until commit.
    pub async fn send<M: BusMessage>(&self, message: &M) -> Result<()> {
        self.gateway
            .send(&self.tx, Some(self.headers()), message)
            .await
    }

    /// Send to an explicit queue address. Buffered until commit.
    pub async fn send_to<M: BusMessage>(&self, destination: &str, message: &M) -> Result<()> {
        self.gateway
            .send_to(&self.tx, Some(self.headers()), destination, message)
            .await
    }

    /// Publish to all subscribers of the message type's topic.
    pub async fn publish<M: BusMessage>(&self, message: &M) -> Result<()> {
        self.gateway
            .publish(&self.tx, Some(self.headers()), message)
            .await
    }

    /// Reply to the sender's `rbs2-return-address`.
    pub async fn reply<M: BusMessage>(&self, message: &M) -> Result<()> {
        let return_address = self
            .headers()
            .get(headers::RETURN_ADDRESS)
            .cloned()
            .ok_or_else(|| {
                BusError::handler("cannot reply: incoming message has no return address")
            })?;
        self.send_to(&return_address, message).await
    }

    /// Defer a message for `delay`, delivered to its routed destination.
    pub async fn defer<M: BusMessage>(&self, delay: Duration, message: &M) -> Result<()> {
        self.defer_with_headers(delay, Headers::new(), message).await
    }

    /// Defer with extra headers that survive the deferral round-trip.
    pub async fn defer_with_headers<M: BusMessage>(
        &self,
        delay: Duration,
        extra_headers: Headers,
        message: &M,
    ) -> Result<()> {
        self.gateway
            .defer(&self.tx, Some(self.headers()), delay, extra_headers, message)
            .await
    }

    /// Forward the incoming wire message as-is (plus `extra_headers`) to
    /// another queue on the current transaction. Committing acks the
    /// original, so the message moves rather than copies.
    pub async fn forward(&self, destination: &str, extra_headers: Headers) -> Result<()> {
        let mut message = (*self.transport_message).clone();
        message.headers.extend(extra_headers);
        self.gateway
            .transport()
            .send(destination, message, &self.tx)
            .await
    }
}


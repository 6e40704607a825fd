//! Steps of the incoming pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::envelope::{headers, LogicalMessage, TransportMessage};
use crate::error::{BusError, Result};
use crate::handler::{
    HandlerInvoker, HandlerRegistry, InvokerList, MessageContext, OutboundGateway, SagaWorkState,
};
use crate::pipeline::{keys, Next, Step, StepContext};
use crate::saga::{DynSaga, OutgoingRecord, SagaInstance, SagaStore};
use crate::serializer::Serializer;
use crate::timeouts::{DeferredMessage, TimeoutStore};
use crate::transaction::{OutgoingMessages, TransactionContext, OUTGOING_MESSAGES_KEY};

/// Turns the wire message into a [`LogicalMessage`]. A failure here is
/// poison: the worker forwards the message to the dead-letter queue.
pub struct DeserializeStep {
    serializer: Arc<dyn Serializer>,
}

impl DeserializeStep {
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self { serializer }
    }
}

#[async_trait]
impl Step for DeserializeStep {
    async fn process(&self, ctx: StepContext, next: Next) -> Result<()> {
        let wire = ctx.load::<TransportMessage>(keys::TRANSPORT_MESSAGE)?;
        let logical = self.serializer.deserialize(&wire).await?;
        ctx.insert(keys::LOGICAL_MESSAGE, logical);
        next.invoke(ctx).await
    }
}

/// Intercepts messages whose `rbs2-deferred-until` lies in the future,
/// hands them to the timeout manager and short-circuits: committing the
/// transaction then acks the original delivery.
pub struct HandleDeferredMessagesStep {
    timeout_store: Option<Arc<dyn TimeoutStore>>,
}

impl HandleDeferredMessagesStep {
    pub fn new(timeout_store: Option<Arc<dyn TimeoutStore>>) -> Self {
        Self { timeout_store }
    }
}

#[async_trait]
impl Step for HandleDeferredMessagesStep {
    async fn process(&self, ctx: StepContext, next: Next) -> Result<()> {
        let wire = ctx.load::<TransportMessage>(keys::TRANSPORT_MESSAGE)?;
        if let Some(raw) = wire.header(headers::DEFERRED_UNTIL) {
            let due = DateTime::parse_from_rfc3339(raw)
                .map_err(|e| {
                    BusError::serialization(format!("malformed {} header: {e}", headers::DEFERRED_UNTIL))
                })?
                .with_timezone(&Utc);

            if due > Utc::now() {
                let store = self.timeout_store.as_ref().ok_or_else(|| {
                    BusError::configuration(
                        "received a deferred message but no timeout store is configured",
                    )
                })?;
                store
                    .defer(DeferredMessage::new(due, wire.headers.clone(), wire.body.clone()))
                    .await?;
                debug!(due = %due, "message deferred until its due time");
                return Ok(());
            }
        }
        next.invoke(ctx).await
    }
}

/// Resolves the handlers for the logical type and attaches them to the
/// context. Messages without a type tag go to the fallback handlers.
pub struct ActivateHandlersStep {
    registry: Arc<HandlerRegistry>,
}

impl ActivateHandlersStep {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Step for ActivateHandlersStep {
    async fn process(&self, ctx: StepContext, next: Next) -> Result<()> {
        let logical = ctx.load::<LogicalMessage>(keys::LOGICAL_MESSAGE)?;
        let invokers = match logical.message_type() {
            Some(message_type) => self.registry.resolve(message_type),
            None => self.registry.resolve_fallback(),
        };
        if invokers.is_empty() {
            return Err(BusError::handler(format!(
                "no handlers registered for message type {:?}",
                logical.message_type().unwrap_or("<untyped>")
            )));
        }
        ctx.insert::<InvokerList>(keys::HANDLER_INVOKERS, InvokerList::new(invokers));
        next.invoke(ctx).await
    }
}

/// Correlates the message with existing saga instances, creating fresh data
/// for initiating messages. Non-initiating uncorrelated messages mark the
/// saga handler as skipped.
pub struct LoadSagaDataStep {
    store: Option<Arc<dyn SagaStore>>,
    idempotent: bool,
}

impl LoadSagaDataStep {
    pub fn new(store: Option<Arc<dyn SagaStore>>, idempotent: bool) -> Self {
        Self { store, idempotent }
    }
}

#[async_trait]
impl Step for LoadSagaDataStep {
    async fn process(&self, ctx: StepContext, next: Next) -> Result<()> {
        let logical = ctx.load::<LogicalMessage>(keys::LOGICAL_MESSAGE)?;
        let invokers = ctx.load::<InvokerList>(keys::HANDLER_INVOKERS)?;

        let saga_jobs: Vec<(usize, Arc<dyn DynSaga>)> = {
            let list = invokers.lock();
            list.iter()
                .enumerate()
                .filter_map(|(index, invoker)| match invoker {
                    HandlerInvoker::Saga(work) => Some((index, work.saga.clone())),
                    HandlerInvoker::Plain(_) => None,
                })
                .collect()
        };
        if saga_jobs.is_empty() {
            return next.invoke(ctx).await;
        }

        let store = self.store.as_ref().ok_or_else(|| {
            BusError::configuration("sagas are registered but no saga store is configured")
        })?;
        let message_type = logical.message_type().unwrap_or_default().to_string();

        for (index, saga) in saga_jobs {
            let mut found = None;
            for entry in saga.entries_for(&message_type) {
                let Some(value) = entry.extract(&logical) else {
                    continue;
                };
                if let Some(instance) = store
                    .find(saga.saga_type(), entry.property(), &value)
                    .await?
                {
                    found = Some(instance);
                    break;
                }
            }

            let state = match found {
                Some(mut instance) => {
                    if self.idempotent && instance.idempotency.is_none() {
                        instance.idempotency = Some(Default::default());
                    }
                    SagaWorkState::Loaded {
                        instance,
                        is_new: false,
                        completed: false,
                    }
                }
                None if saga.initiates(&message_type) => {
                    let mut instance = SagaInstance::fresh(
                        saga.saga_type(),
                        saga.new_data()?,
                        self.idempotent,
                    );
                    // Seed the correlation properties from the initiating
                    // message so follow-ups can find the instance.
                    for entry in saga.entries_for(&message_type) {
                        if let Some(value) = entry.extract(&logical) {
                            crate::saga::set_data_property(
                                &mut instance.data,
                                entry.property(),
                                &value,
                            );
                        }
                    }
                    SagaWorkState::Loaded {
                        instance,
                        is_new: true,
                        completed: false,
                    }
                }
                None => {
                    debug!(
                        saga_type = saga.saga_type(),
                        %message_type,
                        "message does not correlate and does not initiate"
                    );
                    SagaWorkState::Uncorrelated
                }
            };

            if let HandlerInvoker::Saga(work) = &mut invokers.lock()[index] {
                work.state = state;
            }
        }
        next.invoke(ctx).await
    }
}

/// Invokes every activated handler in registration order. Saga handlers go
/// through the idempotency check first; a suppressed redelivery replays the
/// recorded outgoing batch instead of running the handler body.
pub struct DispatchIncomingMessageStep {
    gateway: Arc<OutboundGateway>,
}

impl DispatchIncomingMessageStep {
    pub fn new(gateway: Arc<OutboundGateway>) -> Self {
        Self { gateway }
    }

    async fn dispatch_saga(
        &self,
        saga: Arc<dyn DynSaga>,
        state: SagaWorkState,
        message_context: &MessageContext,
        logical: &LogicalMessage,
        tx: &Arc<TransactionContext>,
    ) -> Result<(SagaWorkState, bool)> {
        let (mut instance, is_new) = match state {
            SagaWorkState::Loaded {
                instance, is_new, ..
            } => (instance, is_new),
            skipped => return Ok((skipped, false)),
        };

        let message_id = logical.id().map(str::to_string);

        if let (Some(id), Some(idempotency)) = (&message_id, instance.idempotency.as_ref()) {
            if idempotency.has_processed(id) {
                debug!(
                    message_id = %id,
                    saga_id = %instance.id,
                    "message already handled, replaying recorded outgoing messages"
                );
                for record in idempotency.outgoing_for(id) {
                    self.gateway
                        .transport()
                        .send(&record.destination, record.message.clone(), tx)
                        .await?;
                }
                return Ok((
                    SagaWorkState::Loaded {
                        instance,
                        is_new,
                        completed: false,
                    },
                    true,
                ));
            }
        }

        let outbox = tx.get_or_add(OUTGOING_MESSAGES_KEY, OutgoingMessages::default);
        let watermark = outbox.len();

        let completed = saga
            .invoke(&mut instance, is_new, message_context, logical)
            .await?;

        if let (Some(id), Some(idempotency)) = (message_id, instance.idempotency.as_mut()) {
            let produced = outbox
                .entries_from(watermark)
                .into_iter()
                .map(|(destination, message)| OutgoingRecord {
                    destination,
                    message,
                })
                .collect();
            idempotency.record(id, produced);
        }

        Ok((
            SagaWorkState::Loaded {
                instance,
                is_new,
                completed,
            },
            true,
        ))
    }
}

#[async_trait]
impl Step for DispatchIncomingMessageStep {
    async fn process(&self, ctx: StepContext, next: Next) -> Result<()> {
        let wire = ctx.load::<TransportMessage>(keys::TRANSPORT_MESSAGE)?;
        let logical = ctx.load::<LogicalMessage>(keys::LOGICAL_MESSAGE)?;
        let tx = ctx.load::<TransactionContext>(keys::TRANSACTION)?;
        let invokers = ctx.load::<InvokerList>(keys::HANDLER_INVOKERS)?;

        let message_context = MessageContext::new(tx.clone(), self.gateway.clone(), wire);

        enum Job {
            Plain(Arc<dyn crate::handler::Handler>),
            Saga(Arc<dyn DynSaga>, SagaWorkState),
        }

        let count = invokers.lock().len();
        let mut dispatched = 0usize;

        for index in 0..count {
            let job = {
                let mut list = invokers.lock();
                match &mut list[index] {
                    HandlerInvoker::Plain(handler) => Job::Plain(handler.clone()),
                    HandlerInvoker::Saga(work) => Job::Saga(
                        work.saga.clone(),
                        std::mem::replace(&mut work.state, SagaWorkState::Pending),
                    ),
                }
            };

            match job {
                Job::Plain(handler) => {
                    handler.invoke(&message_context, &logical).await?;
                    dispatched += 1;
                }
                Job::Saga(saga, state) => {
                    let (new_state, invoked) = self
                        .dispatch_saga(saga, state, &message_context, &logical, &tx)
                        .await?;
                    if invoked {
                        dispatched += 1;
                    }
                    if let HandlerInvoker::Saga(work) = &mut invokers.lock()[index] {
                        work.state = new_state;
                    }
                }
            }
        }

        if dispatched == 0 {
            warn!(
                message_type = logical.message_type().unwrap_or("<untyped>"),
                "message could not be correlated with any saga instance"
            );
        }
        next.invoke(ctx).await
    }
}

/// Persists saga mutations under optimistic concurrency. A conflict aborts
/// the transaction; the transport redelivers against fresh state.
pub struct SaveSagaDataStep {
    store: Option<Arc<dyn SagaStore>>,
}

impl SaveSagaDataStep {
    pub fn new(store: Option<Arc<dyn SagaStore>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Step for SaveSagaDataStep {
    async fn process(&self, ctx: StepContext, next: Next) -> Result<()> {
        let invokers = ctx.load::<InvokerList>(keys::HANDLER_INVOKERS)?;

        let jobs: Vec<(Arc<dyn DynSaga>, SagaInstance, bool, bool)> = {
            let mut list = invokers.lock();
            list.iter_mut()
                .filter_map(|invoker| match invoker {
                    HandlerInvoker::Saga(work) => match std::mem::replace(
                        &mut work.state,
                        SagaWorkState::Pending,
                    ) {
                        SagaWorkState::Loaded {
                            instance,
                            is_new,
                            completed,
                        } => Some((work.saga.clone(), instance, is_new, completed)),
                        _ => None,
                    },
                    HandlerInvoker::Plain(_) => None,
                })
                .collect()
        };

        if jobs.is_empty() {
            return next.invoke(ctx).await;
        }

        let store = self.store.as_ref().ok_or_else(|| {
            BusError::configuration("sagas are registered but no saga store is configured")
        })?;

        for (saga, instance, is_new, completed) in jobs {
            if completed && is_new {
                // Created and finished within a single message; persisting
                // it would leave a ghost row.
                debug!(saga_type = saga.saga_type(), "saga completed before first persistence");
                continue;
            }
            if completed {
                store.delete(&instance).await?;
                continue;
            }
            let correlations = saga.correlation_values(&instance.data);
            if is_new {
                store.insert(&instance, &correlations).await?;
            } else {
                store.update(&instance, &correlations).await?;
            }
        }
        next.invoke(ctx).await
    }
}

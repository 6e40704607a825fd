//! # Saga Coordination
//!
//! Correlation-based lookup, optimistic-concurrency persistence and
//! completion handling for long-running conversations.
//!
//! A saga is declared by implementing [`Saga`]: a typed data record plus a
//! correlation configuration mapping message types to properties of that
//! record. The coordinator finds (or creates) the matching [`SagaInstance`]
//! for each incoming message, invokes the handler with the typed data, and
//! makes a purely data-driven insert/update/delete decision afterwards.
//!
//! Concurrency is optimistic: every instance carries a `revision` that must
//! match on update. The loser of a race gets a concurrency conflict, the
//! transaction aborts and the transport redelivers the message against
//! fresh state.

mod idempotency;

pub use idempotency::{IdempotencyData, OutgoingRecord};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

use crate::envelope::{BusMessage, LogicalMessage};
use crate::error::{BusError, Result};
use crate::handler::MessageContext;

/// Persisted form of one saga conversation.
///
/// `data` is the user record as JSON; `revision` starts at 0 on insert and
/// increments on every successful update. `idempotency` is populated only
/// when the idempotent-saga layer is enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaInstance {
    pub id: Uuid,
    pub saga_type: String,
    pub revision: u64,
    pub data: Value,
    pub idempotency: Option<IdempotencyData>,
}

impl SagaInstance {
    /// A fresh, never-persisted instance at revision 0.
    pub fn fresh(saga_type: impl Into<String>, data: Value, idempotent: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            saga_type: saga_type.into(),
            revision: 0,
            data,
            idempotency: idempotent.then(IdempotencyData::default),
        }
    }
}

/// A correlation property value extracted from saga data, used to index the
/// instance for [`SagaStore::find`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationValue {
    pub property: String,
    pub value: String,
}

/// Storage contract for saga instances.
///
/// Implementations must enforce optimistic concurrency:
/// * `insert` fails with [`BusError::ConcurrencyConflict`] when any
///   `(correlation property, value)` pair collides with an existing saga of
///   the same type;
/// * `update` fails the same way when the stored `(id, revision)` does not
///   match, and bumps the revision by one on success.
#[async_trait]
pub trait SagaStore: Send + Sync + 'static {
    /// Look up the saga of `saga_type` whose `property` equals `value`.
    async fn find(
        &self,
        saga_type: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<SagaInstance>>;

    /// Persist a new instance together with its correlation index entries.
    async fn insert(
        &self,
        instance: &SagaInstance,
        correlations: &[CorrelationValue],
    ) -> Result<()>;

    /// Persist a mutated instance; the revision check guards lost updates.
    async fn update(
        &self,
        instance: &SagaInstance,
        correlations: &[CorrelationValue],
    ) -> Result<()>;

    /// Remove the instance and its index entries.
    async fn delete(&self, instance: &SagaInstance) -> Result<()>;
}

/// Context handed to a saga handler for one message.
pub struct SagaContext<'a, D> {
    /// The typed saga data. Mutations are persisted after the handler
    /// returns (unless the saga was marked complete).
    pub data: D,
    bus: &'a MessageContext,
    id: Uuid,
    revision: u64,
    is_new: bool,
    completed: bool,
}

impl<'a, D> SagaContext<'a, D> {
    /// Bus operations scoped to the current message's transaction.
    pub fn bus(&self) -> &MessageContext {
        self.bus
    }

    /// The saga instance id, stable across the whole conversation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Persistence revision of the loaded data.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether this message initiated the conversation.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// End the conversation. The instance is deleted on save; a saga that
    /// is new and immediately complete is never persisted at all.
    pub fn mark_as_complete(&mut self) {
        self.completed = true;
    }
}

/// A long-running correlated conversation.
#[async_trait]
pub trait Saga: Send + Sync + 'static {
    /// The persisted state record.
    type Data: Default + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Stable type name used as the storage partition key.
    fn saga_type() -> &'static str
    where
        Self: Sized;

    /// Declare which message types reach this saga and how they correlate.
    fn correlations(config: &mut CorrelationConfig<Self::Data>)
    where
        Self: Sized;

    /// Handle one correlated message.
    async fn handle(
        &self,
        ctx: &mut SagaContext<'_, Self::Data>,
        message: &LogicalMessage,
    ) -> Result<()>;
}

/// One registered correlation: for `message_type`, extract a value from the
/// message and match it against `property` of the saga data.
pub struct CorrelationEntry {
    message_type: String,
    property: String,
    initiating: bool,
    extract: Arc<dyn Fn(&LogicalMessage) -> Option<String> + Send + Sync>,
}

impl CorrelationEntry {
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    /// Whether messages of this type may create a fresh saga.
    pub fn is_initiating(&self) -> bool {
        self.initiating
    }

    /// Compute the correlation value from an incoming message. `None` when
    /// the body does not decode as the registered message type.
    pub fn extract(&self, message: &LogicalMessage) -> Option<String> {
        (self.extract)(message)
    }
}

impl std::fmt::Debug for CorrelationEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEntry")
            .field("message_type", &self.message_type)
            .field("property", &self.property)
            .field("initiating", &self.initiating)
            .finish()
    }
}

/// Collects the correlation declarations of one saga type.
pub struct CorrelationConfig<D> {
    entries: Vec<CorrelationEntry>,
    _data: PhantomData<fn(D)>,
}

impl<D> CorrelationConfig<D> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            _data: PhantomData,
        }
    }

    /// Messages of type `M` may start the conversation; `property` names
    /// the saga-data field the extracted value is stored under.
    pub fn initiated_by<M: BusMessage>(
        &mut self,
        property: impl Into<String>,
        extract: impl Fn(&M) -> String + Send + Sync + 'static,
    ) -> &mut Self {
        self.add::<M>(property.into(), extract, true)
    }

    /// Messages of type `M` continue an existing conversation only.
    pub fn correlated_by<M: BusMessage>(
        &mut self,
        property: impl Into<String>,
        extract: impl Fn(&M) -> String + Send + Sync + 'static,
    ) -> &mut Self {
        self.add::<M>(property.into(), extract, false)
    }

    fn add<M: BusMessage>(
        &mut self,
        property: String,
        extract: impl Fn(&M) -> String + Send + Sync + 'static,
        initiating: bool,
    ) -> &mut Self {
        self.entries.push(CorrelationEntry {
            message_type: M::message_type().to_string(),
            property,
            initiating,
            extract: Arc::new(move |logical: &LogicalMessage| {
                logical.decode::<M>().ok().map(|m| extract(&m))
            }),
        });
        self
    }

    pub(crate) fn into_entries(self) -> Vec<CorrelationEntry> {
        self.entries
    }
}

/// Type-erased saga registration used by the pipeline steps.
#[async_trait]
pub trait DynSaga: Send + Sync + 'static {
    fn saga_type(&self) -> &str;

    fn entries(&self) -> &[CorrelationEntry];

    /// Correlation entries applying to one incoming message type.
    fn entries_for(&self, message_type: &str) -> Vec<&CorrelationEntry> {
        self.entries()
            .iter()
            .filter(|e| e.message_type() == message_type)
            .collect()
    }

    fn handles(&self, message_type: &str) -> bool {
        self.entries()
            .iter()
            .any(|e| e.message_type() == message_type)
    }

    fn initiates(&self, message_type: &str) -> bool {
        self.entries()
            .iter()
            .any(|e| e.message_type() == message_type && e.is_initiating())
    }

    /// Default-constructed saga data as JSON.
    fn new_data(&self) -> Result<Value>;

    /// Correlation index values computed from the data record, one per
    /// registered property.
    fn correlation_values(&self, data: &Value) -> Vec<CorrelationValue>;

    /// Invoke the user handler against `instance`, mutating its data in
    /// place. Returns true when the handler marked the saga complete.
    async fn invoke(
        &self,
        instance: &mut SagaInstance,
        is_new: bool,
        bus: &MessageContext,
        message: &LogicalMessage,
    ) -> Result<bool>;
}

/// Bridges a typed [`Saga`] implementation into [`DynSaga`].
pub struct SagaHost<S: Saga> {
    saga: S,
    saga_type: &'static str,
    entries: Vec<CorrelationEntry>,
}

impl<S: Saga> SagaHost<S> {
    pub fn new(saga: S) -> Self {
        let mut config = CorrelationConfig::new();
        S::correlations(&mut config);
        Self {
            saga,
            saga_type: S::saga_type(),
            entries: config.into_entries(),
        }
    }
}

#[async_trait]
impl<S: Saga> DynSaga for SagaHost<S> {
    fn saga_type(&self) -> &str {
        self.saga_type
    }

    fn entries(&self) -> &[CorrelationEntry] {
        &self.entries
    }

    fn new_data(&self) -> Result<Value> {
        serde_json::to_value(S::Data::default()).map_err(Into::into)
    }

    fn correlation_values(&self, data: &Value) -> Vec<CorrelationValue> {
        let mut properties: Vec<&str> = self.entries.iter().map(|e| e.property()).collect();
        properties.sort_unstable();
        properties.dedup();
        properties
            .into_iter()
            .filter_map(|property| {
                data_property(data, property).map(|value| CorrelationValue {
                    property: property.to_string(),
                    value,
                })
            })
            .collect()
    }

    async fn invoke(
        &self,
        instance: &mut SagaInstance,
        is_new: bool,
        bus: &MessageContext,
        message: &LogicalMessage,
    ) -> Result<bool> {
        let data: S::Data = serde_json::from_value(instance.data.clone()).map_err(|e| {
            BusError::store(format!(
                "saga data of {} does not deserialize: {e}",
                self.saga_type
            ))
        })?;

        let mut ctx = SagaContext {
            data,
            bus,
            id: instance.id,
            revision: instance.revision,
            is_new,
            completed: false,
        };
        self.saga.handle(&mut ctx, message).await?;

        instance.data = serde_json::to_value(&ctx.data)?;
        Ok(ctx.completed)
    }
}

/// Read a (possibly nested, dot-separated) property off a JSON data record
/// as its string form. Scalars only; objects and arrays do not correlate.
pub(crate) fn data_property(data: &Value, path: &str) -> Option<String> {
    let mut current = data;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Write a correlation value into a fresh data record so the instance is
/// findable by the very property that initiated it. The extracted value
/// arrives as a string; the default-constructed field tells us the type to
/// coerce back to.
pub(crate) fn set_data_property(data: &mut Value, path: &str, raw: &str) {
    let mut current = data;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            let Value::Object(map) = current else { return };
            let coerced = match map.get(segment) {
                Some(Value::Number(_)) => raw
                    .parse::<i64>()
                    .map(Value::from)
                    .or_else(|_| raw.parse::<f64>().map(Value::from))
                    .unwrap_or_else(|_| Value::String(raw.to_string())),
                Some(Value::Bool(_)) => raw
                    .parse::<bool>()
                    .map(Value::from)
                    .unwrap_or_else(|_| Value::String(raw.to_string())),
                _ => Value::String(raw.to_string()),
            };
            map.insert(segment.to_string(), coerced);
            return;
        }
        match current.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
}

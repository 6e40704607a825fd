//! # Pipeline Engine
//!
//! Ordered, composable steps over a shared step context. Each step performs
//! work, optionally calls the `next` continuation, then optionally performs
//! post-work (middleware pattern). Two pipelines exist: incoming and
//! outgoing; both are built from the same [`Step`] trait.
//!
//! Steps must not hide errors from `next`: propagating an error up the stack
//! is what aborts the transaction.

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{BusError, Result};

/// Well-known step context keys.
pub mod keys {
    /// `Arc<TransportMessage>` — the wire message being processed.
    pub const TRANSPORT_MESSAGE: &str = "transport-message";
    /// `Arc<LogicalMessage>` — set by the deserialize step.
    pub const LOGICAL_MESSAGE: &str = "logical-message";
    /// `Arc<TransactionContext>` — the ambient unit of work.
    pub const TRANSACTION: &str = "transaction-context";
    /// `Arc<Vec<HandlerInvoker>>` — set by the activate-handlers step.
    pub const HANDLER_INVOKERS: &str = "handler-invokers";
    /// `Arc<Vec<String>>` — destinations for the outgoing message.
    pub const DESTINATIONS: &str = "destination-addresses";
    /// `Arc<Headers>` — headers of the incoming message that produced this
    /// outgoing message, used for correlation flow-through.
    pub const INCOMING_HEADERS: &str = "incoming-headers";
    /// `Arc<Mutex<LogicalMessage>>` — the outgoing message under construction.
    pub const OUTGOING_MESSAGE: &str = "outgoing-logical-message";
    /// `Arc<TransportMessage>` — the serialized outgoing message.
    pub const OUTGOING_TRANSPORT_MESSAGE: &str = "outgoing-transport-message";
}

/// Keyed item bag shared by every step of one pipeline run.
#[derive(Clone, Default)]
pub struct StepContext {
    items: Arc<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>>,
}

impl StepContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&self, key: &str, value: T) {
        self.items
            .lock()
            .insert(key.to_string(), Arc::new(value) as Arc<dyn Any + Send + Sync>);
    }

    pub fn insert_arc<T: Send + Sync + 'static>(&self, key: &str, value: Arc<T>) {
        self.items
            .lock()
            .insert(key.to_string(), value as Arc<dyn Any + Send + Sync>);
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.items.lock().get(key).cloned()?.downcast::<T>().ok()
    }

    /// Like [`get`](Self::get) but a missing item is a pipeline defect.
    pub fn load<T: Send + Sync + 'static>(&self, key: &str) -> Result<Arc<T>> {
        self.get(key)
            .ok_or_else(|| BusError::handler(format!("step context is missing item {key:?}")))
    }
}

/// One stage of a pipeline.
#[async_trait]
pub trait Step: Send + Sync + 'static {
    /// Process the context, calling `next.invoke(ctx)` to continue down the
    /// pipeline. Not calling `next` short-circuits the remaining steps.
    async fn process(&self, ctx: StepContext, next: Next) -> Result<()>;
}

/// Continuation over the remaining steps of a pipeline.
pub struct Next {
    steps: Arc<[Arc<dyn Step>]>,
    index: usize,
}

impl Next {
    /// Run the rest of the pipeline.
    pub fn invoke(self, ctx: StepContext) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            match self.steps.get(self.index) {
                Some(step) => {
                    let step = step.clone();
                    let next = Next {
                        steps: self.steps,
                        index: self.index + 1,
                    };
                    step.process(ctx, next).await
                }
                None => Ok(()),
            }
        })
    }
}

/// An ordered list of steps.
#[derive(Clone)]
pub struct Pipeline {
    steps: Arc<[Arc<dyn Step>]>,
}

impl Pipeline {
    pub fn new(steps: Vec<Arc<dyn Step>>) -> Self {
        Self {
            steps: steps.into(),
        }
    }

    /// Run every step against `ctx` in order.
    pub async fn process(&self, ctx: StepContext) -> Result<()> {
        Next {
            steps: self.steps.clone(),
            index: 0,
        }
        .invoke(ctx)
        .await
    }
}

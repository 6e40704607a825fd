//! # Bus Façade
//!
//! The user-facing handle: registration of handlers and sagas at build
//! time, send/publish/defer/subscribe operations, and the start/stop
//! lifecycle that owns the worker pool and the deferred-message poller.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::BusConfig;
use crate::bottleneck::Bottleneck;
use crate::envelope::{BusMessage, Headers, LogicalMessage};
use crate::error::{BusError, Result};
use crate::handler::{HandlerRegistry, MessageContext, OutboundGateway};
use crate::pipeline::Pipeline;
use crate::router::Router;
use crate::saga::{Saga, SagaHost, SagaStore};
use crate::serializer::{JsonSerializer, Serializer};
use crate::steps::{
    ActivateHandlersStep, AssignDefaultHeadersStep, AutoCorrelateStep, DeserializeStep,
    DispatchIncomingMessageStep, HandleDeferredMessagesStep, LoadSagaDataStep, SaveSagaDataStep,
    SendOutgoingMessageStep, SerializeStep,
};
use crate::subscriptions::SubscriptionStore;
use crate::timeouts::{TimeoutPoller, TimeoutStore};
use crate::transaction::TransactionContext;
use crate::transport::Transport;
use crate::worker::{spawn_worker, WorkerContext};

/// Configures and builds a [`Bus`].
pub struct BusBuilder {
    transport: Option<Arc<dyn Transport>>,
    serializer: Arc<dyn Serializer>,
    router: Option<Arc<dyn Router>>,
    saga_store: Option<Arc<dyn SagaStore>>,
    subscription_store: Option<Arc<dyn SubscriptionStore>>,
    timeout_store: Option<Arc<dyn TimeoutStore>>,
    registry: HandlerRegistry,
    config: BusConfig,
}

impl BusBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            serializer: Arc::new(JsonSerializer::new()),
            router: None,
            saga_store: None,
            subscription_store: None,
            timeout_store: None,
            registry: HandlerRegistry::new(),
            config: BusConfig::default(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_saga_store(mut self, store: Arc<dyn SagaStore>) -> Self {
        self.saga_store = Some(store);
        self
    }

    pub fn with_subscription_store(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.subscription_store = Some(store);
        self
    }

    pub fn with_timeout_store(mut self, store: Arc<dyn TimeoutStore>) -> Self {
        self.timeout_store = Some(store);
        self
    }

    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an async handler for messages of type `M`.
    pub fn handle<M, F, Fut>(mut self, handler: F) -> Self
    where
        M: BusMessage,
        F: Fn(MessageContext, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.registry.register::<M, F, Fut>(handler);
        self
    }

    /// Register a handler for messages arriving without a type tag.
    pub fn handle_untyped<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(MessageContext, LogicalMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.registry.register_fallback(handler);
        self
    }

    /// Register a saga.
    pub fn with_saga<S: Saga>(mut self, saga: S) -> Self {
        self.registry.register_saga(Arc::new(SagaHost::new(saga)));
        self
    }

    /// Assemble the bus. Fails on structural problems (no transport, sagas
    /// without a saga store); option validation happens at `start`.
    pub fn build(self) -> Result<Bus> {
        let transport = self
            .transport
            .ok_or_else(|| BusError::configuration("a transport is required"))?;
        let router = self
            .router
            .ok_or_else(|| BusError::configuration("a router is required"))?;
        if self.registry.has_sagas() && self.saga_store.is_none() {
            return Err(BusError::configuration(
                "sagas are registered but no saga store is configured",
            ));
        }

        let registry = Arc::new(self.registry);
        let return_address = self
            .config
            .default_return_address
            .clone()
            .or_else(|| transport.address().map(str::to_string));

        let outgoing = Pipeline::new(vec![
            Arc::new(AssignDefaultHeadersStep::new(return_address)),
            Arc::new(AutoCorrelateStep),
            Arc::new(SerializeStep::new(self.serializer.clone())),
            Arc::new(SendOutgoingMessageStep::new(transport.clone())),
        ]);
        let gateway = Arc::new(OutboundGateway::new(
            outgoing,
            router.clone(),
            transport.clone(),
        ));

        let incoming = Pipeline::new(vec![
            Arc::new(DeserializeStep::new(self.serializer.clone())),
            Arc::new(HandleDeferredMessagesStep::new(self.timeout_store.clone())),
            Arc::new(ActivateHandlersStep::new(registry.clone())),
            Arc::new(LoadSagaDataStep::new(
                self.saga_store.clone(),
                self.config.enable_idempotent_sagas,
            )),
            Arc::new(DispatchIncomingMessageStep::new(gateway.clone())),
            Arc::new(SaveSagaDataStep::new(self.saga_store.clone())),
        ]);

        Ok(Bus {
            inner: Arc::new(BusInner {
                transport,
                gateway,
                incoming,
                subscription_store: self.subscription_store,
                timeout_store: self.timeout_store,
                config: self.config,
            }),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            tasks: Mutex::new(RunningTasks::default()),
        })
    }
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct BusInner {
    transport: Arc<dyn Transport>,
    gateway: Arc<OutboundGateway>,
    incoming: Pipeline,
    subscription_store: Option<Arc<dyn SubscriptionStore>>,
    timeout_store: Option<Arc<dyn TimeoutStore>>,
    config: BusConfig,
}

#[derive(Default)]
struct RunningTasks {
    workers: Vec<JoinHandle<()>>,
    poller: Option<TimeoutPoller>,
}

/// A started or startable bus endpoint.
pub struct Bus {
    inner: Arc<BusInner>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    tasks: Mutex<RunningTasks>,
}

impl Bus {
    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    /// Validate the configuration, create the input and error queues, and
    /// spawn the workers plus (when a timeout store is configured) the
    /// deferred-message poller.
    pub async fn start(&self) -> Result<()> {
        let config = &self.inner.config;
        config.validate()?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(address) = self.inner.transport.address() {
            self.inner.transport.create_queue(address).await?;
        }
        self.inner
            .transport
            .create_queue(&config.error_queue_address)
            .await?;

        let worker_ctx = Arc::new(WorkerContext {
            transport: self.inner.transport.clone(),
            pipeline: self.inner.incoming.clone(),
            parallelism: Bottleneck::new(config.max_parallelism),
            receive_gate: Bottleneck::new(config.receive_concurrency),
            running: self.running.clone(),
            shutdown: self.shutdown.clone(),
            error_queue_address: config.error_queue_address.clone(),
        });

        let mut tasks = self.tasks.lock();
        for n in 0..config.number_of_workers {
            tasks
                .workers
                .push(spawn_worker(format!("worker-{n}"), worker_ctx.clone()));
        }
        if let Some(store) = &self.inner.timeout_store {
            tasks.poller = Some(TimeoutPoller::spawn(
                store.clone(),
                self.inner.transport.clone(),
                config.due_poll_interval,
                config
                    .default_return_address
                    .clone()
                    .or_else(|| self.inner.transport.address().map(str::to_string)),
            ));
        }

        info!(
            workers = config.number_of_workers,
            max_parallelism = config.max_parallelism,
            "bus started"
        );
        Ok(())
    }

    /// Graceful shutdown: workers finish their in-flight message, then
    /// exit. Workers still busy after the grace period are abandoned; their
    /// peek locks are released by the transport.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();

        let (workers, poller) = {
            let mut tasks = self.tasks.lock();
            (
                std::mem::take(&mut tasks.workers),
                tasks.poller.take(),
            )
        };

        let grace = self.inner.config.shutdown_grace;
        for worker in workers {
            if tokio::time::timeout(grace, worker).await.is_err() {
                warn!("worker did not stop within the grace period, abandoning");
            }
        }
        if let Some(poller) = poller {
            poller.stop().await;
        }
        info!("bus stopped");
    }

    /// Route a message point-to-point via the router's type map.
    pub async fn send<M: BusMessage>(&self, message: &M) -> Result<()> {
        self.one_shot(|tx| async move {
            self.inner.gateway.send(&tx, None, message).await
        })
        .await
    }

    /// Send a message to an explicit queue address.
    pub async fn send_to<M: BusMessage>(&self, destination: &str, message: &M) -> Result<()> {
        self.one_shot(|tx| async move {
            self.inner
                .gateway
                .send_to(&tx, None, destination, message)
                .await
        })
        .await
    }

    /// Send a message to this endpoint's own input queue.
    pub async fn send_local<M: BusMessage>(&self, message: &M) -> Result<()> {
        let address = self
            .inner
            .transport
            .address()
            .ok_or_else(|| BusError::configuration("send-only endpoints cannot send_local"))?
            .to_string();
        self.send_to(&address, message).await
    }

    /// Publish to every subscriber of the message type's topic.
    pub async fn publish<M: BusMessage>(&self, message: &M) -> Result<()> {
        self.one_shot(|tx| async move {
            self.inner.gateway.publish(&tx, None, message).await
        })
        .await
    }

    /// Defer a message for `delay` before it is delivered to its routed
    /// destination. Requires a timeout store somewhere in the topology.
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
        self.one_shot(|tx| {
            let extra_headers = extra_headers.clone();
            async move {
                self.inner
                    .gateway
                    .defer(&tx, None, delay, extra_headers, message)
                    .await
            }
        })
        .await
    }

    /// Subscribe this endpoint to the topic of `M`. With centralized
    /// subscription storage the broker handles fan-out; either way the
    /// registration is idempotent.
    pub async fn subscribe<M: BusMessage>(&self) -> Result<()> {
        let store = self.subscription_store()?;
        let address = self.own_address_for_subscription()?;
        store.register_subscriber(M::message_type(), &address).await
    }

    /// Remove this endpoint's subscription to the topic of `M`.
    pub async fn unsubscribe<M: BusMessage>(&self) -> Result<()> {
        let store = self.subscription_store()?;
        let address = self.own_address_for_subscription()?;
        store
            .unregister_subscriber(M::message_type(), &address)
            .await
    }

    fn subscription_store(&self) -> Result<&Arc<dyn SubscriptionStore>> {
        self.inner.subscription_store.as_ref().ok_or_else(|| {
            BusError::configuration("subscribe requires a subscription store")
        })
    }

    fn own_address_for_subscription(&self) -> Result<String> {
        self.inner
            .transport
            .address()
            .map(str::to_string)
            .ok_or_else(|| {
                BusError::configuration("a send-only endpoint cannot subscribe to topics")
            })
    }

    /// Run one bus operation inside its own transaction: commit on success,
    /// abort on failure, dispose always.
    async fn one_shot<'a, F, Fut>(&'a self, operation: F) -> Result<()>
    where
        F: FnOnce(Arc<TransactionContext>) -> Fut,
        Fut: Future<Output = Result<()>> + 'a,
    {
        let tx = Arc::new(TransactionContext::new());
        let outcome = operation(tx.clone()).await;
        let result = match outcome {
            Ok(()) => tx.commit().await,
            Err(err) => {
                let _ = tx.abort().await;
                Err(err)
            }
        };
        tx.dispose().await;
        result
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        // Tasks hold Arcs into the bus internals; aborting here keeps a
        // dropped-but-never-stopped bus from leaking its workers.
        let tasks = self.tasks.lock();
        for worker in &tasks.workers {
            worker.abort();
        }
    }
}

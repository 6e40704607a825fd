//! Optimistic concurrency under parallel workers: conflicting updates
//! abort and redeliver, and every successful update gets its own revision.

mod common;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use ferrobus_core::{
    Bus, BusConfig, BusMessage, CorrelationConfig, LogicalMessage, Result, Saga, SagaContext,
    TypeBasedRouter,
};
use ferrobus_memory::{InMemNetwork, InMemSagaStore, InMemTransport};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tick {
    stream: String,
}

impl BusMessage for Tick {
    fn message_type() -> &'static str {
        "Tick"
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TickData {
    stream: String,
    applied: u64,
}

struct TickSaga;

#[async_trait]
impl Saga for TickSaga {
    type Data = TickData;

    fn saga_type() -> &'static str {
        "TickSaga"
    }

    fn correlations(config: &mut CorrelationConfig<Self::Data>) {
        config.initiated_by::<Tick>("stream", |m| m.stream.clone());
    }

    async fn handle(
        &self,
        ctx: &mut SagaContext<'_, Self::Data>,
        _message: &LogicalMessage,
    ) -> Result<()> {
        ctx.data.applied += 1;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_serialize_through_occ() {
    common::init_tracing();
    const MESSAGES: u64 = 20;

    // Contention produces aborts and redeliveries; a generous delivery
    // budget keeps losers out of the dead-letter queue.
    let network = InMemNetwork::with_max_deliveries(100);
    let store = InMemSagaStore::new();

    let bus = Bus::builder()
        .with_transport(Arc::new(InMemTransport::new(network.clone(), "ticks")))
        .with_router(Arc::new(TypeBasedRouter::new().map("Tick", "ticks")))
        .with_saga_store(Arc::new(store.clone()))
        .with_saga(TickSaga)
        .with_config(
            BusConfig::new()
                .with_number_of_workers(4)
                .with_max_parallelism(4)
                .with_shutdown_grace(Duration::from_secs(2)),
        )
        .build()
        .unwrap();
    bus.start().await.unwrap();

    for _ in 0..MESSAGES {
        bus.send(&Tick {
            stream: "s1".into(),
        })
        .await
        .unwrap();
    }

    assert!(
        common::wait_until(Duration::from_secs(15), || {
            store
                .all_of_type("TickSaga")
                .first()
                .map(|instance| instance.data["applied"] == MESSAGES)
                .unwrap_or(false)
        })
        .await,
        "saga never converged: {:?}",
        store.all_of_type("TickSaga")
    );

    let sagas = store.all_of_type("TickSaga");
    assert_eq!(sagas.len(), 1, "all messages correlate with one instance");

    // One insert plus one successful update per remaining message: the
    // revision counts exactly the successful updates.
    assert_eq!(sagas[0].revision, MESSAGES - 1);
    assert_eq!(network.queue_len("ticks"), 0);

    bus.stop().await;
}

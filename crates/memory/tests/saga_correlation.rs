//! One saga instance is reachable through several correlation properties.

mod common;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use ferrobus_core::{
    Bus, BusMessage, CorrelationConfig, LogicalMessage, Result, Saga, SagaContext,
    TypeBasedRouter,
};
use ferrobus_memory::{InMemNetwork, InMemSagaStore, InMemTransport};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Initiate {
    guid: String,
    int: u32,
    string: String,
}

impl BusMessage for Initiate {
    fn message_type() -> &'static str {
        "Initiate"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CorrelateByInt {
    int: u32,
}

impl BusMessage for CorrelateByInt {
    fn message_type() -> &'static str {
        "CorrelateByInt"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CorrelateByString {
    string: String,
}

impl BusMessage for CorrelateByString {
    fn message_type() -> &'static str {
        "CorrelateByString"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CorrelateByGuid {
    guid: String,
}

impl BusMessage for CorrelateByGuid {
    fn message_type() -> &'static str {
        "CorrelateByGuid"
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MultiData {
    guid: String,
    int: u32,
    string: String,
}

struct MultiCorrelationSaga {
    events: Arc<Mutex<Vec<(String, Uuid)>>>,
}

#[async_trait]
impl Saga for MultiCorrelationSaga {
    type Data = MultiData;

    fn saga_type() -> &'static str {
        "MultiCorrelationSaga"
    }

    fn correlations(config: &mut CorrelationConfig<Self::Data>) {
        config.initiated_by::<Initiate>("guid", |m| m.guid.clone());
        config.correlated_by::<Initiate>("int", |m| m.int.to_string());
        config.correlated_by::<Initiate>("string", |m| m.string.clone());
        config.correlated_by::<CorrelateByInt>("int", |m| m.int.to_string());
        config.correlated_by::<CorrelateByString>("string", |m| m.string.clone());
        config.correlated_by::<CorrelateByGuid>("guid", |m| m.guid.clone());
    }

    async fn handle(
        &self,
        ctx: &mut SagaContext<'_, Self::Data>,
        message: &LogicalMessage,
    ) -> Result<()> {
        match message.message_type() {
            Some("Initiate") => {
                let initiate: Initiate = message.decode()?;
                self.events.lock().push(("initiated!".into(), ctx.id()));
                ctx.bus()
                    .send(&CorrelateByInt { int: initiate.int })
                    .await?;
                ctx.bus()
                    .send(&CorrelateByString {
                        string: initiate.string.clone(),
                    })
                    .await?;
                ctx.bus()
                    .send(&CorrelateByGuid {
                        guid: initiate.guid.clone(),
                    })
                    .await?;
            }
            Some("CorrelateByInt") => self.events.lock().push(("int!".into(), ctx.id())),
            Some("CorrelateByString") => self.events.lock().push(("string!".into(), ctx.id())),
            Some("CorrelateByGuid") => self.events.lock().push(("guid!".into(), ctx.id())),
            other => panic!("unexpected message type {other:?}"),
        }
        Ok(())
    }
}

#[tokio::test]
async fn one_instance_handles_every_correlation_property() {
    common::init_tracing();
    let network = InMemNetwork::new();
    let store = InMemSagaStore::new();
    let events = Arc::new(Mutex::new(Vec::new()));

    let bus = Bus::builder()
        .with_transport(Arc::new(InMemTransport::new(network.clone(), "multi")))
        .with_router(Arc::new(TypeBasedRouter::new().with_fallback("multi")))
        .with_saga_store(Arc::new(store.clone()))
        .with_saga(MultiCorrelationSaga {
            events: events.clone(),
        })
        .with_config(common::serial_config())
        .build()
        .unwrap();
    bus.start().await.unwrap();

    bus.send(&Initiate {
        guid: "baa06058-0b1b-4ea2-8261-9098e022bf1f".into(),
        int: 23,
        string: "hej".into(),
    })
    .await
    .unwrap();

    assert!(
        common::wait_until(Duration::from_secs(5), || events.lock().len() == 4).await,
        "expected four events, got {:?}",
        *events.lock()
    );

    let recorded = events.lock().clone();
    let labels: Vec<&str> = recorded.iter().map(|(label, _)| label.as_str()).collect();
    assert_eq!(labels, vec!["initiated!", "int!", "string!", "guid!"]);

    // Every event came from the very same saga instance.
    let first_id = recorded[0].1;
    assert!(recorded.iter().all(|(_, id)| *id == first_id));
    assert_eq!(store.all_of_type("MultiCorrelationSaga").len(), 1);

    bus.stop().await;
}

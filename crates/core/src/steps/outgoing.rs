//! Steps of the outgoing pipeline.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

use crate::envelope::{headers, Headers, LogicalMessage, TransportMessage};
use crate::error::Result;
use crate::pipeline::{keys, Next, Step, StepContext};
use crate::serializer::Serializer;
use crate::transaction::TransactionContext;
use crate::transport::Transport;

/// Stamps the headers every outgoing message must carry: a fresh message
/// id, the sent time, a return address and a point-to-point intent unless
/// the caller already set one.
pub struct AssignDefaultHeadersStep {
    return_address: Option<String>,
}

impl AssignDefaultHeadersStep {
    /// `return_address` is the configured default, falling back to the
    /// transport's own address; `None` for send-only endpoints without an
    /// explicit configuration.
    pub fn new(return_address: Option<String>) -> Self {
        Self { return_address }
    }
}

#[async_trait]
impl Step for AssignDefaultHeadersStep {
    async fn process(&self, ctx: StepContext, next: Next) -> Result<()> {
        let outgoing = ctx.load::<Mutex<LogicalMessage>>(keys::OUTGOING_MESSAGE)?;
        {
            let mut message = outgoing.lock();
            message
                .headers
                .entry(headers::MESSAGE_ID.to_string())
                .or_insert_with(|| Uuid::new_v4().to_string());
            message
                .headers
                .entry(headers::SENT_TIME.to_string())
                .or_insert_with(|| Utc::now().to_rfc3339());
            message
                .headers
                .entry(headers::INTENT.to_string())
                .or_insert_with(|| headers::intent::POINT_TO_POINT.to_string());
            if let Some(return_address) = &self.return_address {
                message
                    .headers
                    .entry(headers::RETURN_ADDRESS.to_string())
                    .or_insert_with(|| return_address.clone());
            }
        }
        next.invoke(ctx).await
    }
}

/// Copies the incoming correlation id onto the outbound message so a whole
/// conversation shares one `rbs2-corr-id`. A message sent outside any
/// handler correlates with itself.
pub struct AutoCorrelateStep;

#[async_trait]
impl Step for AutoCorrelateStep {
    async fn process(&self, ctx: StepContext, next: Next) -> Result<()> {
        let outgoing = ctx.load::<Mutex<LogicalMessage>>(keys::OUTGOING_MESSAGE)?;
        let incoming = ctx.get::<Headers>(keys::INCOMING_HEADERS);
        {
            let mut message = outgoing.lock();
            if !message.headers.contains_key(headers::CORRELATION_ID) {
                let correlation_id = incoming
                    .as_ref()
                    .and_then(|h| {
                        h.get(headers::CORRELATION_ID)
                            .or_else(|| h.get(headers::MESSAGE_ID))
                    })
                    .cloned()
                    .or_else(|| message.headers.get(headers::MESSAGE_ID).cloned());
                if let Some(correlation_id) = correlation_id {
                    message
                        .headers
                        .insert(headers::CORRELATION_ID.to_string(), correlation_id);
                }
            }
        }
        next.invoke(ctx).await
    }
}

/// Encodes the logical message into its wire form.
pub struct SerializeStep {
    serializer: Arc<dyn Serializer>,
}

impl SerializeStep {
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self { serializer }
    }
}

#[async_trait]
impl Step for SerializeStep {
    async fn process(&self, ctx: StepContext, next: Next) -> Result<()> {
        let outgoing = ctx.load::<Mutex<LogicalMessage>>(keys::OUTGOING_MESSAGE)?;
        let snapshot = outgoing.lock().clone();
        let wire = self.serializer.serialize(&snapshot).await?;
        ctx.insert(keys::OUTGOING_TRANSPORT_MESSAGE, wire);
        next.invoke(ctx).await
    }
}

/// Hands the wire message to the transport for every destination. The
/// transport buffers on the transaction; actual I/O happens at commit.
pub struct SendOutgoingMessageStep {
    transport: Arc<dyn Transport>,
}

impl SendOutgoingMessageStep {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Step for SendOutgoingMessageStep {
    async fn process(&self, ctx: StepContext, next: Next) -> Result<()> {
        let wire = ctx.load::<TransportMessage>(keys::OUTGOING_TRANSPORT_MESSAGE)?;
        let destinations = ctx.load::<Vec<String>>(keys::DESTINATIONS)?;
        let tx = ctx.load::<TransactionContext>(keys::TRANSACTION)?;

        for destination in destinations.iter() {
            self.transport
                .send(destination, (*wire).clone(), &tx)
                .await?;
        }
        next.invoke(ctx).await
    }
}

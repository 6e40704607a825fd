//! # Serializer
//!
//! Contract for the message ↔ transport-message round-trip, plus the JSON
//! reference implementation. The serializer owns the `rbs2-content-type`
//! header; the logical type tag travels in `rbs2-msg-type` and is written by
//! the outgoing pipeline.
//!
//! A wire message whose content type is unknown fails with a non-retriable
//! error and is dead-lettered. A message without a type tag is delivered as
//! an untyped JSON body and dispatched to the fallback handlers.

use async_trait::async_trait;

use crate::envelope::{headers, LogicalMessage, TransportMessage};
use crate::error::{BusError, Result};

/// Content type written by [`JsonSerializer`].
pub const JSON_CONTENT_TYPE: &str = "application/json;charset=utf-8";

/// Message ↔ transport-message round-trip contract.
///
/// Round-trip invariant: `deserialize(serialize(m))` yields `m`'s body
/// unchanged with a header superset of `m`'s headers.
#[async_trait]
pub trait Serializer: Send + Sync + 'static {
    /// Encode a logical message body and stamp `rbs2-content-type`.
    async fn serialize(&self, message: &LogicalMessage) -> Result<TransportMessage>;

    /// Decode a wire body. Fails with a non-retriable error when the content
    /// type is not one this serializer understands.
    async fn deserialize(&self, message: &TransportMessage) -> Result<LogicalMessage>;
}

/// JSON serializer over `serde_json`. Human-readable and sufficient for
/// every reference transport; binary codecs plug in through [`Serializer`].
#[derive(Debug, Default, Clone)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Serializer for JsonSerializer {
    async fn serialize(&self, message: &LogicalMessage) -> Result<TransportMessage> {
        let body = serde_json::to_vec(&message.body)?;
        let mut headers = message.headers.clone();
        headers.insert(headers::CONTENT_TYPE.to_string(), JSON_CONTENT_TYPE.to_string());
        Ok(TransportMessage::new(headers, body))
    }

    async fn deserialize(&self, message: &TransportMessage) -> Result<LogicalMessage> {
        match message.header(headers::CONTENT_TYPE) {
            Some(content_type) if content_type.starts_with("application/json") => {}
            Some(other) => return Err(BusError::UnsupportedContentType(other.to_string())),
            None => return Err(BusError::UnsupportedContentType("<none>".to_string())),
        }

        let body = serde_json::from_slice(&message.body)?;
        Ok(LogicalMessage::new(message.headers.clone(), body))
    }
}

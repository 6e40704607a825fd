//! # Message Envelopes
//!
//! Wire-level and logical message shapes plus the reserved header set.
//! Headers are the only cross-component metadata channel; the body is opaque
//! to every component except the serializer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Reserved header keys. These are stable and wire-visible: every transport,
/// regardless of medium, must preserve them byte-for-byte.
pub mod headers {
    /// Unique message identifier.
    pub const MESSAGE_ID: &str = "rbs2-msg-id";
    /// Logical type tag used by deserialization and handler resolution.
    pub const MESSAGE_TYPE: &str = "rbs2-msg-type";
    /// Body encoding, e.g. `application/json;charset=utf-8`.
    pub const CONTENT_TYPE: &str = "rbs2-content-type";
    /// Correlation id carried end-to-end across a conversation.
    pub const CORRELATION_ID: &str = "rbs2-corr-id";
    /// Queue address replies should go to.
    pub const RETURN_ADDRESS: &str = "rbs2-return-address";
    /// RFC 3339 timestamp set when the message was sent.
    pub const SENT_TIME: &str = "rbs2-senttime";
    /// RFC 3339 timestamp before which the message must not be delivered.
    pub const DEFERRED_UNTIL: &str = "rbs2-deferred-until";
    /// Queue address a deferred message is re-sent to when due.
    pub const DEFER_RECIPIENT: &str = "rbs2-defer-recipient";
    /// Maximum age (seconds) after which the message may be discarded.
    pub const TIME_TO_BE_RECEIVED: &str = "rbs2-time-to-be-received";
    /// Delivery intent: [`intent::POINT_TO_POINT`] or [`intent::PUBLISH`].
    pub const INTENT: &str = "rbs2-intent";
    /// Populated by the dead-letter path with the terminal error.
    pub const ERROR_DETAILS: &str = "rbs2-error-details";

    /// Values for the [`INTENT`] header.
    pub mod intent {
        pub const POINT_TO_POINT: &str = "p2p";
        pub const PUBLISH: &str = "pub";
    }
}

/// String→string header map carried by every message.
pub type Headers = HashMap<String, String>;

/// Broker property limits cap header values; anything longer than this is
/// truncated to `first 8000 + marker + last 8000` before hitting the wire.
pub const MAX_HEADER_VALUE_LEN: usize = 16_300;

const TRUNCATION_KEEP: usize = 8_000;
const TRUNCATION_MARKER: &str = " (...) ";

/// A byte body plus headers: the unit every transport moves around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl TransportMessage {
    pub fn new(headers: Headers, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    /// The `rbs2-msg-id` header, if present.
    pub fn id(&self) -> Option<&str> {
        self.header(headers::MESSAGE_ID)
    }

    /// The `rbs2-msg-type` header, if present.
    pub fn message_type(&self) -> Option<&str> {
        self.header(headers::MESSAGE_TYPE)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Clamp oversized header values to respect broker property limits.
    /// Values at or under [`MAX_HEADER_VALUE_LEN`] chars pass through intact.
    pub fn truncate_oversized_headers(&mut self) {
        for value in self.headers.values_mut() {
            if value.chars().count() > MAX_HEADER_VALUE_LEN {
                *value = truncate_value(value);
            }
        }
    }
}

fn truncate_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let head: String = chars[..TRUNCATION_KEEP].iter().collect();
    let tail: String = chars[chars.len() - TRUNCATION_KEEP..].iter().collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

/// A deserialized body plus the same header map.
///
/// The body is a JSON value; typed handlers decode it through the handler
/// registry, untyped handlers (no `rbs2-msg-type` tag on the wire) receive
/// it as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalMessage {
    pub headers: Headers,
    pub body: Value,
}

impl LogicalMessage {
    pub fn new(headers: Headers, body: Value) -> Self {
        Self { headers, body }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// The logical type tag, if the wire carried one.
    pub fn message_type(&self) -> Option<&str> {
        self.header(headers::MESSAGE_TYPE)
    }

    /// The unique message id. Assigned by the outgoing pipeline, so incoming
    /// messages always carry one.
    pub fn id(&self) -> Option<&str> {
        self.header(headers::MESSAGE_ID)
    }

    /// Decode the body into a concrete message type.
    pub fn decode<M: serde::de::DeserializeOwned>(&self) -> crate::error::Result<M> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| crate::error::BusError::serialization(e.to_string()))
    }
}

/// A message type that can travel over the bus.
///
/// The type tag is written to `rbs2-msg-type` on send and drives handler
/// resolution on receive.
pub trait BusMessage: Serialize + serde::de::DeserializeOwned + Send + Sync + 'static {
    /// Stable logical type name for the wire.
    fn message_type() -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_header_values_pass_through() {
        let mut msg = TransportMessage::new(
            Headers::from([("k".to_string(), "v".repeat(MAX_HEADER_VALUE_LEN))]),
            vec![],
        );
        msg.truncate_oversized_headers();
        assert_eq!(msg.headers["k"].len(), MAX_HEADER_VALUE_LEN);
    }

    #[test]
    fn oversized_header_values_keep_head_and_tail() {
        let value = format!("{}{}{}", "a".repeat(9_000), "x", "b".repeat(9_000));
        let mut msg =
            TransportMessage::new(Headers::from([("k".to_string(), value)]), vec![]);
        msg.truncate_oversized_headers();

        let truncated = &msg.headers["k"];
        assert!(truncated.starts_with(&"a".repeat(8_000)));
        assert!(truncated.ends_with(&"b".repeat(8_000)));
        assert!(truncated.contains(TRUNCATION_MARKER.trim()));
        assert!(truncated.len() < 16_300);
    }

    #[test]
    fn logical_message_decodes_typed_body() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Greeting {
            text: String,
        }

        let msg = LogicalMessage::new(
            Headers::new(),
            serde_json::json!({ "text": "hej" }),
        );
        let greeting: Greeting = msg.decode().unwrap();
        assert_eq!(greeting, Greeting { text: "hej".into() });
    }
}

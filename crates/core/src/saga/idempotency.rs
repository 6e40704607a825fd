//! Re-delivery suppression for idempotent sagas.
//!
//! The transport is at-least-once: when an ack is lost after commit, the
//! message comes back. An idempotent saga records every processed message
//! id together with the outgoing messages produced the first time around;
//! redelivery skips the handler body and replays the recorded batch, so the
//! observable side effects are identical.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::envelope::TransportMessage;

/// One outgoing message captured during first-time handling, stored in its
/// wire form so a replay is byte-identical with the original send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingRecord {
    pub destination: String,
    pub message: TransportMessage,
}

/// Bookkeeping embedded in idempotent saga instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyData {
    processed_message_ids: HashSet<String>,
    outgoing_by_message_id: HashMap<String, Vec<OutgoingRecord>>,
}

impl IdempotencyData {
    /// Whether `message_id` has already been handled. When true, the
    /// handler body must not run again.
    pub fn has_processed(&self, message_id: &str) -> bool {
        self.processed_message_ids.contains(message_id)
    }

    /// The outgoing messages produced when `message_id` was first handled.
    pub fn outgoing_for(&self, message_id: &str) -> &[OutgoingRecord] {
        self.outgoing_by_message_id
            .get(message_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Mark `message_id` handled, recording the messages it produced.
    pub fn record(&mut self, message_id: impl Into<String>, outgoing: Vec<OutgoingRecord>) {
        let message_id = message_id.into();
        if !outgoing.is_empty() {
            self.outgoing_by_message_id
                .insert(message_id.clone(), outgoing);
        }
        self.processed_message_ids.insert(message_id);
    }

    /// Number of processed message ids. Mostly useful in tests.
    pub fn processed_count(&self) -> usize {
        self.processed_message_ids.len()
    }
}

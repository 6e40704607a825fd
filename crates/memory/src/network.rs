//! # In-Memory Network
//!
//! A process-wide named network of string-keyed mailboxes with peek-lock
//! semantics: a received message stays invisible to other consumers until
//! it is acked (removed) or nacked (immediately re-deliverable). Delivery
//! counts drive dead-lettering, expired peek locks are reclaimed lazily,
//! and `rbs2-time-to-be-received` discards stale messages on receive.
//!
//! Broker state is serialized under one mutex per queue; the queue map
//! itself is lock-free. Intended for deterministic tests and
//! single-process deployments.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use ferrobus_core::envelope::headers;
use ferrobus_core::{BusError, Result, TransportMessage};

/// Default peek-lock duration.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Default number of deliveries before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// Queue the network dead-letters into.
pub const DEAD_LETTER_QUEUE: &str = "error";

static NETWORKS: Lazy<Mutex<HashMap<String, Arc<InMemNetwork>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// A peek-locked message handed to one consumer.
#[derive(Debug)]
pub struct Lease {
    pub token: Uuid,
    pub message: TransportMessage,
    pub delivery_count: u32,
    pub expires_at: Instant,
}

struct QueueInner {
    ready: VecDeque<StoredMessage>,
    locked: HashMap<Uuid, LockedMessage>,
}

struct StoredMessage {
    message: TransportMessage,
    delivery_count: u32,
}

struct LockedMessage {
    message: TransportMessage,
    delivery_count: u32,
    expires_at: Instant,
}

struct Queue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl Queue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                ready: VecDeque::new(),
                locked: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }
}

/// A named in-memory broker.
pub struct InMemNetwork {
    queues: DashMap<String, Arc<Queue>>,
    max_deliveries: u32,
}

impl InMemNetwork {
    /// A fresh, unshared network.
    pub fn new() -> Arc<Self> {
        Self::with_max_deliveries(DEFAULT_MAX_DELIVERIES)
    }

    pub fn with_max_deliveries(max_deliveries: u32) -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            max_deliveries,
        })
    }

    /// The process-wide network registered under `name`, created on first
    /// use. Endpoints in the same process sharing a name share a broker.
    pub fn named(name: &str) -> Arc<Self> {
        NETWORKS
            .lock()
            .entry(name.to_string())
            .or_insert_with(Self::new)
            .clone()
    }

    pub fn create_queue(&self, address: &str) {
        self.queues
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Queue::new()));
    }

    fn queue(&self, address: &str) -> Arc<Queue> {
        self.queues
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Queue::new()))
            .clone()
    }

    /// Append a message to `address`, creating the queue on first use.
    pub fn deliver(&self, address: &str, message: TransportMessage) -> Result<()> {
        let queue = self.queue(address);
        {
            let mut inner = queue.inner.lock();
            inner.ready.push_back(StoredMessage {
                message,
                delivery_count: 0,
            });
        }
        queue.notify.notify_waiters();
        Ok(())
    }

    /// Take the next visible message under a peek lock, without waiting.
    /// Expired locks are reclaimed first; messages past their
    /// `rbs2-time-to-be-received` are discarded.
    pub fn try_receive(&self, address: &str, lease: Duration) -> Option<Lease> {
        let queue = self.queue(address);
        let reclaimed = {
            let mut inner = queue.inner.lock();
            self.reclaim_expired_locks(&mut inner)
        };
        for message in reclaimed {
            self.dead_letter_or_requeue(address, message, "peek lock expired");
        }

        let mut inner = queue.inner.lock();
        loop {
            let stored = inner.ready.pop_front()?;
            if is_expired(&stored.message) {
                debug!(queue = address, "discarding message past its time-to-be-received");
                continue;
            }
            let token = Uuid::new_v4();
            let delivery_count = stored.delivery_count + 1;
            let expires_at = Instant::now() + lease;
            inner.locked.insert(
                token,
                LockedMessage {
                    message: stored.message.clone(),
                    delivery_count,
                    expires_at,
                },
            );
            return Some(Lease {
                token,
                message: stored.message,
                delivery_count,
                expires_at,
            });
        }
    }

    /// Like [`try_receive`](Self::try_receive) but waits up to `wait` for a
    /// message to arrive when the queue is empty.
    pub async fn receive(&self, address: &str, lease: Duration, wait: Duration) -> Option<Lease> {
        if let Some(found) = self.try_receive(address, lease) {
            return Some(found);
        }
        let queue = self.queue(address);
        let _ = tokio::time::timeout(wait, queue.notify.notified()).await;
        self.try_receive(address, lease)
    }

    /// Fetch up to `max` messages in one call, waiting at most `wait` when
    /// the queue starts out empty.
    pub async fn receive_many(
        &self,
        address: &str,
        max: usize,
        lease: Duration,
        wait: Duration,
    ) -> Vec<Lease> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.try_receive(address, lease) {
                Some(found) => batch.push(found),
                None => break,
            }
        }
        if batch.is_empty() {
            let queue = self.queue(address);
            let _ = tokio::time::timeout(wait, queue.notify.notified()).await;
            while batch.len() < max {
                match self.try_receive(address, lease) {
                    Some(found) => batch.push(found),
                    None => break,
                }
            }
        }
        batch
    }

    /// Complete a peek-locked message, removing it for good.
    pub fn ack(&self, address: &str, token: Uuid) -> Result<()> {
        let queue = self.queue(address);
        let mut inner = queue.inner.lock();
        inner.locked.remove(&token).map(|_| ()).ok_or_else(|| {
            BusError::transport(format!("no peek lock held for token {token}"), false)
        })
    }

    /// Abandon a peek-locked message: it becomes immediately visible again
    /// unless its delivery count has reached the maximum, in which case it
    /// moves to the dead-letter queue with `rbs2-error-details` set.
    pub fn nack(&self, address: &str, token: Uuid, error_details: Option<&str>) -> Result<()> {
        let queue = self.queue(address);
        let released = {
            let mut inner = queue.inner.lock();
            inner.locked.remove(&token).ok_or_else(|| {
                BusError::transport(format!("no peek lock held for token {token}"), false)
            })?
        };
        self.dead_letter_or_requeue(
            address,
            released,
            error_details.unwrap_or("message processing failed"),
        );
        queue.notify.notify_waiters();
        Ok(())
    }

    /// Extend a peek lock. Fails when the lock is no longer held.
    pub fn renew(&self, address: &str, token: Uuid, lease: Duration) -> Result<Instant> {
        let queue = self.queue(address);
        let mut inner = queue.inner.lock();
        let locked = inner.locked.get_mut(&token).ok_or_else(|| {
            BusError::transport(format!("no peek lock held for token {token}"), false)
        })?;
        locked.expires_at = Instant::now() + lease;
        Ok(locked.expires_at)
    }

    /// Number of visible messages in `address`.
    pub fn queue_len(&self, address: &str) -> usize {
        self.queues
            .get(address)
            .map(|q| q.inner.lock().ready.len())
            .unwrap_or(0)
    }

    /// Snapshot of the visible messages in `address`, oldest first.
    pub fn peek_all(&self, address: &str) -> Vec<TransportMessage> {
        self.queues
            .get(address)
            .map(|q| {
                q.inner
                    .lock()
                    .ready
                    .iter()
                    .map(|s| s.message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn reclaim_expired_locks(&self, inner: &mut QueueInner) -> Vec<LockedMessage> {
        let now = Instant::now();
        let expired: Vec<Uuid> = inner
            .locked
            .iter()
            .filter(|(_, locked)| locked.expires_at <= now)
            .map(|(token, _)| *token)
            .collect();
        expired
            .into_iter()
            .filter_map(|token| inner.locked.remove(&token))
            .collect()
    }

    fn dead_letter_or_requeue(&self, address: &str, released: LockedMessage, reason: &str) {
        if released.delivery_count >= self.max_deliveries {
            warn!(
                queue = address,
                delivery_count = released.delivery_count,
                reason,
                "dead-lettering message"
            );
            let mut message = released.message;
            message
                .headers
                .entry(headers::ERROR_DETAILS.to_string())
                .or_insert_with(|| reason.to_string());
            let _ = self.deliver(DEAD_LETTER_QUEUE, message);
        } else {
            let queue = self.queue(address);
            let mut inner = queue.inner.lock();
            inner.ready.push_front(StoredMessage {
                message: released.message,
                delivery_count: released.delivery_count,
            });
        }
    }
}

fn is_expired(message: &TransportMessage) -> bool {
    let Some(ttl_secs) = message
        .header(headers::TIME_TO_BE_RECEIVED)
        .and_then(|raw| raw.parse::<u64>().ok())
    else {
        return false;
    };
    let Some(sent) = message
        .header(headers::SENT_TIME)
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
    else {
        return false;
    };
    let age = chrono::Utc::now().signed_duration_since(sent);
    age.num_seconds() >= 0 && age.num_seconds() as u64 > ttl_secs
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrobus_core::Headers;

    fn message(body: &[u8]) -> TransportMessage {
        TransportMessage::new(Headers::new(), body.to_vec())
    }

    #[tokio::test]
    async fn deliver_then_receive_round_trip() {
        let network = InMemNetwork::new();
        network.deliver("q", message(b"one")).unwrap();

        let lease = network.try_receive("q", DEFAULT_LEASE).unwrap();
        assert_eq!(lease.message.body, b"one");
        assert_eq!(lease.delivery_count, 1);

        // Locked: invisible to other consumers.
        assert!(network.try_receive("q", DEFAULT_LEASE).is_none());

        network.ack("q", lease.token).unwrap();
        assert_eq!(network.queue_len("q"), 0);
    }

    #[tokio::test]
    async fn nack_makes_message_immediately_redeliverable() {
        let network = InMemNetwork::new();
        network.deliver("q", message(b"one")).unwrap();

        let lease = network.try_receive("q", DEFAULT_LEASE).unwrap();
        network.nack("q", lease.token, None).unwrap();

        let again = network.try_receive("q", DEFAULT_LEASE).unwrap();
        assert_eq!(again.message.body, b"one");
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn repeated_nacks_dead_letter_with_error_details() {
        let network = InMemNetwork::with_max_deliveries(3);
        network.deliver("q", message(b"poison")).unwrap();

        for _ in 0..3 {
            let lease = network.try_receive("q", DEFAULT_LEASE).unwrap();
            network.nack("q", lease.token, Some("handler blew up")).unwrap();
        }

        assert_eq!(network.queue_len("q"), 0);
        let dead = network.peek_all(DEAD_LETTER_QUEUE);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].header(headers::ERROR_DETAILS), Some("handler blew up"));
        assert_eq!(dead[0].body, b"poison");
    }

    #[tokio::test]
    async fn expired_lock_is_reclaimed() {
        let network = InMemNetwork::new();
        network.deliver("q", message(b"one")).unwrap();

        let _abandoned = network.try_receive("q", Duration::from_millis(5)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let lease = network.try_receive("q", DEFAULT_LEASE).unwrap();
        assert_eq!(lease.delivery_count, 2);
    }

    #[tokio::test]
    async fn renew_extends_the_lock() {
        let network = InMemNetwork::new();
        network.deliver("q", message(b"one")).unwrap();

        let lease = network.try_receive("q", Duration::from_millis(30)).unwrap();
        let extended = network.renew("q", lease.token, Duration::from_secs(5)).unwrap();
        assert!(extended > lease.expires_at);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Still locked: the renewal outlived the original lease.
        assert!(network.try_receive("q", DEFAULT_LEASE).is_none());
    }

    #[tokio::test]
    async fn receive_waits_briefly_for_late_messages() {
        let network = InMemNetwork::new();
        let sender = network.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sender.deliver("q", message(b"late")).unwrap();
        });

        let lease = network
            .receive("q", DEFAULT_LEASE, Duration::from_millis(50))
            .await;
        assert!(lease.is_some());
    }

    #[tokio::test]
    async fn time_to_be_received_discards_stale_messages() {
        let network = InMemNetwork::new();
        let mut stale = message(b"old");
        stale.headers.insert(
            headers::TIME_TO_BE_RECEIVED.to_string(),
            "1".to_string(),
        );
        stale.headers.insert(
            headers::SENT_TIME.to_string(),
            (chrono::Utc::now() - chrono::Duration::seconds(10)).to_rfc3339(),
        );
        network.deliver("q", stale).unwrap();

        assert!(network.try_receive("q", DEFAULT_LEASE).is_none());
    }

    #[test]
    fn named_networks_are_shared_per_process() {
        let a = InMemNetwork::named("net-sharing-test");
        let b = InMemNetwork::named("net-sharing-test");
        a.deliver("q", message(b"shared")).unwrap();
        assert_eq!(b.queue_len("q"), 1);
    }
}

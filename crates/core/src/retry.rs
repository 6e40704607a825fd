//! # Retrier
//!
//! Bounded retry over a user-classified set of transient failures. Broker
//! calls are wrapped in [`Retrier::execute`]; an ordered list of classifiers
//! decides whether a given error is eligible for another attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{BusError, Result};

type Classifier = Arc<dyn Fn(&BusError) -> bool + Send + Sync>;

/// The fixed backoff schedule, in milliseconds. Summed, the whole budget is
/// roughly 24 seconds; the 14th failure surfaces the original error.
const BACKOFF_SCHEDULE_MS: [u64; 13] = [
    100, 100, 100, 200, 200, 200, 500, 1_000, 1_000, 1_000, 5_000, 5_000, 10_000,
];

/// Retries an operation against the backoff schedule while its error keeps
/// matching one of the registered classifiers.
#[derive(Clone)]
pub struct Retrier {
    schedule: Arc<[Duration]>,
    classifiers: Vec<Classifier>,
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Retrier {
    /// Create a retrier with the standard schedule and no classifiers.
    /// Without classifiers every error surfaces immediately.
    pub fn new() -> Self {
        Self {
            schedule: BACKOFF_SCHEDULE_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            classifiers: Vec::new(),
        }
    }

    /// Replace the backoff schedule. Intended for tests.
    pub fn with_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.schedule = schedule.into();
        self
    }

    /// Register a classifier: errors for which `predicate` returns true are
    /// eligible for retry. Classifiers are consulted in registration order.
    pub fn on(mut self, predicate: impl Fn(&BusError) -> bool + Send + Sync + 'static) -> Self {
        self.classifiers.push(Arc::new(predicate));
        self
    }

    /// A retrier that retries everything the transport flags as transient.
    pub fn on_transient() -> Self {
        Self::new().on(BusError::is_transient)
    }

    /// Run `operation`, retrying per the schedule while the returned error
    /// matches a classifier. Exhausting the schedule or hitting an
    /// unmatched error rethrows the original error.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0usize;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retriable = self.classifiers.iter().any(|matches| matches(&err));
                    let Some(delay) = self.schedule.get(attempt) else {
                        return Err(err);
                    };
                    if !retriable {
                        return Err(err);
                    }
                    debug!(attempt, delay_ms = delay.as_millis() as u64, %err, "retrying after transient failure");
                    tokio::time::sleep(*delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

//! # Async Bottleneck
//!
//! Bounded concurrent admission gate. Entering yields a scoped token;
//! dropping the token releases the slot on every exit path.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{BusError, Result};

/// Default limit for the handler-parallelism gate.
pub const DEFAULT_MAX_PARALLELISM: usize = 20;

/// Default limit for the receive-concurrency gate.
pub const DEFAULT_RECEIVE_CONCURRENCY: usize = 10;

/// A semaphore-like gate bounding the number of in-flight units of work.
#[derive(Clone)]
pub struct Bottleneck {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Scoped admission token. Dropping it releases the slot.
pub struct BottleneckToken {
    _permit: OwnedSemaphorePermit,
}

impl Bottleneck {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Block until the in-flight count is below the limit, then admit.
    pub async fn enter(&self) -> Result<BottleneckToken> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BusError::ShuttingDown)?;
        Ok(BottleneckToken { _permit: permit })
    }

    /// The configured limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn admits_up_to_limit() {
        let gate = Bottleneck::new(2);
        let first = gate.enter().await.unwrap();
        let _second = gate.enter().await.unwrap();
        assert_eq!(gate.available(), 0);

        // Third entry blocks until a token drops.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), gate.enter()).await;
        assert!(blocked.is_err());

        drop(first);
        let third =
            tokio::time::timeout(Duration::from_millis(100), gate.enter()).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn token_release_on_early_return() {
        let gate = Bottleneck::new(1);

        async fn failing(gate: &Bottleneck) -> Result<()> {
            let _token = gate.enter().await?;
            Err(BusError::handler("boom"))
        }

        assert!(failing(&gate).await.is_err());
        assert_eq!(gate.available(), 1);
    }
}

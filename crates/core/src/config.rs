//! # Bus Configuration
//!
//! Enumerated runtime options with builder-style setters. Validation runs
//! synchronously when the bus starts, so a bad configuration never makes it
//! into a worker loop.

use std::time::Duration;

use crate::bottleneck::{DEFAULT_MAX_PARALLELISM, DEFAULT_RECEIVE_CONCURRENCY};
use crate::error::{BusError, Result};
use crate::transport::ReceiveMode;

/// Runtime options for one bus endpoint.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Parallel logical workers pumping the input queue.
    pub number_of_workers: usize,
    /// Upper bound on concurrently executing message handlers across all
    /// workers. Independent of the worker count: many lightweight handlers
    /// can exploit I/O-waiting time with `max_parallelism ≫ workers`.
    pub max_parallelism: usize,
    /// Upper bound on concurrent `receive` calls against the broker.
    pub receive_concurrency: usize,
    /// Peek-lock renewal vs. prefetching (mutually exclusive by type).
    pub receive_mode: ReceiveMode,
    /// Record processed message ids per saga and replay outgoing messages
    /// on redelivery.
    pub enable_idempotent_sagas: bool,
    /// `rbs2-return-address` stamped on outgoing messages; defaults to the
    /// transport's own address.
    pub default_return_address: Option<String>,
    /// Destination for poison messages.
    pub error_queue_address: String,
    /// How long `stop` waits for in-flight messages before abandoning
    /// stuck workers.
    pub shutdown_grace: Duration,
    /// Poll interval of the deferred-message worker.
    pub due_poll_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            number_of_workers: num_cpus::get(),
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            receive_concurrency: DEFAULT_RECEIVE_CONCURRENCY,
            receive_mode: ReceiveMode::default(),
            enable_idempotent_sagas: false,
            default_return_address: None,
            error_queue_address: "error".to_string(),
            shutdown_grace: Duration::from_secs(10),
            due_poll_interval: Duration::from_millis(500),
        }
    }
}

impl BusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_number_of_workers(mut self, workers: usize) -> Self {
        self.number_of_workers = workers;
        self
    }

    pub fn with_max_parallelism(mut self, parallelism: usize) -> Self {
        self.max_parallelism = parallelism;
        self
    }

    pub fn with_receive_concurrency(mut self, concurrency: usize) -> Self {
        self.receive_concurrency = concurrency;
        self
    }

    pub fn with_receive_mode(mut self, mode: ReceiveMode) -> Self {
        self.receive_mode = mode;
        self
    }

    pub fn with_idempotent_sagas(mut self, enabled: bool) -> Self {
        self.enable_idempotent_sagas = enabled;
        self
    }

    pub fn with_default_return_address(mut self, address: impl Into<String>) -> Self {
        self.default_return_address = Some(address.into());
        self
    }

    pub fn with_error_queue_address(mut self, address: impl Into<String>) -> Self {
        self.error_queue_address = address.into();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_due_poll_interval(mut self, interval: Duration) -> Self {
        self.due_poll_interval = interval;
        self
    }

    /// Check the configuration. Called by the bus at start.
    pub fn validate(&self) -> Result<()> {
        if self.number_of_workers == 0 {
            return Err(BusError::configuration("number_of_workers must be at least 1"));
        }
        if self.max_parallelism == 0 {
            return Err(BusError::configuration("max_parallelism must be at least 1"));
        }
        if self.receive_concurrency == 0 {
            return Err(BusError::configuration(
                "receive_concurrency must be at least 1",
            ));
        }
        if self.error_queue_address.is_empty() {
            return Err(BusError::configuration("error_queue_address must not be empty"));
        }
        if let ReceiveMode::Prefetch(0) = self.receive_mode {
            return Err(BusError::configuration("prefetch count must be at least 1"));
        }
        Ok(())
    }
}

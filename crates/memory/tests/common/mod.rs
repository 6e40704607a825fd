//! Shared helpers for the integration suite.

use std::sync::Once;
use std::time::{Duration, Instant};

use ferrobus_core::BusConfig;

static TRACING: Once = Once::new();

/// Install a fmt subscriber honoring `RUST_LOG`, once per test binary.
/// Run a single test with `RUST_LOG=ferrobus_core=debug` to watch the
/// pipeline and transaction flow.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Deterministic single-worker, single-parallelism configuration: handlers
/// see messages in send order.
pub fn serial_config() -> BusConfig {
    BusConfig::new()
        .with_number_of_workers(1)
        .with_max_parallelism(1)
        .with_shutdown_grace(Duration::from_secs(2))
        .with_due_poll_interval(Duration::from_millis(50))
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

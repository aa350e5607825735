//! Shared helpers for unit tests.

mod simulated_storage;

use std::sync::Once;

pub use simulated_storage::{FaultConfig, SimulatedStorage, SimulatedStorageStats};

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "engine=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

//! Common test utilities for integration tests.

pub mod assertions;
pub mod cluster_sim;
pub mod fixtures;

// Re-export common types
pub use assertions::*;
pub use cluster_sim::*;
pub use fixtures::*;

use tracing_subscriber::EnvFilter;

/// Send test logs to the test writer, filtered by `RUST_LOG`. Safe to call
/// from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

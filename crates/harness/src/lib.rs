pub mod server;
pub mod session;

pub use server::MockServer;
pub use session::{START_MS, TEST_USER, TestSession, article, data_field};

use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber once. Filter with `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

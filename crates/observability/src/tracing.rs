//! Tracing/logging initialization.
//!
//! Ledger spans carry `tenant_id` and `product_id`; JSON output keeps them as
//! separate fields so log pipelines can filter per tenant.

use tracing_subscriber::EnvFilter;

fn filter(default_directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives))
}

/// JSON logs + timestamps, configurable via RUST_LOG.
pub fn init(default_directives: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default_directives))
        .json()
        .with_current_span(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .with_test_writer()
        .try_init();
}

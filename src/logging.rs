//! Tracing setup for binaries and test harnesses embedding the engine

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber, honouring `RUST_LOG`.
///
/// Safe to call more than once; only the first call installs the subscriber.
pub fn init() {
    init_with_filter("askdb=info");
}

/// Initialize with an explicit default filter directive, e.g. `"askdb=debug"`.
pub fn init_with_filter(default_filter: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}

//! Tracing subscriber setup for binaries and examples embedding the
//! runtime. The library itself only emits `tracing` events.

use tracing_subscriber::EnvFilter;

/// Install a global subscriber honoring `RUST_LOG`, defaulting to `info`
/// for this crate. Safe to call more than once; later calls are no-ops.
pub fn init() {
    init_with_filter("tidecron_runtime=info,warn");
}

/// Install a global subscriber with an explicit default filter.
pub fn init_with_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

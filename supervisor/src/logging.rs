//! Supervisor diagnostics via `tracing`.
//!
//! Hosted scripts never log through here: their stdout and stderr go to the
//! per-script files under `paths.logs_dir` (see `io::logs`). This module only
//! covers the supervisor's own events.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the stderr subscriber.
///
/// Reads `RUST_LOG`, falling back to `default_filter` when unset.
///
/// # Example
/// ```bash
/// RUST_LOG=supervisor=debug supervisor serve
/// ```
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

//! Process-wide logging/tracing setup shared by the API and worker
//! binaries.

use tracing_subscriber::EnvFilter;

/// Initialize structured logging for the process.
///
/// JSON lines on stdout, filtered via `RUST_LOG` (default `info`).
/// Safe to call multiple times; subsequent calls are no-ops, which
/// keeps tests that spin up several components from panicking.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_current_span(false)
        .try_init();
}

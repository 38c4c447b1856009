//! Tracing subscriber setup for hosts embedding the lifecycle core.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info,reclaim_core=debug";

/// Install a global fmt subscriber.
///
/// Honors `RUST_LOG`, falling back to `default_filter` (or
/// [`DEFAULT_LOG_FILTER`]). Returns `false` when a global subscriber is
/// already installed, which makes it safe to call from tests.
pub fn init_tracing(default_filter: Option<&str>) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.unwrap_or(DEFAULT_LOG_FILTER).into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init()
        .is_ok()
}

//! Diagnostics via `tracing`, written to stderr.
//!
//! Stdout belongs to the REPL transcript and the RPC transport, so nothing in
//! this module ever writes there.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LEVEL: &str = "warn";
const VERBOSE_LEVEL: &str = "debug";

/// Picks the filter directive: `--verbose`, then `RUST_LOG`, then the
/// configured level, then `warn`.
#[must_use]
pub fn filter_directive(
    rust_log: Option<&str>,
    configured: Option<&str>,
    verbose: bool,
) -> String {
    if verbose {
        return VERBOSE_LEVEL.to_string();
    }
    [rust_log, configured]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|directive| !directive.is_empty())
        .unwrap_or(DEFAULT_LEVEL)
        .to_string()
}

/// Installs the global subscriber. Safe to call once per process; later
/// calls are ignored.
pub fn init(configured: Option<&str>, verbose: bool) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = filter_directive(rust_log.as_deref(), configured, verbose);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

//! Diagnostic tracing for operators and development.
//!
//! - **Tracing (this module)**: `RUST_LOG`-driven diagnostics on stderr. Not persisted.
//! - **Product artifacts**: `progress.md`, `guardrails.json` and
//!   `.storyloop/logs/<iteration>/` are always written, independent of `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `warn`, or `storyloop=info` with `verbose`.
///
/// ```bash
/// RUST_LOG=storyloop=debug storyloop run --max-iterations 1
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,storyloop=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

//! Development-time tracing for debugging the orchestrator.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the run's product output.
//!
//! - **Run artifacts (`io/artifacts`)**: Product output under the runs root.
//!   Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the tracing subscriber for development logging.
///
/// `RUST_LOG` wins when set. Otherwise dependencies stay at `warn` while
/// this crate reports run progress (cycle and turn events) at `info`, so a
/// plain invocation still shows what the run is doing.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=conductor=debug conductor run --goal "..."
/// ```
pub fn init() {
    let default_directives = format!("warn,{}=info", env!("CARGO_PKG_NAME"));
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

/// Installs the global subscriber: human-readable lines on stderr, filtered
/// by `RUST_LOG` when set. stdout stays free for command output.
pub fn init(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .try_init()
        .context("installing log subscriber")
}

//! Stderr logging for the binary.

use std::env;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable holding a tracing filter, e.g. `script_archive=debug`.
pub const LOG_ENV: &str = "SCRIPT_ARCHIVE_LOG";

/// Installs the stderr subscriber used by the binary.
///
/// `SCRIPT_ARCHIVE_LOG` wins when set; otherwise the level is `info` with
/// `verbose` and `warn` without. Calling this twice is harmless.
pub fn init_logger(verbose: bool) {
    let default_filter = if verbose { "info" } else { "warn" };
    let filter = env::var(LOG_ENV).unwrap_or_else(|_| default_filter.to_string());
    let filter_layer = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time(),
        )
        .with(filter_layer)
        .try_init();
}

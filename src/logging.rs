//! Subscriber setup for the binary. Library code only emits events.

use anyhow::{anyhow, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "fscrawl=info";

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(verbose: bool, silent: bool) -> &'static str {
    if verbose {
        "fscrawl=debug"
    } else if silent {
        "fscrawl=warn"
    } else {
        DEFAULT_LOG_FILTER
    }
}

/// Install a stderr subscriber. `RUST_LOG` wins over the flags.
pub fn init_logging(verbose: bool, silent: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose, silent)));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .with_filter(filter),
        )
        .try_init()
        .map_err(|e| anyhow!("failed to initialize logging: {}", e))
}

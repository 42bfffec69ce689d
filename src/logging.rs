//! Diagnostic tracing.
//!
//! Diagnostics go to stderr so stdout stays free for the streamed model
//! output and command results. `RUST_LOG` wins over the configured level.
//!
//! ```bash
//! RUST_LOG=textbridge=debug textbridge replay --task "..." response.txt
//! ```

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Fails if one is already installed.
pub fn init(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()?;
    Ok(())
}

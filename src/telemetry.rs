//! Logging setup for services embedding Slotwarden.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Result, SlotwardenError};

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` overrides `config.level` when set. If a subscriber is already
/// installed this is a no-op.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            SlotwardenError::Config(format!("invalid log level {:?}: {}", config.level, e))
        })?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    // Err means a global subscriber already exists.
    let _ = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };

    Ok(())
}

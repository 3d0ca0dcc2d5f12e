use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{CoreError, Result};

/// Build the filter: `RUST_LOG` wins, otherwise the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global `fmt` subscriber.
///
/// Returns an error when a global subscriber is already installed; callers
/// that may initialise more than once can ignore it.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(config));

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| CoreError::Logging(e.to_string()))
}

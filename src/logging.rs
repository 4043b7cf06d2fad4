//! Tracing subscriber setup for the binary.

use crate::config::ApplicationConfig;
use crate::error::{AppResult, DaqError};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init(config: &ApplicationConfig) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| DaqError::Configuration(format!("invalid log level '{}': {e}", config.log_level)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let result = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| DaqError::Configuration(format!("logging already initialised: {e}")))
}


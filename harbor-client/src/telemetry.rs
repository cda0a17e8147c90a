//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingSection;
use crate::error::ClientError;

/// Install the global subscriber. `RUST_LOG` overrides the configured filter.
pub fn init_tracing(logging: &LoggingSection) -> Result<(), ClientError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| ClientError::Telemetry(e.to_string()))?;

    tracing::info!(filter = %logging.filter, json = logging.json, "Tracing initialized");
    Ok(())
}

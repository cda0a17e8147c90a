//! Error types for the client binary.

use harbor_connections::GraphQlError;
use harbor_core::{ActionError, HarborError, LoadError, TransportError};

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to init tracing: {0}")]
    Telemetry(String),
    #[error("GraphQL client error: {0}")]
    GraphQl(#[from] GraphQlError),
    #[error(transparent)]
    Harbor(#[from] HarborError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LoadError> for ClientError {
    fn from(err: LoadError) -> Self {
        Self::Harbor(err.into())
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        Self::Harbor(err.into())
    }
}

impl From<ActionError> for ClientError {
    fn from(err: ActionError) -> Self {
        Self::Harbor(err.into())
    }
}

//! Harbor Client - Headless Console Session
//!
//! Wires the session channel, the connection cache and the invalidation
//! glue together behind a TOML config, and logs what happens.

pub mod config;
pub mod error;
pub mod session;
pub mod startup;
pub mod telemetry;

pub use config::{ClientConfig, ConfigError};
pub use error::ClientError;

//! Configuration loading for the harbor client.
//!
//! The file path comes from `--config <path>` or `HARBOR_CONFIG`. Sections
//! other than the endpoints are optional and fall back to the transport and
//! logging defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use harbor_events::TransportConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub graphql_endpoint: String,
    pub ws_endpoint: String,
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TransportSection {
    pub retry_interval_ms: u64,
    pub error_debounce_ms: u64,
    pub event_capacity: usize,
}

impl Default for TransportSection {
    fn default() -> Self {
        let defaults = TransportConfig::default();
        Self {
            retry_interval_ms: millis(defaults.retry_interval),
            error_debounce_ms: millis(defaults.error_debounce),
            event_capacity: defaults.event_capacity,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SessionSection {
    /// Projects whose connections are loaded at startup.
    pub active_projects: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingSection {
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "harbor=info,info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or HARBOR_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn is_ws_url(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate TOML text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_http_url(self.graphql_endpoint.trim()) {
            return Err(ConfigError::InvalidValue {
                field: "graphql_endpoint",
                reason: "must be an http:// or https:// URL".to_string(),
            });
        }
        if !is_ws_url(self.ws_endpoint.trim()) {
            return Err(ConfigError::InvalidValue {
                field: "ws_endpoint",
                reason: "must be a ws:// or wss:// URL".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.transport.retry_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transport.retry_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.transport.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transport.event_capacity",
                reason: "must be > 0".to_string(),
            });
        }
        if self
            .session
            .active_projects
            .iter()
            .any(|project| project.trim().is_empty())
        {
            return Err(ConfigError::InvalidValue {
                field: "session.active_projects",
                reason: "project ids must not be empty".to_string(),
            });
        }
        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "logging.filter",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::new()
            .with_retry_interval(Duration::from_millis(self.transport.retry_interval_ms))
            .with_error_debounce(Duration::from_millis(self.transport.error_debounce_ms))
            .with_event_capacity(self.transport.event_capacity)
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("HARBOR_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        graphql_endpoint = "http://localhost:8978/api/gql"
        ws_endpoint = "ws://localhost:8978/api/ws"
        request_timeout_ms = 5000
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ClientConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.transport.retry_interval_ms, 30_000);
        assert_eq!(config.transport.event_capacity, 1024);
        assert!(config.session.active_projects.is_empty());
        assert!(!config.logging.json);
        assert_eq!(config.transport_config().retry_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_sample_config_parses() {
        let config = ClientConfig::parse(include_str!("../config/harbor.example.toml")).unwrap();
        assert_eq!(config.session.active_projects, vec!["g_GlobalConfiguration".to_string()]);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let text = format!("{MINIMAL}\nretry = 3\n");
        assert!(matches!(ClientConfig::parse(&text), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_ws_endpoint_scheme_is_checked() {
        let text = MINIMAL.replace("ws://localhost", "http://localhost");
        let err = ClientConfig::parse(&text).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "ws_endpoint", .. }));
    }

    #[test]
    fn test_zero_retry_interval_is_rejected() {
        let text = format!("{MINIMAL}\n[transport]\nretry_interval_ms = 0\n");
        let err = ClientConfig::parse(&text).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "transport.retry_interval_ms",
                ..
            }
        ));
    }
}

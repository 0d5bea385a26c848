//! Configuration management for the CDP Relay Core

use crate::{Error, Result};
use serde::Deserialize;
use std::env;

/// Macro for parsing environment variables with type safety and consistent error handling
macro_rules! parse_env_var {
    ($config:ident, $field:ident, $env_var:expr, $ty:ty) => {
        if let Ok(value) = env::var($env_var) {
            $config.$field = value
                .parse::<$ty>()
                .map_err(|_| Error::configuration(concat!("Invalid ", $env_var)))?;
        }
    };

    ($config:ident, $field:ident, $env_var:expr) => {
        if let Ok(value) = env::var($env_var) {
            $config.$field = value;
        }
    };

    (opt $config:ident, $field:ident, $env_var:expr) => {
        if let Ok(value) = env::var($env_var) {
            $config.$field = Some(value);
        }
    };

    (list $config:ident, $field:ident, $env_var:expr) => {
        if let Ok(value) = env::var($env_var) {
            $config.$field = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    };
}

/// Relay server configuration (spec §6 "Process configuration")
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Host address to bind to (must be loopback — spec §4.H)
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Shared token required on `/cdp` and privileged HTTP routes when set
    pub token: Option<String>,

    /// Allow-listed `chrome-extension://<id>` origins for `/extension` and `/cdp`
    pub extension_origin_allowlist: Vec<String>,

    /// Create an initial tab on the first driver `Target.setAutoAttach` if
    /// the bound extension has zero targets
    pub auto_tab: bool,

    /// Default timeout for extension-directed requests, in milliseconds
    pub request_timeout_ms: u64,

    /// Keep-alive ping interval towards extensions, in milliseconds
    pub ping_interval_ms: u64,

    /// Wait budget for the `Runtime.enable` execution-context latch, in milliseconds
    pub runtime_enable_wait_ms: u64,

    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 19988,
            token: None,
            extension_origin_allowlist: Vec::new(),
            auto_tab: false,
            request_timeout_ms: 30_000,
            ping_interval_ms: 5_000,
            runtime_enable_wait_ms: 3_000,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        parse_env_var!(config, host, "RELAY_HOST");
        parse_env_var!(config, port, "RELAY_PORT", u16);
        parse_env_var!(opt config, token, "RELAY_TOKEN");
        parse_env_var!(list config, extension_origin_allowlist, "RELAY_EXTENSION_ALLOWLIST");
        parse_env_var!(config, auto_tab, "RELAY_AUTO_TAB", bool);
        parse_env_var!(config, request_timeout_ms, "RELAY_REQUEST_TIMEOUT_MS", u64);
        parse_env_var!(config, ping_interval_ms, "RELAY_PING_INTERVAL_MS", u64);
        parse_env_var!(config, runtime_enable_wait_ms, "RELAY_RUNTIME_ENABLE_WAIT_MS", u64);
        parse_env_var!(config, log_level, "RELAY_LOG_LEVEL");

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::configuration(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Whether the Core was started with a required shared token
    pub fn token_required(&self) -> bool {
        self.token.is_some()
    }

    /// Whether a supplied query-string token matches the configured one
    pub fn token_matches(&self, supplied: Option<&str>) -> bool {
        match &self.token {
            None => true,
            Some(expected) => supplied == Some(expected.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.port, 19988);
        assert_eq!(config.host, "127.0.0.1");
        assert!(!config.token_required());
        assert!(config.token_matches(None));
        assert!(config.token_matches(Some("anything")));
    }

    #[test]
    fn token_matching_requires_exact_value() {
        let mut config = Config::default();
        config.token = Some("secret".to_string());
        assert!(config.token_required());
        assert!(!config.token_matches(None));
        assert!(!config.token_matches(Some("wrong")));
        assert!(config.token_matches(Some("secret")));
    }
}

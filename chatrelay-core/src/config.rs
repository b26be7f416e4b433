use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 3001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Call signaling timings and connection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Time a callee has to accept or reject an invitation
    pub call_timeout_seconds: u64,
    /// Delay after accept before both sides are told the call started
    pub connect_confirm_seconds: u64,
    /// Period of the stale session sweep
    pub sweep_interval_seconds: u64,
    /// Sessions older than this are removed by the sweep regardless of state
    pub max_session_age_seconds: u64,
    /// Sessions still ringing after this long are removed by the sweep
    pub stale_calling_seconds: u64,
    /// Largest accepted WebSocket frame
    pub max_message_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            call_timeout_seconds: 30,
            connect_confirm_seconds: 3,
            sweep_interval_seconds: 60,
            max_session_age_seconds: 300,
            stale_calling_seconds: 60,
            max_message_bytes: 64 * 1024,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    #[must_use]
    pub const fn connect_confirm(&self) -> Duration {
        Duration::from_secs(self.connect_confirm_seconds)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // CHATRELAY_SERVER__HTTP_PORT, CHATRELAY_RELAY__CALL_TIMEOUT_SECONDS, ...
        builder = builder.add_source(
            Environment::with_prefix("CHATRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the configuration for values the relay cannot run with.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        let relay = &self.relay;
        for (name, value) in [
            ("relay.call_timeout_seconds", relay.call_timeout_seconds),
            ("relay.connect_confirm_seconds", relay.connect_confirm_seconds),
            ("relay.sweep_interval_seconds", relay.sweep_interval_seconds),
            ("relay.max_session_age_seconds", relay.max_session_age_seconds),
            ("relay.stale_calling_seconds", relay.stale_calling_seconds),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be non-zero"));
            }
        }
        if relay.connect_confirm_seconds >= relay.call_timeout_seconds {
            errors.push(
                "relay.connect_confirm_seconds must be shorter than relay.call_timeout_seconds"
                    .to_string(),
            );
        }
        if relay.max_message_bytes < 1024 {
            errors.push("relay.max_message_bytes must be at least 1024".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

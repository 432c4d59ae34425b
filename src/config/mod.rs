use crate::pool::tcp::DEFAULT_PORT;
use crate::pool::PoolConfig;
use crate::utils::error::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    #[serde(default)]
    pub max_active_per_key: Option<usize>,
    #[serde(default = "default_max_idle_total")]
    pub max_idle_total: usize,
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default)]
    pub active_timeout_ms: Option<u64>,
    #[serde(default)]
    pub session_token_field: Option<String>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_port")]
    pub default_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String, // "json" or "pretty"
}

// Default values
fn default_keep_alive_interval_ms() -> u64 {
    1000
}

fn default_max_idle_total() -> usize {
    256
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            keep_alive: false,
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            max_active_per_key: None,
            max_idle_total: default_max_idle_total(),
            idle_timeout_ms: None,
            active_timeout_ms: None,
            session_token_field: None,
            connect_timeout_ms: None,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            default_port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl PoolSettings {
    /// Runtime pool configuration; zero timeouts mean "no timeout".
    pub fn to_pool_config(&self) -> PoolConfig {
        let millis = |value: Option<u64>| {
            value
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
        };

        PoolConfig {
            keep_alive: self.keep_alive,
            keep_alive_interval: Duration::from_millis(self.keep_alive_interval_ms),
            max_active_per_key: self.max_active_per_key,
            max_idle_total: self.max_idle_total,
            idle_timeout: millis(self.idle_timeout_ms),
            active_timeout: millis(self.active_timeout_ms),
            session_token_field: self.session_token_field.clone(),
            connect_timeout: millis(self.connect_timeout_ms),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PoolError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| PoolError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_idle_total == 0 {
            return Err(PoolError::Config(
                "max_idle_total must be greater than 0".to_string(),
            ));
        }

        if self.pool.max_active_per_key == Some(0) {
            return Err(PoolError::Config(
                "max_active_per_key must be at least 1 when set".to_string(),
            ));
        }

        if self.pool.keep_alive_interval_ms == 0 {
            return Err(PoolError::Config(
                "keep_alive_interval_ms must be greater than 0".to_string(),
            ));
        }

        if let Some(field) = &self.pool.session_token_field {
            if field.trim().is_empty() {
                return Err(PoolError::Config(
                    "session_token_field cannot be empty when set".to_string(),
                ));
            }
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(PoolError::Config(format!(
                "Invalid log format: {}. Must be 'pretty' or 'json'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[pool]
keep_alive = true
keep_alive_interval_ms = 1000
# max_active_per_key = 8       # unbounded when unset
max_idle_total = 256
# idle_timeout_ms = 30000      # idle connections never expire when unset
# active_timeout_ms = 60000
# connect_timeout_ms = 5000

# Pin requests carrying this cookie to one connection per cookie value
# (needed for connection-bound auth such as NTLM).
# session_token_field = "NTLMSESSION"

[transport]
default_port = 80

[logging]
level = "info"  # Options: "trace", "debug", "info", "warn", "error"
format = "pretty"  # Options: "pretty", "json"
"#;

        std::fs::write(path.as_ref(), example)
            .map_err(|e| PoolError::Config(format!("Failed to write example config: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.pool.keep_alive);
        assert_eq!(config.pool.max_idle_total, 256);
        assert_eq!(config.pool.keep_alive_interval_ms, 1000);
        assert_eq!(config.transport.default_port, 80);
        assert_eq!(config.logging.format, "pretty");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.pool.max_idle_total = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.max_active_per_key = Some(0);
        assert!(config.validate().is_err());

        config.pool.max_active_per_key = Some(1);
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.pool.session_token_field = Some("  ".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeouts_disable_the_timer() {
        let settings = PoolSettings {
            idle_timeout_ms: Some(0),
            active_timeout_ms: Some(1500),
            ..Default::default()
        };
        let pool = settings.to_pool_config();
        assert_eq!(pool.idle_timeout, None);
        assert_eq!(pool.active_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(pool.connect_timeout, None);
    }

    #[test]
    fn example_config_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.toml");

        Config::create_example(&path).unwrap();
        let config = Config::from_file(&path).unwrap();

        assert!(config.pool.keep_alive);
        assert_eq!(config.pool.session_token_field, None);
        assert_eq!(config.transport.default_port, 80);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.toml");
        std::fs::write(
            &path,
            "[pool]\nsession_token_field = \"NTLMSESSION\"\nidle_timeout_ms = 250\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        let pool = config.pool.to_pool_config();
        assert_eq!(pool.session_token_field.as_deref(), Some("NTLMSESSION"));
        assert_eq!(pool.idle_timeout, Some(Duration::from_millis(250)));
        assert_eq!(pool.max_idle_total, 256);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn rejects_unparseable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.toml");
        std::fs::write(&path, "[pool\nkeep_alive = ").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }
}

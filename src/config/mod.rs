//! Configuration management

use crate::obfuscation::{BrowserProfile, DisguiseMode, DEFAULT_DRAIN_TIMEOUT};
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Where unwrapped traffic is relayed
    pub target: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Wait for the client's last chunk on close, in seconds
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8388".to_string(),
            target: "127.0.0.1:1080".to_string(),
            max_connections: 1024,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT.as_secs(),
        }
    }
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local listen address
    pub listen: String,
    /// Server address
    pub server: String,
    /// Disguise to speak
    pub mode: DisguiseMode,
    /// Masquerade hosts (Host header / SNI); empty means the built-in default
    pub obfs_hosts: Vec<String>,
    /// Browser profile for User-Agent and ClientHello shape
    pub browser_profile: String,
    /// Idle connections kept for reuse; 0 disables the pool
    pub pool_capacity: usize,
    /// Seconds an idle connection stays reusable
    pub pool_idle_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:1081".to_string(),
            server: "127.0.0.1:8388".to_string(),
            mode: DisguiseMode::Http,
            obfs_hosts: vec!["www.bing.com".to_string()],
            browser_profile: "chrome".to_string(),
            pool_capacity: 16,
            pool_idle_secs: 60,
        }
    }
}

impl ClientConfig {
    /// Get the browser profile from the profile name
    pub fn browser_profile(&self) -> BrowserProfile {
        BrowserProfile::from_name(&self.browser_profile)
    }

    pub fn pool_idle(&self) -> Duration {
        Duration::from_secs(self.pool_idle_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        transport: TransportConfig::default(),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_roundtrip() {
        let text = toml::to_string_pretty(&generate_example_config()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();

        let client = parsed.client.unwrap();
        assert_eq!(client.mode, DisguiseMode::Http);
        assert_eq!(client.browser_profile(), BrowserProfile::Chrome);
        assert_eq!(parsed.server.unwrap().drain_timeout(), DEFAULT_DRAIN_TIMEOUT);
        assert!(parsed.transport.nodelay);
    }

    #[test]
    fn test_partial_config() {
        let parsed: Config = toml::from_str(
            r#"
            [client]
            server = "198.51.100.7:8388"
            mode = "tls"
            "#,
        )
        .unwrap();

        assert!(parsed.server.is_none());
        let client = parsed.client.unwrap();
        assert_eq!(client.mode, DisguiseMode::Tls);
        assert_eq!(client.pool_capacity, 16);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn test_save_then_load() {
        let path = std::env::temp_dir().join(format!("obfs-relay-{}.toml", std::process::id()));
        generate_example_config().save(&path).unwrap();
        let loaded = Config::load(&path);
        let _ = std::fs::remove_file(&path);

        let loaded = loaded.unwrap();
        assert_eq!(loaded.client.unwrap().mode, DisguiseMode::Http);
        assert_eq!(loaded.logging.level, "info");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/obfs-relay.toml").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}

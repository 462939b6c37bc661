use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub discovery: DiscoveryConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
    pub streaming: StreamingConfig,
}

/// Identity this process registers under
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    pub instance_name: String,
    pub environment: String,
    /// Address other instances use to reach this one
    pub advertise_address: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "market-data-simulator".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_name: "market-data-simulator".to_string(),
            environment: "development".to_string(),
            advertise_address: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub grpc_port: u16,
    pub http_port: u16,
    pub enable_reflection: bool,
    pub shutdown_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            grpc_port: 50051,
            http_port: 8080,
            enable_reflection: true,
            shutdown_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty means local-only mode (in-process registry store)
    pub url: String,
    pub connect_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout_seconds: 5,
        }
    }
}

/// Service registry timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub registration_ttl_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub stale_after_seconds: i64,
    pub cleanup_after_seconds: i64,
    pub operation_timeout_seconds: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            registration_ttl_seconds: 30,
            heartbeat_interval_seconds: 15,
            stale_after_seconds: 60,
            cleanup_after_seconds: 120,
            operation_timeout_seconds: 5,
        }
    }
}

impl DiscoveryConfig {
    #[must_use]
    pub const fn registration_ttl(&self) -> Duration {
        Duration::from_secs(self.registration_ttl_seconds)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds)
    }
}

/// Inter-service client pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub dial_timeout_seconds: u64,
    pub probe_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub breaker_failure_threshold: u64,
    pub breaker_timeout_seconds: u64,
    pub health_check_interval_seconds: u64,
    pub idle_cleanup_interval_seconds: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dial_timeout_seconds: 5,
            probe_timeout_seconds: 5,
            idle_timeout_seconds: 300,
            breaker_failure_threshold: 5,
            breaker_timeout_seconds: 30,
            health_check_interval_seconds: 30,
            idle_cleanup_interval_seconds: 60,
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
            format: "json".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Lower bound applied to requested price-stream cadences
    pub min_update_interval_ms: u64,
    /// Bounded channel size between a stream handler and its transport
    pub channel_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            min_update_interval_ms: 100,
            channel_capacity: 32,
        }
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

        // MARKETSIM_SERVER__GRPC_PORT, MARKETSIM_REDIS__URL, ...
        builder = builder.add_source(
            Environment::with_prefix("MARKETSIM")
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

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.service.name.trim().is_empty() {
            errors.push("service.name must not be empty".to_string());
        }
        if self.server.grpc_port == 0 || self.server.http_port == 0 {
            errors.push("server ports must be non-zero".to_string());
        }
        if self.server.grpc_port == self.server.http_port {
            errors.push("server.grpc_port and server.http_port must differ".to_string());
        }
        if self.discovery.heartbeat_interval_seconds >= self.discovery.registration_ttl_seconds {
            errors.push(format!(
                "discovery.heartbeat_interval_seconds ({}) must be shorter than registration_ttl_seconds ({})",
                self.discovery.heartbeat_interval_seconds, self.discovery.registration_ttl_seconds
            ));
        }
        if self.client.breaker_failure_threshold == 0 {
            errors.push("client.breaker_failure_threshold must be at least 1".to_string());
        }
        if self.streaming.channel_capacity == 0 {
            errors.push("streaming.channel_capacity must be at least 1".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!("logging.format must be json or pretty, got {}", self.logging.format));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get gRPC listen address
    #[must_use]
    pub fn grpc_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.grpc_port)
    }

    /// Get HTTP listen address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Redis URL, `None` when running without a shared registry
    #[must_use]
    pub fn redis_url(&self) -> Option<&str> {
        let url = self.redis.url.trim();
        (!url.is_empty()).then_some(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.registration_ttl_seconds, 30);
        assert_eq!(config.discovery.heartbeat_interval_seconds, 15);
        assert_eq!(config.client.idle_timeout_seconds, 300);
    }

    #[test]
    fn test_addresses() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                ..ServerConfig::default()
            },
            ..Config::default()
        };

        assert_eq!(config.grpc_address(), "127.0.0.1:50051");
        assert_eq!(config.http_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_empty_redis_url_means_local_mode() {
        let mut config = Config::default();
        assert!(config.redis_url().is_some());
        config.redis.url = "  ".to_string();
        assert!(config.redis_url().is_none());
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let mut config = Config::default();
        config.server.http_port = config.server.grpc_port;
        config.discovery.heartbeat_interval_seconds = 60;
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[server]\ngrpc_port = 6000\n\n[service]\nname = \"pricing\"").unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.grpc_port, 6000);
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.service.name, "pricing");
    }
}

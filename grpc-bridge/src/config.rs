//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: `GRPC_BRIDGE_`, nested keys separated by `__`)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/grpc-bridge/{service_name}/config.toml
//! 4. System directory: /etc/grpc-bridge/{service_name}/config.toml
//! 5. Default values
//!
//! For example `GRPC_BRIDGE_RATE_LIMIT__MAX_REQUESTS=50` sets
//! `rate_limit.max_requests`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::metadata::HeaderNames;

const ENV_PREFIX: &str = "GRPC_BRIDGE_";
const CONFIG_PREFIX: &str = "grpc-bridge";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Canonical metadata header names
    #[serde(default)]
    pub headers: HeaderNames,

    /// Request logging middleware
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Request timeout middleware
    #[serde(default)]
    pub timeout: TimeoutConfig,

    /// Rate limiting middleware
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// gRPC server settings
    #[serde(default)]
    pub grpc: GrpcConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Address to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Protocol tag; prefixes generated trace ids
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

/// Logging middleware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Install the logging middleware
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Timeout middleware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Install the timeout middleware
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// Timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ms: default_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Timeout as Duration
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.ms)
    }
}

/// Rate limiting configuration
///
/// Sliding window per client key, kept in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Install the rate limiting middleware
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// Requests allowed per key within one window
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// How often idle keys are swept, in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl RateLimitConfig {
    /// Window as Duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// gRPC server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcConfig {
    /// Maximum message size in MB
    #[serde(default = "default_grpc_max_message_mb")]
    pub max_message_size_mb: usize,

    /// HTTP/2 keepalive ping interval in seconds (0 disables)
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// HTTP/2 keepalive ping timeout in seconds
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    /// Server-side request timeout in seconds (0 disables)
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,

    /// Free-form metadata reported in the server info
    #[serde(default)]
    pub metadata: std::collections::BTreeMap<String, String>,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            max_message_size_mb: default_grpc_max_message_mb(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            timeout_secs: default_request_timeout(),
            metadata: std::collections::BTreeMap::new(),
        }
    }
}

impl GrpcConfig {
    /// Get max message size in bytes
    pub fn max_message_size_bytes(&self) -> usize {
        self.max_message_size_mb * 1024 * 1024
    }

    /// Keepalive interval, `None` when disabled
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    /// Keepalive timeout
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    /// Request timeout, `None` when disabled
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    50051
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_protocol() -> String {
    "grpc".to_string()
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_requests() -> usize {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_grpc_max_message_mb() -> usize {
    4
}

fn default_keepalive_interval() -> u64 {
    60
}

fn default_keepalive_timeout() -> u64 {
    20
}

fn default_request_timeout() -> u64 {
    0
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Searches for config files in this order (first found is used):
    /// 1. Current working directory: ./config.toml
    /// 2. XDG config directory: ~/.config/grpc-bridge/{service_name}/config.toml
    /// 3. System directory: /etc/grpc-bridge/{service_name}/config.toml
    ///
    /// Environment variables (`GRPC_BRIDGE_` prefix) override all file-based configs.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| CONFIG_PREFIX.to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default_for(service_name)));

        // Lowest priority first so higher priority files override
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// Bypasses the XDG and system directories. Environment variables still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Paths searched for a service, highest priority first
    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        let xdg_dirs = xdg::BaseDirectories::with_prefix(CONFIG_PREFIX);
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Some(path) = xdg_dirs.find_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc").join(CONFIG_PREFIX).join(service_name).join("config.toml"));

        paths
    }

    /// Defaults with the given service name
    pub fn default_for(service_name: &str) -> Self {
        let mut config = Self::default();
        config.service.name = service_name.to_string();
        config
    }

    /// `host:port` the server binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.service.host, self.service.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: CONFIG_PREFIX.to_string(),
                host: default_host(),
                port: default_port(),
                log_level: default_log_level(),
                protocol: default_protocol(),
            },
            headers: HeaderNames::default(),
            logging: LoggingConfig::default(),
            timeout: TimeoutConfig::default(),
            rate_limit: RateLimitConfig::default(),
            grpc: GrpcConfig::default(),
        }
    }
}

//! Configuration for the cloud client
//!
//! Config files are stored in platform-appropriate locations:
//! - Linux: ~/.config/smartcielo/
//! - macOS: ~/Library/Application Support/smartcielo/
//! - Windows: %APPDATA%\smartcielo\
//!
//! The base URLs, origin header, and device-identity fields default to
//! the values the vendor's web client sends. They are backend
//! compatibility requirements, not tunables; override them only when
//! pointing the client at a test double.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    NoDirFound,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Account username (email)
    pub username: String,

    /// Account password (sent only as a digest, see `auth`)
    pub password: String,

    /// Source IP reported in the login payload
    pub ip_address: String,

    /// HTTP API base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// WebSocket base URL
    #[serde(default = "default_ws_base")]
    pub ws_base: String,

    /// Origin header for the socket upgrade (mandatory, the backend
    /// rejects upgrades without it)
    #[serde(default = "default_web_origin")]
    pub web_origin: String,

    /// Browser-like user agent sent on HTTP and socket requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Maximum device count requested from the directory
    #[serde(default = "default_device_limit")]
    pub device_limit: u32,

    /// Web-client identity fields for the login payload
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Challenge-solver service settings; when absent, login is
    /// attempted without a challenge token
    #[serde(default)]
    pub solver: Option<SolverConfig>,

    /// Socket lifecycle tunables
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Constant device-identity fields the backend expects from a web client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_web")]
    pub app_type: String,

    #[serde(default = "default_app_version")]
    pub app_version: String,

    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    #[serde(default = "default_device_name")]
    pub mobile_device_name: String,

    #[serde(default = "default_web")]
    pub device_type: String,

    #[serde(default = "default_web")]
    pub mobile_device_id: String,

    #[serde(default = "default_web")]
    pub device_token_id: String,

    #[serde(default = "default_is_smart_hvac")]
    pub is_smart_hvac: String,

    #[serde(default = "default_locale")]
    pub locale: String,
}

/// Challenge-solver service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Solver service API key
    pub api_key: String,

    /// Site identifier of the login page's challenge widget
    pub site_key: String,

    /// Target page URL the challenge is bound to
    pub page_url: String,

    /// Solver service base URL
    #[serde(default = "default_solver_base")]
    pub api_base: String,

    /// Delay before the first poll; the service is slow to begin
    /// processing and polling earlier is wasted traffic
    #[serde(default = "default_solver_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Fixed interval between polls
    #[serde(default = "default_solver_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Overall budget for one solve
    #[serde(default = "default_solver_timeout_ms")]
    pub timeout_ms: u64,
}

/// Socket lifecycle tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Reconnect automatically on socket loss
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Base reconnect delay; doubles per failed attempt
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Cap on the reconnect delay
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Give up after this many consecutive failed reconnects
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Socket liveness probe interval in seconds
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,

    /// Recycle the connection this many seconds before token expiry
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,

    /// Skip the proactive expiry-driven recycle. The backend keeps the
    /// socket serviceable past token expiry (observed, not guaranteed);
    /// reconnect-on-close is the safety net either way, so this is the
    /// recommended setting.
    #[serde(default = "default_true")]
    pub disable_token_refresh: bool,
}

// Default value functions
fn default_api_base() -> String {
    "https://api.smartcielo.com".to_string()
}
fn default_ws_base() -> String {
    "wss://apiwss.smartcielo.com".to_string()
}
fn default_web_origin() -> String {
    "https://home.smartcielo.com".to_string()
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/120.0.0.0 Safari/537.36"
        .to_string()
}
fn default_device_limit() -> u32 {
    420
}
fn default_web() -> String {
    "WEB".to_string()
}
fn default_app_version() -> String {
    "1.0.0".to_string()
}
fn default_time_zone() -> String {
    "America/New_York".to_string()
}
fn default_device_name() -> String {
    "chrome".to_string()
}
fn default_is_smart_hvac() -> String {
    "true".to_string()
}
fn default_locale() -> String {
    "en".to_string()
}
fn default_solver_base() -> String {
    "https://2captcha.com".to_string()
}
fn default_solver_initial_delay_ms() -> u64 {
    10_000
}
fn default_solver_poll_interval_ms() -> u64 {
    5_000
}
fn default_solver_timeout_ms() -> u64 {
    120_000
}
fn default_true() -> bool {
    true
}
fn default_reconnect_base_ms() -> u64 {
    5_000
}
fn default_reconnect_max_ms() -> u64 {
    300_000 // 5 minutes
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_health_check_secs() -> u64 {
    300 // 5 minutes
}
fn default_refresh_margin_secs() -> u64 {
    300
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            app_type: default_web(),
            app_version: default_app_version(),
            time_zone: default_time_zone(),
            mobile_device_name: default_device_name(),
            device_type: default_web(),
            mobile_device_id: default_web(),
            device_token_id: default_web(),
            is_smart_hvac: default_is_smart_hvac(),
            locale: default_locale(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            health_check_secs: default_health_check_secs(),
            refresh_margin_secs: default_refresh_margin_secs(),
            disable_token_refresh: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            ip_address: String::new(),
            api_base: default_api_base(),
            ws_base: default_ws_base(),
            web_origin: default_web_origin(),
            user_agent: default_user_agent(),
            device_limit: default_device_limit(),
            identity: IdentityConfig::default(),
            solver: None,
            connection: ConnectionConfig::default(),
        }
    }
}

impl SolverConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ConnectionConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_secs)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }
}

impl Config {
    /// Config with credentials and defaults for everything else
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        ip_address: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ip_address: ip_address.into(),
            ..Default::default()
        }
    }

    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join("smartcielo"))
            .ok_or(ConfigError::NoDirFound)
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load config from specific path
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to default location
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub adapter: AdapterConfig,

    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// MAC addresses registered at startup, before the first link pass.
    #[serde(default)]
    pub devices: Vec<String>,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdapterConfig {
    /// Object path of the local controller.
    #[serde(default = "default_adapter_path")]
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,

    /// Inbound topic carrying JSON command documents.
    #[serde(default = "default_command_topic")]
    pub command_topic: String,

    /// Outbound topic for lifecycle and sensor events.
    #[serde(default = "default_event_topic")]
    pub event_topic: String,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScanConfig {
    /// Scan duration in seconds; 0 means "until explicitly stopped".
    #[serde(default = "default_scan_duration")]
    pub duration_secs: u64,

    /// Delay between StopDiscovery and StartDiscovery when restarting
    /// discovery. The restart refreshes the adapter's advertisement
    /// cache and must not be skipped.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Connect/pair attempts before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-attempt budget for a method call plus its property flip.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Pause between failed attempts.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LogConfig {
    /// Log level when RUST_LOG and --verbose are absent.
    #[serde(default)]
    pub level: Option<String>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            path: default_adapter_path(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_mqtt_client_id(),
            command_topic: default_command_topic(),
            event_topic: default_event_topic(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_scan_duration(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_ms: default_timeout_ms(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl ScanConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl LifecycleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

// Default value functions
fn default_adapter_path() -> String {
    "/org/bluez/hci0".to_string()
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "bluehub".to_string()
}

fn default_command_topic() -> String {
    "home/ble/command".to_string()
}

fn default_event_topic() -> String {
    "home/ble/event".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_scan_duration() -> u64 {
    30
}

fn default_settle_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    8000
}

fn default_backoff_ms() -> u64 {
    2000
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("com", "bluehub", "bluehub")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the data directory path (for logs)
    pub fn data_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("com", "bluehub", "bluehub")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load config from an explicit path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(&path, contents)?;

        info!("Config saved to: {}", path.display());
        Ok(())
    }
}

/// Show current configuration
pub fn show() -> anyhow::Result<()> {
    let config = Config::load()?;
    let path = Config::config_path()?;

    println!("Config file: {}\n", path.display());
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}

//! JSON runtime configuration.
//!
//! The file holds the store credentials (`DbConfig`) and the application
//! credentials for the LoRaWAN backend (`MConfig`); everything else is optional
//! and falls back to the defaults below.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::time::Duration;
use std::{fs, io};

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const TEMPLATE_FILE: &str = "sampleConfig.json";
pub const DEFAULT_BROKER: &str = "eu.thethings.network:1883";
pub const DEFAULT_TOPIC: &str = "+/devices/+/up";
pub const DEFAULT_HISTORY_URL: &str = "https://{app}.data.thethingsnetwork.org/api/v2/query";
pub const DEFAULT_HISTORY_WINDOW: &str = "7d";
pub const DEFAULT_STATION_URL: &str = "http://weather.sun.ac.za/api/getlivedata.php?temperature&humidity&time&date";
pub const DEFAULT_STATION_NAME: &str = "Sonbesie";
pub const DEFAULT_STATION_RATE_SECS: u64 = 30;
pub const DEFAULT_STATION_UTC_OFFSET_HOURS: i32 = 2;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Json(serde_path_to_error::Error<serde_json::Error>),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error: {}", e),
            ConfigError::Json(e) => write!(f, "invalid JSON at {}: {}", e.path(), e.inner()),
            ConfigError::Invalid(s) => write!(f, "invalid configuration: {}", s),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Json(e) => Some(e.inner()),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(value: io::Error) -> Self {
        ConfigError::Io(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    pub db_config: DbConfig,
    #[serde(rename = "MConfig")]
    pub m_config: MqttConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub station: StationConfig,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DbConfig {
    pub host_address: String,
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Application credentials: `Username` is the application id, `Password` its access key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MqttConfig {
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    /// `{app}` is replaced with the application id.
    #[serde(default = "default_history_url")]
    pub history_url: String,
    #[serde(default = "default_history_window")]
    pub history_window: String,
}

impl MqttConfig {
    pub fn history_url(&self) -> String {
        self.history_url.replace("{app}", &self.username)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Match existing points on device id as well as timestamp.
    #[serde(default)]
    pub dedup_by_device: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            enabled: true,
            dedup_by_device: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StationConfig {
    #[serde(default = "default_station_url")]
    pub url: String,
    #[serde(default = "default_station_name")]
    pub name: String,
    #[serde(default = "default_station_rate_secs")]
    pub rate_secs: u64,
    /// Offset of the station's local clock from UTC.
    #[serde(default = "default_station_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

impl Default for StationConfig {
    fn default() -> Self {
        StationConfig {
            url: default_station_url(),
            name: default_station_name(),
            rate_secs: DEFAULT_STATION_RATE_SECS,
            utc_offset_hours: DEFAULT_STATION_UTC_OFFSET_HOURS,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_broker() -> String {
    DEFAULT_BROKER.to_string()
}
fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}
fn default_history_url() -> String {
    DEFAULT_HISTORY_URL.to_string()
}
fn default_history_window() -> String {
    DEFAULT_HISTORY_WINDOW.to_string()
}
fn default_station_url() -> String {
    DEFAULT_STATION_URL.to_string()
}
fn default_station_name() -> String {
    DEFAULT_STATION_NAME.to_string()
}
fn default_station_rate_secs() -> u64 {
    DEFAULT_STATION_RATE_SECS
}
fn default_station_utc_offset_hours() -> i32 {
    DEFAULT_STATION_UTC_OFFSET_HOURS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let de = &mut serde_json::Deserializer::from_str(raw);
        let cfg: Config = serde_path_to_error::deserialize(de).map_err(ConfigError::Json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.db_config.host_address.trim().is_empty() {
            return Err(ConfigError::Invalid("DbConfig.HostAddress must not be empty".into()));
        }
        if self.db_config.database.trim().is_empty() {
            return Err(ConfigError::Invalid("DbConfig.Database must not be empty".into()));
        }
        if self.m_config.username.trim().is_empty() {
            return Err(ConfigError::Invalid("MConfig.Username (application id) must not be empty".into()));
        }
        if self.station.rate_secs == 0 {
            return Err(ConfigError::Invalid("Station.RateSecs must be at least 1".into()));
        }
        if self.shutdown_grace_secs == 0 {
            return Err(ConfigError::Invalid("ShutdownGraceSecs must be at least 1".into()));
        }
        if self.station.utc_offset_hours.abs() > 23 {
            return Err(ConfigError::Invalid("Station.UtcOffsetHours must be within ±23".into()));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Placeholder configuration written by `--template`.
    pub fn sample() -> Self {
        Config {
            db_config: DbConfig {
                host_address: "localhost:5432".to_string(),
                database: "database_name".to_string(),
                username: "database_username".to_string(),
                password: "database_password".to_string(),
            },
            m_config: MqttConfig {
                username: "application_id".to_string(),
                password: "access_key".to_string(),
                broker: default_broker(),
                topic: default_topic(),
                history_url: default_history_url(),
                history_window: default_history_window(),
            },
            sync: SyncConfig::default(),
            station: StationConfig::default(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

pub fn write_template(path: &Path) -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(&Config::sample())
        .map_err(|e| ConfigError::Invalid(format!("serialising template failed: {}", e)))?;
    fs::write(path, json)?;
    Ok(())
}

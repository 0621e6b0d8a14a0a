//! Bridge settings
//!
//! Settings are read from an optional TOML file and then overridden by
//! `VALLOX_*` environment variables, so a container deployment can run on
//! environment alone while a local install can keep a file under
//! `~/.config/vallox-mqtt/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::serial::DEFAULT_PANEL_ADDRESS;

const ENV_PREFIX: &str = "VALLOX_";
const CONFIG_FILE: &str = "config.toml";
const APP_DIR: &str = "vallox-mqtt";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid MQTT url {0}")]
    InvalidUrl(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Flat bridge settings
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub serial_device: String,
    pub mqtt_url: String,
    pub mqtt_user: Option<String>,
    pub mqtt_password: Option<String>,
    /// Defaults to `device_id` when unset
    pub mqtt_client_id: Option<String>,
    pub device_id: String,
    pub device_name: String,
    pub debug: bool,
    pub enable_write: bool,
    /// Lowest speed offered by the speed selector. Not enforced on writes.
    pub speed_min: u8,
    pub enable_raw: bool,
    pub object_id: bool,
    pub new_protocol: bool,
    pub discovery_prefix: String,
    pub panel_address: u8,
    pub timing: TimingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_device: String::new(),
            mqtt_url: String::new(),
            mqtt_user: None,
            mqtt_password: None,
            mqtt_client_id: None,
            device_id: "vallox".to_string(),
            device_name: "Vallox".to_string(),
            debug: false,
            enable_write: false,
            speed_min: 1,
            enable_raw: false,
            object_id: true,
            new_protocol: false,
            discovery_prefix: "homeassistant".to_string(),
            panel_address: DEFAULT_PANEL_ADDRESS,
            timing: TimingConfig::default(),
        }
    }
}

/// Windows and delays used by the dispatcher
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Age after which an unchanged value needs re-verification
    pub freshness_threshold_secs: u64,
    pub refresh_interval_secs: u64,
    pub startup_delay_ms: u64,
    /// Quiet period after the latest speed command before writing
    pub speed_cooldown_ms: u64,
    pub speed_retry_delay_ms: u64,
    /// How long a confirmed speed suppresses identical commands
    pub speed_grace_ms: u64,
    /// Bus turnaround between a write and the confirming query
    pub bus_settle_ms: u64,
    /// How long a query counts as outstanding
    pub query_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            freshness_threshold_secs: 600,
            refresh_interval_secs: 900,
            startup_delay_ms: 1000,
            speed_cooldown_ms: 5000,
            speed_retry_delay_ms: 1000,
            speed_grace_ms: 10_000,
            bus_settle_ms: 20,
            query_timeout_ms: 10_000,
        }
    }
}

impl TimingConfig {
    pub fn freshness_threshold(&self) -> Duration {
        Duration::from_secs(self.freshness_threshold_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn speed_cooldown(&self) -> Duration {
        Duration::from_millis(self.speed_cooldown_ms)
    }

    pub fn speed_retry_delay(&self) -> Duration {
        Duration::from_millis(self.speed_retry_delay_ms)
    }

    pub fn speed_grace(&self) -> Duration {
        Duration::from_millis(self.speed_grace_ms)
    }

    pub fn bus_settle(&self) -> Duration {
        Duration::from_millis(self.bus_settle_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Broker address split out of `mqtt_url`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl Config {
    /// Loads `path` (if any) and applies environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides fields from `VALLOX_*` variables returned by `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{}", name.to_uppercase()));

        if let Some(v) = var("serial_device") {
            self.serial_device = v;
        }
        if let Some(v) = var("mqtt_url") {
            self.mqtt_url = v;
        }
        if let Some(v) = var("mqtt_user") {
            self.mqtt_user = Some(v);
        }
        if let Some(v) = var("mqtt_password") {
            self.mqtt_password = Some(v);
        }
        if let Some(v) = var("mqtt_client_id") {
            self.mqtt_client_id = Some(v);
        }
        if let Some(v) = var("device_id") {
            self.device_id = v;
        }
        if let Some(v) = var("device_name") {
            self.device_name = v;
        }
        if let Some(v) = var("discovery_prefix") {
            self.discovery_prefix = v;
        }
        if let Some(v) = var("debug") {
            self.debug = parse_bool("debug", &v)?;
        }
        if let Some(v) = var("enable_write") {
            self.enable_write = parse_bool("enable_write", &v)?;
        }
        if let Some(v) = var("enable_raw") {
            self.enable_raw = parse_bool("enable_raw", &v)?;
        }
        if let Some(v) = var("object_id") {
            self.object_id = parse_bool("object_id", &v)?;
        }
        if let Some(v) = var("new_protocol") {
            self.new_protocol = parse_bool("new_protocol", &v)?;
        }
        if let Some(v) = var("speed_min") {
            self.speed_min = parse_number("speed_min", &v)?;
        }
        if let Some(v) = var("panel_address") {
            self.panel_address = parse_number("panel_address", &v)?;
        }
        if let Some(v) = var("freshness_threshold_secs") {
            self.timing.freshness_threshold_secs = parse_number("freshness_threshold_secs", &v)?;
        }
        if let Some(v) = var("refresh_interval_secs") {
            self.timing.refresh_interval_secs = parse_number("refresh_interval_secs", &v)?;
        }
        if let Some(v) = var("startup_delay_ms") {
            self.timing.startup_delay_ms = parse_number("startup_delay_ms", &v)?;
        }
        if let Some(v) = var("speed_cooldown_ms") {
            self.timing.speed_cooldown_ms = parse_number("speed_cooldown_ms", &v)?;
        }
        if let Some(v) = var("speed_retry_delay_ms") {
            self.timing.speed_retry_delay_ms = parse_number("speed_retry_delay_ms", &v)?;
        }
        if let Some(v) = var("speed_grace_ms") {
            self.timing.speed_grace_ms = parse_number("speed_grace_ms", &v)?;
        }
        if let Some(v) = var("bus_settle_ms") {
            self.timing.bus_settle_ms = parse_number("bus_settle_ms", &v)?;
        }
        if let Some(v) = var("query_timeout_ms") {
            self.timing.query_timeout_ms = parse_number("query_timeout_ms", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial_device.is_empty() {
            return Err(ConfigError::Missing("serial_device"));
        }
        if self.mqtt_url.is_empty() {
            return Err(ConfigError::Missing("mqtt_url"));
        }
        if !(1..=crate::bus::MAX_SPEED).contains(&self.speed_min) {
            return Err(ConfigError::InvalidValue {
                key: "speed_min".to_string(),
                value: self.speed_min.to_string(),
            });
        }
        self.broker_address()?;
        Ok(())
    }

    pub fn client_id(&self) -> &str {
        match &self.mqtt_client_id {
            Some(id) if !id.is_empty() => id,
            _ => &self.device_id,
        }
    }

    /// Accepts `tcp://host:port`, `mqtt://host:port` or plain `host[:port]`
    pub fn broker_address(&self) -> Result<BrokerAddress, ConfigError> {
        let url = self.mqtt_url.trim();
        let rest = match url.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some(_) => return Err(ConfigError::InvalidUrl(url.to_string())),
            None => url,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| ConfigError::InvalidUrl(url.to_string()))?;
                (host, port)
            }
            None => (rest, 1883),
        };

        if host.is_empty() {
            return Err(ConfigError::InvalidUrl(url.to_string()));
        }

        Ok(BrokerAddress {
            host: host.to_string(),
            port,
        })
    }
}

/// `VALLOX_CONFIG`, else the per-user config file if it exists
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(format!("{ENV_PREFIX}CONFIG")) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
        .filter(|path| path.exists())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

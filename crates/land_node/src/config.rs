use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::activity::{ActivityThresholds, DEFAULT_ACTIVE_REFRESH_MS, DEFAULT_PASSIVE_AFTER_MS};
use crate::oracle::OracleConfig;

pub const DEFAULT_CONFIG_FILE_NAME: &str = "config.toml";

pub const ENV_WORLD_ID: &str = "LAND_WORLD_ID";
pub const ENV_ORACLE_URL: &str = "LAND_ORACLE_URL";
pub const ENV_ORACLE_TIMEOUT_MS: &str = "LAND_ORACLE_TIMEOUT_MS";
pub const ENV_TICK_MS: &str = "LAND_TICK_MS";
pub const ENV_SWEEP_INTERVAL_MS: &str = "LAND_SWEEP_INTERVAL_MS";
pub const ENV_WATCH_POLL_MS: &str = "LAND_WATCH_POLL_MS";
pub const ENV_STALE_WINDOW_MS: &str = "LAND_STALE_WINDOW_MS";
pub const ENV_ACTIVE_REFRESH_MS: &str = "LAND_ACTIVE_REFRESH_MS";
pub const ENV_PASSIVE_AFTER_MS: &str = "LAND_PASSIVE_AFTER_MS";

pub const DEFAULT_WORLD_ID: &str = "default";
pub const DEFAULT_ORACLE_URL: &str = "http://dqn-service.default.svc.cluster.local:8081/dqn";
pub const DEFAULT_ORACLE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_TICK_MS: u64 = 100;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_WATCH_POLL_MS: u64 = 200;
pub const DEFAULT_STALE_WINDOW_MS: i64 = 10_000;

/// Names of the four collections one world uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionNames {
    pub players: String,
    pub users: String,
    pub monsters: String,
    pub field: String,
}

impl CollectionNames {
    pub fn for_world(world_id: &str) -> Self {
        Self {
            players: format!("world-{world_id}-land-home-player-position"),
            users: format!("world-{world_id}-users"),
            monsters: format!("world-{world_id}-land-home-monster-position"),
            field: format!("world-{world_id}-land-home"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandConfig {
    pub world_id: String,
    pub collections: CollectionNames,
    pub oracle: OracleConfig,
    pub tick_ms: u64,
    pub sweep_interval_ms: u64,
    pub watch_poll_ms: u64,
    pub stale_window_ms: i64,
    pub thresholds: ActivityThresholds,
}

impl Default for LandConfig {
    fn default() -> Self {
        Self {
            world_id: DEFAULT_WORLD_ID.to_string(),
            collections: CollectionNames::for_world(DEFAULT_WORLD_ID),
            oracle: OracleConfig {
                endpoint: DEFAULT_ORACLE_URL.to_string(),
                timeout_ms: DEFAULT_ORACLE_TIMEOUT_MS,
            },
            tick_ms: DEFAULT_TICK_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            watch_poll_ms: DEFAULT_WATCH_POLL_MS,
            stale_window_ms: DEFAULT_STALE_WINDOW_MS,
            thresholds: ActivityThresholds::default(),
        }
    }
}

impl LandConfig {
    pub fn from_default_sources() -> Result<Self, ConfigError> {
        let config_path = Path::new(DEFAULT_CONFIG_FILE_NAME);
        if config_path.exists() {
            return Self::from_config_file(config_path);
        }
        Self::from_env()
    }

    /// Reads a flat table of `LAND_*` keys. Keys missing from the file fall
    /// back to the process environment.
    pub fn from_config_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|err| ConfigError::ReadConfigFile {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        let value: toml::Value =
            toml::from_str(&content).map_err(|err| ConfigError::ParseConfigFile {
                path: path.display().to_string(),
                message: err.to_string(),
            })?;
        let table = value
            .as_table()
            .ok_or_else(|| ConfigError::ParseConfigFile {
                path: path.display().to_string(),
                message: "root is not a TOML table".to_string(),
            })?;

        Self::from_env_with(|key| {
            table
                .get(key)
                .and_then(toml_value_to_string)
                .or_else(|| std::env::var(key).ok())
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    pub fn from_env_with<F>(mut getter: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let world_id = getter(ENV_WORLD_ID)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_WORLD_ID.to_string());
        let endpoint = getter(ENV_ORACLE_URL)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_ORACLE_URL.to_string());
        let timeout_ms = positive_u64(&mut getter, ENV_ORACLE_TIMEOUT_MS, DEFAULT_ORACLE_TIMEOUT_MS)?;
        let tick_ms = positive_u64(&mut getter, ENV_TICK_MS, DEFAULT_TICK_MS)?;
        let sweep_interval_ms =
            positive_u64(&mut getter, ENV_SWEEP_INTERVAL_MS, DEFAULT_SWEEP_INTERVAL_MS)?;
        let watch_poll_ms = positive_u64(&mut getter, ENV_WATCH_POLL_MS, DEFAULT_WATCH_POLL_MS)?;
        let stale_window_ms =
            positive_i64(&mut getter, ENV_STALE_WINDOW_MS, DEFAULT_STALE_WINDOW_MS)?;
        let active_refresh_ms =
            positive_i64(&mut getter, ENV_ACTIVE_REFRESH_MS, DEFAULT_ACTIVE_REFRESH_MS)?;
        let passive_after_ms =
            positive_i64(&mut getter, ENV_PASSIVE_AFTER_MS, DEFAULT_PASSIVE_AFTER_MS)?;

        Ok(Self {
            collections: CollectionNames::for_world(&world_id),
            world_id,
            oracle: OracleConfig {
                endpoint,
                timeout_ms,
            },
            tick_ms,
            sweep_interval_ms,
            watch_poll_ms,
            stale_window_ms,
            thresholds: ActivityThresholds {
                active_refresh_ms,
                passive_after_ms,
            },
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn watch_poll(&self) -> Duration {
        Duration::from_millis(self.watch_poll_ms)
    }
}

fn toml_value_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(value) => Some(value.clone()),
        toml::Value::Integer(value) => Some(value.to_string()),
        toml::Value::Float(value) => Some(value.to_string()),
        toml::Value::Boolean(value) => Some(value.to_string()),
        _ => None,
    }
}

fn positive_u64<F>(getter: &mut F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = getter(key) else {
        return Ok(default);
    };
    let parsed = value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidNumber {
            key,
            value: value.clone(),
        })?;
    if parsed == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}

fn positive_i64<F>(getter: &mut F, key: &'static str, default: i64) -> Result<i64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let default = u64::try_from(default).unwrap_or(1);
    let value = positive_u64(getter, key, default)?;
    i64::try_from(value).map_err(|_| ConfigError::InvalidValue {
        key,
        reason: format!("{value} is too large"),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidNumber { key: &'static str, value: String },
    InvalidValue { key: &'static str, reason: String },
    ReadConfigFile { path: String, message: String },
    ParseConfigFile { path: String, message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidNumber { key, value } => {
                write!(f, "invalid number for {key}: {value}")
            }
            ConfigError::InvalidValue { key, reason } => write!(f, "invalid {key}: {reason}"),
            ConfigError::ReadConfigFile { path, message } => {
                write!(f, "read config file failed ({path}): {message}")
            }
            ConfigError::ParseConfigFile { path, message } => {
                write!(f, "parse config file failed ({path}): {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

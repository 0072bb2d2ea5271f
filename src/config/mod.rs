use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::logging::LogLevel;

pub const DEFAULT_CONFIG_FILE: &str = "wukongqueue.toml";
pub const CONFIG_PATH_ARG: &str = "--config";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub wire: WireConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub accept_poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: crate::server::DEFAULT_HOST.to_owned(),
            port: crate::server::DEFAULT_PORT,
            accept_poll_interval_ms: crate::server::DEFAULT_ACCEPT_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub max_size: usize,
    pub wait_poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: crate::queue::DEFAULT_MAX_SIZE,
            wait_poll_interval_ms: crate::queue::DEFAULT_WAIT_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct WireConfig {
    pub max_frame_size_bytes: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_frame_size_bytes: crate::wire::codec::DEFAULT_MAX_FRAME_SIZE_BYTES,
        }
    }
}

/// `interval_ms = 0` turns the periodic status log off.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl AppConfig {
    /// Resolves the config file from `args`, then applies the remaining
    /// `--section.key value` pairs. Without `--config`, `./wukongqueue.toml`
    /// is used when present; otherwise only the built-in defaults apply.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let mut args = args.into_iter().collect::<Vec<_>>();

        let path = if args.first().map(String::as_str) == Some(CONFIG_PATH_ARG) {
            if args.len() < 2 {
                return Err(ConfigError::MissingValueForArg {
                    key: "config".to_owned(),
                });
            }
            let path = args.remove(1);
            args.remove(0);
            Some(PathBuf::from(path))
        } else {
            let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
            fallback.is_file().then_some(fallback)
        };

        match path {
            Some(path) => Self::load_from_toml_with_args(path, args),
            None => Self::load_defaults_with_args(args),
        }
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let path_display = path.as_ref().to_string_lossy().to_string();
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path_display.clone(),
            source,
        })?;

        let file_table = toml::from_str::<toml::Table>(&toml_content).map_err(|source| {
            ConfigError::TomlParse {
                path: path_display,
                source,
            }
        })?;

        let mut root_value = defaults_value()?;
        merge_tables(&mut root_value, Value::Table(file_table));
        Self::finish(root_value, args)
    }

    pub fn load_defaults_with_args(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        Self::finish(defaults_value()?, args)
    }

    fn finish(mut root_value: Value, args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        for (key_path, raw_value) in parse_cli_overrides(args)? {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if LogLevel::from_config_value(&self.logging.level).is_none() {
            return Err(ConfigError::InvalidSetting {
                key: "logging.level",
                reason: format!(
                    "'{}' is not one of error, warn, info, debug, verbose",
                    self.logging.level
                ),
            });
        }
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                key: "server.host",
                reason: "must not be empty".to_owned(),
            });
        }
        if !(1..=1_000).contains(&self.server.accept_poll_interval_ms) {
            return Err(ConfigError::InvalidSetting {
                key: "server.accept_poll_interval_ms",
                reason: "must be between 1 and 1000".to_owned(),
            });
        }
        if !(1..=10_000).contains(&self.queue.wait_poll_interval_ms) {
            return Err(ConfigError::InvalidSetting {
                key: "queue.wait_poll_interval_ms",
                reason: "must be between 1 and 10000".to_owned(),
            });
        }
        if self.wire.max_frame_size_bytes == 0 || self.wire.max_frame_size_bytes > u32::MAX as usize {
            return Err(ConfigError::InvalidSetting {
                key: "wire.max_frame_size_bytes",
                reason: format!("must be between 1 and {}", u32::MAX),
            });
        }
        let interval = self.heartbeat.interval_ms;
        let heartbeat_range =
            crate::heartbeat::MIN_INTERVAL_MS..=crate::heartbeat::MAX_INTERVAL_MS;
        if interval != 0 && !heartbeat_range.contains(&interval) {
            return Err(ConfigError::InvalidSetting {
                key: "heartbeat.interval_ms",
                reason: format!(
                    "must be 0 (disabled) or between {} and {}",
                    heartbeat_range.start(),
                    heartbeat_range.end()
                ),
            });
        }

        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Defaults(toml::ser::Error),
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidSetting {
        key: &'static str,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Defaults(source) => write!(f, "failed to render default config: {source}"),
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidSetting { key, reason } => write!(f, "invalid setting '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn defaults_value() -> Result<Value, ConfigError> {
    Value::try_from(AppConfig::default()).map_err(ConfigError::Defaults)
}

// Keys from `overlay` win; nested tables merge key by key.
fn merge_tables(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_tables(existing, overlay_value),
                    None => {
                        base_table.insert(key, overlay_value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }
    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        current = current
            .as_table_mut()
            .and_then(|table| table.get_mut(*section))
            .ok_or_else(unknown)?;
    }

    let final_key = parts[parts.len() - 1];
    let current_value = current
        .as_table_mut()
        .and_then(|table| table.get_mut(final_key))
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}

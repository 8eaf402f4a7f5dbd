use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

pub const DISCOVERED_CONFIG_FILE: &str = "cluster-node.toml";
pub const CONFIG_PATH_ARG: &str = "--config";

/// Built-in document used when no file is given or discovered. CLI overrides
/// are resolved against it, so every key listed here can be overridden.
pub const DEFAULT_CONFIG_TOML: &str = r#"
[logging]
level = "info"
human_friendly = false

[server]
host = "127.0.0.1"
port = 7170
socket_threads = 4
handler_threads = 4
socket_backlog = 0
handler_backlog = 256
accept_poll_ms = 100
pause_poll_ms = 500
queue_poll_ms = 500
dispatch_attempts = 100
alarm_interval_ms = 86400000
max_frame_bytes = 8388608

[claim_check]
housekeeping_interval_ms = 10000
memory_rule = "used_above"
memory_fraction = 0.85
"#;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub claim_check: ClaimCheckConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub socket_threads: usize,
    pub handler_threads: usize,
    pub socket_backlog: usize,
    pub handler_backlog: usize,
    pub accept_poll_ms: u64,
    pub pause_poll_ms: u64,
    pub queue_poll_ms: u64,
    pub dispatch_attempts: u32,
    pub alarm_interval_ms: u64,
    pub max_frame_bytes: usize,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ClaimCheckConfig {
    pub housekeeping_interval_ms: u64,
    pub memory_rule: String,
    pub memory_fraction: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::load_from_str_with_args(DEFAULT_CONFIG_TOML, "<built-in>", Vec::<String>::new())
            .unwrap_or_else(|_| Self {
                logging: LoggingConfig {
                    level: "info".to_owned(),
                    human_friendly: false,
                },
                server: ServerConfig {
                    host: "127.0.0.1".to_owned(),
                    port: 7170,
                    socket_threads: 4,
                    handler_threads: 4,
                    socket_backlog: 0,
                    handler_backlog: 256,
                    accept_poll_ms: 100,
                    pause_poll_ms: 500,
                    queue_poll_ms: 500,
                    dispatch_attempts: 100,
                    alarm_interval_ms: 86_400_000,
                    max_frame_bytes: 8 * 1024 * 1024,
                },
                claim_check: ClaimCheckConfig {
                    housekeeping_interval_ms: 10_000,
                    memory_rule: "used_above".to_owned(),
                    memory_fraction: 0.85,
                },
            })
    }
}

impl AppConfig {
    /// Resolves the configuration source from argv: an explicit leading
    /// `--config <path>`, else `./cluster-node.toml` when it exists, else the
    /// built-in defaults. Remaining arguments are `--section.key value` overrides.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut args: Vec<String> = args.into_iter().collect();

        let explicit_path = if args.first().map(String::as_str) == Some(CONFIG_PATH_ARG) {
            if args.len() < 2 {
                return Err(ConfigError::MissingValueForArg {
                    key: "config".to_owned(),
                });
            }
            let path = args.remove(1);
            args.remove(0);
            Some(PathBuf::from(path))
        } else {
            None
        };

        if let Some(path) = explicit_path {
            return Self::load_from_toml_with_args(path, args);
        }

        let discovered = PathBuf::from(DISCOVERED_CONFIG_FILE);
        if discovered.is_file() {
            return Self::load_from_toml_with_args(discovered, args);
        }

        Self::load_from_str_with_args(DEFAULT_CONFIG_TOML, "<built-in>", args)
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let origin = path.as_ref().to_string_lossy().to_string();
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: origin.clone(),
            source,
        })?;

        Self::load_from_str_with_args(&toml_content, &origin, args)
    }

    pub fn load_from_str_with_args(
        toml_content: &str,
        origin: &str,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut root_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: origin.to_owned(),
                    source,
                })?;

        for (key_path, raw_value) in parse_cli_overrides(args)? {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        root_value.try_into().map_err(ConfigError::Deserialize)
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
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI argument '--{key}'")
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
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let key = match arg.strip_prefix("--") {
            Some(stripped) if !stripped.is_empty() => stripped.to_owned(),
            _ => return Err(ConfigError::InvalidArgFormat { arg }),
        };

        let value = iter
            .next()
            .ok_or_else(|| ConfigError::MissingValueForArg { key: key.clone() })?;
        parsed.push((key, value));
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
    for part in &parts {
        current = current
            .as_table_mut()
            .ok_or_else(unknown)?
            .get_mut(*part)
            .ok_or_else(unknown)?;
    }

    *current = retype_like(key_path, raw_value, current)?;
    Ok(())
}

fn retype_like(key_path: &str, raw_value: &str, existing: &Value) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match existing {
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

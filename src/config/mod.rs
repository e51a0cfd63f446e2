//! Configuration layer: typed settings with layered precedence
//! (file → env → programmatic overrides).

use std::{path::Path, str::FromStr, time::Duration};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "quarry";
const ENV_PREFIX: &str = "QUARRY";
const DEFAULT_REDUCER_PATH: &str = "api";
const DEFAULT_KEEP_UNUSED_DATA_FOR_SECS: u64 = 60;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub reducer_path: String,
    pub keep_unused_data_for: Duration,
    pub refetch_on_mount_or_arg_change: Option<Duration>,
}

/// Programmatic overrides; applied after the file and environment layers.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    /// Base log level (trace|debug|info|warn|error).
    pub log_level: Option<String>,
    /// Toggle JSON logging.
    pub log_json: Option<bool>,
    pub reducer_path: Option<String>,
    pub keep_unused_data_for_seconds: Option<u64>,
    pub refetch_on_mount_or_arg_change_seconds: Option<u64>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → overrides).
///
/// `config/default.toml` and `quarry.toml` are optional; `config_file`, when
/// given, must exist. Environment variables use the `QUARRY__` prefix with
/// `__` between sections, e.g. `QUARRY__CACHE__KEEP_UNUSED_DATA_FOR_SECONDS`.
pub fn load(
    config_file: Option<&Path>,
    overrides: &SettingsOverrides,
) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &SettingsOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(path) = overrides.reducer_path.as_ref() {
            self.cache.reducer_path = Some(path.clone());
        }
        if let Some(seconds) = overrides.keep_unused_data_for_seconds {
            self.cache.keep_unused_data_for_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.refetch_on_mount_or_arg_change_seconds {
            self.cache.refetch_on_mount_or_arg_change_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let reducer_path = cache
        .reducer_path
        .unwrap_or_else(|| DEFAULT_REDUCER_PATH.to_string());
    let reducer_path = reducer_path.trim();
    if reducer_path.is_empty() {
        return Err(LoadError::invalid(
            "cache.reducer_path",
            "must not be empty",
        ));
    }

    let keep_unused_data_for = Duration::from_secs(
        cache
            .keep_unused_data_for_seconds
            .unwrap_or(DEFAULT_KEEP_UNUSED_DATA_FOR_SECS),
    );
    let refetch_on_mount_or_arg_change = cache
        .refetch_on_mount_or_arg_change_seconds
        .map(Duration::from_secs);

    Ok(CacheSettings {
        reducer_path: reducer_path.to_string(),
        keep_unused_data_for,
        refetch_on_mount_or_arg_change,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    reducer_path: Option<String>,
    keep_unused_data_for_seconds: Option<u64>,
    refetch_on_mount_or_arg_change_seconds: Option<u64>,
}

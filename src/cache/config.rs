//! Engine configuration.
//!
//! Eviction and freshness defaults for every endpoint of an [`super::Api`].

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_REDUCER_PATH: &str = "api";
const DEFAULT_KEEP_UNUSED_DATA_FOR_SECONDS: u64 = 60;

/// Engine configuration, usually built from `quarry.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Name of the state slice; shows up in logs.
    pub reducer_path: String,
    /// Seconds an unsubscribed entry survives before eviction.
    pub keep_unused_data_for_seconds: u64,
    /// Maximum age of a fulfilled entry before `initiate` refetches it.
    pub refetch_on_mount_or_arg_change_seconds: Option<u64>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            reducer_path: DEFAULT_REDUCER_PATH.to_string(),
            keep_unused_data_for_seconds: DEFAULT_KEEP_UNUSED_DATA_FOR_SECONDS,
            refetch_on_mount_or_arg_change_seconds: None,
        }
    }
}

impl From<&crate::config::CacheSettings> for ApiConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            reducer_path: settings.reducer_path.clone(),
            keep_unused_data_for_seconds: settings.keep_unused_data_for.as_secs(),
            refetch_on_mount_or_arg_change_seconds: settings
                .refetch_on_mount_or_arg_change
                .map(|age| age.as_secs()),
        }
    }
}

impl ApiConfig {
    pub fn keep_unused_data_for(&self) -> Duration {
        Duration::from_secs(self.keep_unused_data_for_seconds)
    }

    pub fn refetch_on_mount_or_arg_change(&self) -> Option<Duration> {
        self.refetch_on_mount_or_arg_change_seconds
            .map(Duration::from_secs)
    }
}

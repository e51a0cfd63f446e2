//! Runtime bootstrap: tracing subscriber and metric descriptions.

use std::path::Path;

use crate::config::{self, Settings, SettingsOverrides};

pub mod error;
pub mod telemetry;

use error::InfraError;

/// Load settings and install the tracing subscriber they describe.
pub fn bootstrap(
    config_file: Option<&Path>,
    overrides: &SettingsOverrides,
) -> Result<Settings, InfraError> {
    let settings = config::load(config_file, overrides)?;
    telemetry::init(&settings.logging)?;
    Ok(settings)
}

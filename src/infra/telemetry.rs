use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Directives here (e.g. `quarry::cache=trace`) refine `logging.level`.
const FILTER_ENV: &str = "QUARRY_LOG";

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "quarry_cache_hit_total",
            Unit::Count,
            "Total number of initiates served from fresh cached data."
        );
        describe_counter!(
            "quarry_cache_miss_total",
            Unit::Count,
            "Total number of initiates that started a new request."
        );
        describe_counter!(
            "quarry_request_coalesced_total",
            Unit::Count,
            "Total number of initiates that joined an in-flight request."
        );
        describe_counter!(
            "quarry_cache_evict_total",
            Unit::Count,
            "Total number of unused cache entries evicted."
        );
        describe_counter!(
            "quarry_tags_invalidated_total",
            Unit::Count,
            "Total number of cache entries hit by tag invalidation."
        );
        describe_counter!(
            "quarry_hook_failure_total",
            Unit::Count,
            "Total number of lifecycle hooks that failed or panicked."
        );
        describe_histogram!(
            "quarry_fetch_ms",
            Unit::Milliseconds,
            "Fetch function latency in milliseconds."
        );
    });
}

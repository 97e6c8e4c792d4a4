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

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
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

pub(crate) fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "sitecache_page_hit_total",
            Unit::Count,
            "Total number of requests served from a stored page."
        );
        describe_counter!(
            "sitecache_page_miss_total",
            Unit::Count,
            "Total number of cacheable requests that ran the origin."
        );
        describe_counter!(
            "sitecache_page_bypass_total",
            Unit::Count,
            "Total number of requests the gate refused to cache, by reason."
        );
        describe_counter!(
            "sitecache_page_store_total",
            Unit::Count,
            "Total number of captured pages written to disk."
        );
        describe_counter!(
            "sitecache_page_store_failed_total",
            Unit::Count,
            "Total number of captured pages that could not be written."
        );
        describe_counter!(
            "sitecache_purge_total",
            Unit::Count,
            "Total number of purges, by scope."
        );
        describe_counter!(
            "sitecache_sweep_evicted_total",
            Unit::Count,
            "Total number of expired pages removed by the sweeper."
        );
        describe_histogram!(
            "sitecache_sweep_ms",
            Unit::Milliseconds,
            "Expiry sweep latency in milliseconds."
        );
        describe_counter!(
            "sitecache_object_cache_flush_total",
            Unit::Count,
            "Total number of object cache flushes, by result."
        );
    });
}

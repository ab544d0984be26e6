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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "hoard_cache_hit_total",
            Unit::Count,
            "Total number of reads answered from stored metadata."
        );
        describe_counter!(
            "hoard_cache_miss_total",
            Unit::Count,
            "Total number of reads that found nothing usable stored."
        );
        describe_counter!(
            "hoard_cache_evicted_entity_total",
            Unit::Count,
            "Total number of reads whose metadata pointed at an evicted entity."
        );
        describe_counter!(
            "hoard_save_committed_total",
            Unit::Count,
            "Total number of saves committed."
        );
        describe_counter!(
            "hoard_save_aborted_total",
            Unit::Count,
            "Total number of saves that lost a race for their key."
        );
        describe_counter!(
            "hoard_save_skipped_total",
            Unit::Count,
            "Total number of responses too large to store."
        );
        describe_counter!(
            "hoard_entity_gc_scheduled_total",
            Unit::Count,
            "Total number of entity collections scheduled."
        );
        describe_counter!(
            "hoard_upstream_error_total",
            Unit::Count,
            "Total number of origin requests that failed, by answered status."
        );
        describe_histogram!(
            "hoard_upstream_fetch_ms",
            Unit::Milliseconds,
            "Time until the origin response head arrived, in milliseconds."
        );
        describe_counter!(
            "hoard_jobs_enqueued_total",
            Unit::Count,
            "Total number of background jobs enqueued, by job type."
        );
        describe_counter!(
            "hoard_jobs_failed_total",
            Unit::Count,
            "Total number of background job attempts that failed, by job type."
        );
    });
}

//! Metrics for source operations and reading.
//!
//! Instruments are taken from the global OpenTelemetry meter. Until
//! [`initialize_metrics`] is called that meter is a no-op, so the
//! rest of the crate can record unconditionally.

use std::sync::OnceLock;

use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    sdk::metrics::{Aggregation, Instrument, MeterProvider, Stream},
    KeyValue,
};
use prometheus::default_registry;

use crate::errors::SourceError;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Upper bounds, in seconds, of the buckets used by every
/// `*duration*` histogram.
const DURATION_BUCKETS: [f64; 16] = [
    0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

static METRICS_INSTALLED: OnceLock<Result<(), String>> = OnceLock::new();

/// Export this crate's instruments through the Prometheus default
/// registry, under the `flowsource` namespace.
///
/// The provider is installed once per process; later calls return the
/// outcome of the first. Instruments created before the first call
/// stay no-ops.
pub fn initialize_metrics() -> Result<(), SourceError> {
    METRICS_INSTALLED
        .get_or_init(install_meter_provider)
        .clone()
        .map_err(SourceError::Setup)
}

fn install_meter_provider() -> Result<(), String> {
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(default_registry().clone())
        .with_namespace("flowsource")
        .build()
        .map_err(|err| err.to_string())?;
    let durations = opentelemetry_sdk::metrics::new_view(
        Instrument::new().name("*duration*"),
        Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
            boundaries: DURATION_BUCKETS.to_vec(),
            record_min_max: true,
        }),
    )
    .map_err(|err| err.to_string())?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(durations)
        .build();
    global::set_meter_provider(provider);
    tracing::debug!("Installed Prometheus meter provider");
    Ok(())
}

/// Instruments shared by the reader iterators and the source
/// operation executor.
#[derive(Clone)]
pub struct ReadMetrics {
    pub(crate) records_read: Counter<u64>,
    pub(crate) split_requests: Counter<u64>,
    pub(crate) splits_granted: Counter<u64>,
    pub(crate) bundles_created: Counter<u64>,
    pub(crate) checkpoints_committed: Counter<u64>,
    pub(crate) operation_duration: Histogram<f64>,
}

impl ReadMetrics {
    pub fn new() -> Self {
        let meter = global::meter("flowsource");
        Self {
            records_read: meter
                .u64_counter("records_read")
                .with_description("number of records produced by source readers")
                .init(),
            split_requests: meter
                .u64_counter("dynamic_split_requests")
                .with_description("number of dynamic split requests received")
                .init(),
            splits_granted: meter
                .u64_counter("dynamic_splits_granted")
                .with_description("number of dynamic split requests a reader accepted")
                .init(),
            bundles_created: meter
                .u64_counter("bundles_created")
                .with_description("number of bundles produced by static splitting")
                .init(),
            checkpoints_committed: meter
                .u64_counter("checkpoints_committed")
                .with_description("number of unbounded checkpoint marks persisted")
                .init(),
            operation_duration: meter
                .f64_histogram("source_operation_duration_seconds")
                .with_description("source operation request duration in seconds")
                .init(),
        }
    }
}

impl Default for ReadMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReadMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReadMetrics")
    }
}

pub(crate) fn kind_label(kind: &'static str) -> [KeyValue; 1] {
    [KeyValue::new("kind", kind)]
}

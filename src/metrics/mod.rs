// Transformation service Prometheus metrics
//
// Registered once in the default registry. Exported with `render()`.

use std::sync::OnceLock;
use std::time::Instant;

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder, Histogram,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

/// Global transformation metrics
pub struct TransformMetrics {
    /// Requests answered from the ledger
    pub cache_hits: IntCounter,

    /// Requests that had to run the pipeline (or wait for one)
    pub cache_misses: IntCounter,

    /// Pipeline executions, including ones that lost the record race
    pub pipeline_runs: IntCounter,

    /// Pipeline results discarded because another writer recorded first
    pub race_losses: IntCounter,

    /// Derived objects deleted after losing a race or failing to record
    pub orphan_deletions: IntCounter,

    /// Uploads accepted
    pub uploads: IntCounter,

    /// Failed operations by error kind
    pub errors: IntCounterVec,

    /// Pipeline duration in seconds, by output format
    pub pipeline_duration: HistogramVec,

    /// End-to-end operation duration in seconds, by operation
    pub request_duration: HistogramVec,
}

static METRICS: OnceLock<TransformMetrics> = OnceLock::new();

impl TransformMetrics {
    /// Initialize on first use and return the global instance
    pub fn global() -> &'static Self {
        METRICS.get_or_init(|| {
            let cache_ops = register_int_counter_vec!(
                "chayachitr_transform_cache_total",
                "Transformation lookups by result",
                &["result"] // hit, miss
            )
            .expect("Failed to register transform_cache_total metric");

            let pipeline_runs = register_int_counter!(
                "chayachitr_pipeline_runs_total",
                "Total number of pipeline executions"
            )
            .expect("Failed to register pipeline_runs_total metric");

            let race_losses = register_int_counter!(
                "chayachitr_record_race_losses_total",
                "Transformations discarded because a concurrent writer recorded first"
            )
            .expect("Failed to register record_race_losses_total metric");

            let orphan_deletions = register_int_counter!(
                "chayachitr_orphan_deletions_total",
                "Derived objects deleted because they were never recorded"
            )
            .expect("Failed to register orphan_deletions_total metric");

            let uploads = register_int_counter!(
                "chayachitr_uploads_total",
                "Total number of accepted uploads"
            )
            .expect("Failed to register uploads_total metric");

            let errors = register_int_counter_vec!(
                "chayachitr_errors_total",
                "Failed operations by error kind",
                &["kind"]
            )
            .expect("Failed to register errors_total metric");

            let pipeline_duration = register_histogram_vec!(
                "chayachitr_pipeline_duration_seconds",
                "Duration of pipeline executions in seconds",
                &["format"],
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
            )
            .expect("Failed to register pipeline_duration_seconds metric");

            let request_duration = register_histogram_vec!(
                "chayachitr_request_duration_seconds",
                "Duration of service operations in seconds",
                &["operation"], // transform, upload, get_image, list_images
                vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
            )
            .expect("Failed to register request_duration_seconds metric");

            TransformMetrics {
                cache_hits: cache_ops.with_label_values(&["hit"]),
                cache_misses: cache_ops.with_label_values(&["miss"]),
                pipeline_runs,
                race_losses,
                orphan_deletions,
                uploads,
                errors,
                pipeline_duration,
                request_duration,
            }
        })
    }

    pub fn record_error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }

    pub fn start_request_timer(&self, operation: &str) -> HistogramTimer {
        HistogramTimer {
            histogram: self.request_duration.with_label_values(&[operation]),
            start: Instant::now(),
        }
    }

    pub fn start_pipeline_timer(&self, format: &str) -> HistogramTimer {
        HistogramTimer {
            histogram: self.pipeline_duration.with_label_values(&[format]),
            start: Instant::now(),
        }
    }
}

/// Records the elapsed time into its histogram when dropped
pub struct HistogramTimer {
    histogram: Histogram,
    start: Instant,
}

impl HistogramTimer {
    pub fn observe_duration(self) {
        drop(self)
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

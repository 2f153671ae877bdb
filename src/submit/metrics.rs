use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts};

struct SubmitterMetrics {
    requests: CounterVec,
    duration: HistogramVec,
}

static METRICS: OnceLock<SubmitterMetrics> = OnceLock::new();

/// Registers submitter metrics once per process when a prometheus presenter
/// is attached. Safe to call repeatedly.
pub(crate) fn register(monitor: &dyn crate::metrics::Service) -> Result<()> {
    if METRICS.get().is_some() {
        // Already registered.
        return Ok(());
    }

    if monitor.presenter() != "prometheus" {
        return Ok(());
    }

    let requests = CounterVec::new(
        Opts::new("requests_total", "Total number of requests submitted.")
            .namespace("probec")
            .subsystem("submitter"),
        &["operation", "result"],
    )?;
    prometheus::register(Box::new(requests.clone()))?;

    let duration = HistogramVec::new(
        HistogramOpts::new("duration_seconds", "The time spent submitting data.")
            .namespace("probec")
            .subsystem("submitter")
            .buckets(crate::metrics::submission_buckets()),
        &["operation"],
    )?;
    prometheus::register(Box::new(duration.clone()))?;

    let _ = METRICS.set(SubmitterMetrics { requests, duration });

    Ok(())
}

/// Records the outcome of one submission attempt.
pub(crate) fn submission(operation: &str, succeeded: bool, elapsed: Duration) {
    let Some(m) = METRICS.get() else {
        return;
    };

    if succeeded {
        m.requests
            .with_label_values(&[operation, "succeeded"])
            .inc();
        m.duration
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    } else {
        m.requests.with_label_values(&[operation, "failed"]).inc();
    }
}

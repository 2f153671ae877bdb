pub mod attestations;
pub mod blocks;
pub mod heads;

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, Opts};

/// Instruments shared by every observer: event delay from slot start, the
/// wall-clock receipt timestamp and a received-event counter.
pub(crate) struct EventMetrics {
    delay: Histogram,
    latest_timestamp: Gauge,
    events: IntCounter,
}

impl EventMetrics {
    fn new(subsystem: &str, delay_help: &str) -> Result<Self> {
        let delay = Histogram::with_opts(
            HistogramOpts::new("delay_seconds", delay_help)
                .namespace("probec")
                .subsystem(subsystem)
                .buckets(crate::metrics::delay_buckets()),
        )?;
        prometheus::register(Box::new(delay.clone()))?;

        let latest_timestamp = Gauge::with_opts(
            Opts::new(
                "latest_timestamp",
                format!("The latest timestamp at which probec obtained a {subsystem} event."),
            )
            .namespace("probec")
            .subsystem(subsystem),
        )?;
        prometheus::register(Box::new(latest_timestamp.clone()))?;

        let events = IntCounter::with_opts(
            Opts::new(
                "events_total",
                format!("The number of {subsystem} events received."),
            )
            .namespace("probec")
            .subsystem(subsystem),
        )?;
        prometheus::register(Box::new(events.clone()))?;

        Ok(Self {
            delay,
            latest_timestamp,
            events,
        })
    }

    /// Records one received event and its delay from slot start.
    fn event_processed(&self, delay_ms: i64) {
        self.latest_timestamp.set(unix_now_secs());
        self.events.inc();
        self.delay.observe(delay_ms as f64 / 1000.0);
    }
}

/// Registers an observer's metrics once per process when a prometheus
/// presenter is attached. Safe to call repeatedly.
pub(crate) fn register_event_metrics(
    cell: &OnceLock<EventMetrics>,
    monitor: &dyn crate::metrics::Service,
    subsystem: &str,
    delay_help: &str,
) -> Result<()> {
    if cell.get().is_some() {
        // Already registered.
        return Ok(());
    }

    if monitor.presenter() != "prometheus" {
        return Ok(());
    }

    let _ = cell.set(EventMetrics::new(subsystem, delay_help)?);

    Ok(())
}

pub(crate) fn monitor_event_processed(cell: &OnceLock<EventMetrics>, delay_ms: i64) {
    if let Some(m) = cell.get() {
        m.event_processed(delay_ms);
    }
}

fn unix_now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

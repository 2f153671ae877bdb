pub mod prometheus;

/// Monitor capability handed to every service at construction.
///
/// Services inspect the presenter name to decide whether to register their
/// metrics; with no presenter attached, observation calls are no-ops.
pub trait Service: Send + Sync {
    /// Name of the presentation layer, e.g. "prometheus".
    fn presenter(&self) -> &'static str;
}

/// Monitor that discards all observations.
pub struct Null;

impl Null {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Null {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for Null {
    fn presenter(&self) -> &'static str {
        "null"
    }
}

/// Delay histogram buckets: 0.1s through 12.0s in 0.1s steps.
pub(crate) fn delay_buckets() -> Vec<f64> {
    (1..=120).map(|i| f64::from(i) / 10.0).collect()
}

/// Submission duration buckets: 0.1s through 4.0s in 0.1s steps.
pub(crate) fn submission_buckets() -> Vec<f64> {
    (1..=40).map(|i| f64::from(i) / 10.0).collect()
}

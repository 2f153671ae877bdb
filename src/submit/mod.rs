pub mod console;
pub mod immediate;
mod metrics;

/// Dispatches measurement records to the configured downstream collectors.
///
/// Every operation returns immediately; delivery happens in the background,
/// one attempt per collector per call, with no retries and no ordering
/// guarantee.
pub trait Submitter: Send + Sync {
    /// Submits a block delay data point.
    fn submit_block_delay(&self, body: String);

    /// Submits a head delay data point.
    fn submit_head_delay(&self, body: String);

    /// Submits an aggregate attestation data point.
    fn submit_aggregate_attestation(&self, body: String);

    /// Submits a summary of attestation data points.
    fn submit_attestation_summary(&self, body: String);
}

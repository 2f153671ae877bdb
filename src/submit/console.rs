use std::time::Duration;

use anyhow::{Context, Result};

use super::{metrics, Submitter};

/// Submitter that prints record bodies to stdout instead of POSTing them.
/// Debugging aid only.
pub struct ConsoleSubmitter;

impl ConsoleSubmitter {
    pub fn new(monitor: &dyn crate::metrics::Service) -> Result<Self> {
        metrics::register(monitor).context("failed to register metrics")?;

        Ok(Self)
    }

    fn print(&self, operation: &'static str, body: String) {
        println!("{body}");
        metrics::submission(operation, true, Duration::ZERO);
    }
}

impl Submitter for ConsoleSubmitter {
    fn submit_block_delay(&self, body: String) {
        self.print("block delay", body);
    }

    fn submit_head_delay(&self, body: String) {
        self.print("head delay", body);
    }

    fn submit_aggregate_attestation(&self, body: String) {
        self.print("aggregate attestation", body);
    }

    fn submit_attestation_summary(&self, body: String) {
        self.print("attestation summary", body);
    }
}

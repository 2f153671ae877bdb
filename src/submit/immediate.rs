use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{metrics, Submitter};

/// Submitter that POSTs every record to every collector as soon as it
/// arrives. One concurrent attempt per collector; failures are counted and
/// dropped.
#[derive(Debug)]
pub struct ImmediateSubmitter {
    base_urls: Vec<String>,
    http: reqwest::Client,
    cancel: CancellationToken,
}

impl ImmediateSubmitter {
    /// Creates a submitter for the given collector base URLs. URLs are
    /// validated and trimmed of a trailing `/`.
    pub fn new(
        monitor: &dyn crate::metrics::Service,
        base_urls: &[String],
        cancel: CancellationToken,
    ) -> Result<Self> {
        metrics::register(monitor).context("failed to register metrics")?;

        if base_urls.is_empty() {
            bail!("base URL not supplied");
        }

        let mut urls = Vec::with_capacity(base_urls.len());
        for url in base_urls {
            let parsed = reqwest::Url::parse(url).with_context(|| format!("invalid base URL {url}"))?;
            urls.push(parsed.to_string().trim_end_matches('/').to_string());
        }

        let http = reqwest::Client::new();

        Ok(Self {
            base_urls: urls,
            http,
            cancel,
        })
    }

    pub fn base_urls(&self) -> &[String] {
        &self.base_urls
    }

    /// Launches one POST per collector and returns without waiting.
    fn dispatch(&self, operation: &'static str, path: &'static str, body: String) {
        if self.cancel.is_cancelled() {
            return;
        }

        for base_url in &self.base_urls {
            let url = format!("{base_url}{path}");
            let http = self.http.clone();
            let body = body.clone();
            let cancel = self.cancel.clone();

            tokio::spawn(async move {
                let started = Instant::now();

                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(anyhow::anyhow!("submission cancelled")),
                    r = post_record(&http, &url, body) => r,
                };

                match result {
                    Ok(()) => metrics::submission(operation, true, started.elapsed()),
                    Err(e) => {
                        metrics::submission(operation, false, started.elapsed());
                        warn!(url = %url, error = %e, "failed to submit {operation}");
                    }
                }
            });
        }
    }
}

/// Sends one record; success is a 2xx response with the body drained.
async fn post_record(http: &reqwest::Client, url: &str, body: String) -> Result<()> {
    let response = http
        .post(url)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .context("sending request")?;

    let status = response.status();

    // Drain the body for connection reuse.
    response.bytes().await.context("reading response body")?;

    if !status.is_success() {
        bail!("unexpected status {status}");
    }

    Ok(())
}

impl Submitter for ImmediateSubmitter {
    fn submit_block_delay(&self, body: String) {
        self.dispatch("block delay", "/v1/blockdelay", body);
    }

    fn submit_head_delay(&self, body: String) {
        self.dispatch("head delay", "/v1/headdelay", body);
    }

    fn submit_aggregate_attestation(&self, body: String) {
        self.dispatch("aggregate attestation", "/v1/aggregateattestation", body);
    }

    fn submit_attestation_summary(&self, body: String) {
        self.dispatch("attestation summary", "/v1/attestationsummary", body);
    }
}

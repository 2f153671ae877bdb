use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::beacon::pool::ClientPool;
use crate::beacon::{Client, NodeVersionProvider};
use crate::chaintime::ChainTime;
use crate::config::{Config, SubmitterStyle};
use crate::metrics;
use crate::observe::attestations::AttestationObserver;
use crate::observe::blocks::BlockObserver;
use crate::observe::heads::HeadObserver;
use crate::submit::console::ConsoleSubmitter;
use crate::submit::immediate::ImmediateSubmitter;
use crate::submit::Submitter;

/// Agent wires the services together: monitor, submitter, consensus clients,
/// chain time and the enabled observers.
pub struct Agent {
    cfg: Config,
    pool: Option<ClientPool>,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            pool: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Starts every service. Any failure here is fatal to the process.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Metrics monitor.
        let monitor: Arc<dyn metrics::Service> = match &self.cfg.metrics.prometheus.listen_address
        {
            Some(addr) if !addr.is_empty() => {
                let service = metrics::prometheus::Service::new(addr);
                service
                    .start(self.cancel.child_token())
                    .await
                    .context("failed to start prometheus metrics service")?;
                info!(listen_address = %addr, "started prometheus metrics service");
                Arc::new(service)
            }
            _ => {
                debug!("no metrics service supplied; monitor not starting");
                Arc::new(metrics::Null)
            }
        };

        // 2. Submitter.
        let submitter: Arc<dyn Submitter> = match self.cfg.submitter.style {
            SubmitterStyle::Console => Arc::new(
                ConsoleSubmitter::new(monitor.as_ref()).context("failed to start submitter")?,
            ),
            SubmitterStyle::Immediate => Arc::new(
                ImmediateSubmitter::new(
                    monitor.as_ref(),
                    &self.cfg.submitter.base_urls(),
                    self.cancel.child_token(),
                )
                .context("failed to start submitter")?,
            ),
        };

        // 3. Consensus clients. Every upstream must answer a version probe;
        // the event-stream capability is checked when observers subscribe.
        let pool = ClientPool::new(
            self.cfg.consensus_client.timeout,
            self.cancel.child_token(),
        );

        let mut providers: HashMap<String, Arc<Client>> = HashMap::new();
        let mut first_client: Option<Arc<Client>> = None;

        for address in &self.cfg.consensus_client.addresses {
            let client = pool
                .client(address)
                .with_context(|| format!("failed to initiate client for {address}"))?;

            let version = client
                .node_version()
                .await
                .with_context(|| format!("{address} does not provide a node version"))?;
            info!(address = %address, version = %version, "connected to consensus node");

            first_client.get_or_insert_with(|| Arc::clone(&client));
            providers.insert(address.clone(), client);
        }

        let Some(first_client) = first_client else {
            bail!("no consensus client addresses provided");
        };

        self.pool = Some(pool);

        // 4. Chain time, anchored to the first upstream.
        let chain_time = Arc::new(
            ChainTime::new(first_client.as_ref())
                .await
                .context("failed to create chain time service")?,
        );
        info!(
            genesis_time = ?chain_time.genesis_time(),
            current_slot = chain_time.current_slot(),
            "chain time initialised",
        );

        // 5. Observers.
        if self.cfg.blocks.enable {
            debug!("starting blocks service");
            BlockObserver::new(
                monitor.as_ref(),
                Arc::clone(&chain_time),
                &providers,
                Arc::clone(&submitter),
            )
            .await
            .context("failed to start blocks service")?;
        }

        if self.cfg.heads.enable {
            debug!("starting heads service");
            HeadObserver::new(
                monitor.as_ref(),
                Arc::clone(&chain_time),
                &providers,
                Arc::clone(&submitter),
            )
            .await
            .context("failed to start heads service")?;
        }

        if self.cfg.attestations.enable {
            debug!("starting attestations service");
            AttestationObserver::new(
                monitor.as_ref(),
                Arc::clone(&chain_time),
                &providers,
                Arc::clone(&submitter),
            )
            .await
            .context("failed to start attestations service")?;
        }

        Ok(())
    }

    /// Cancels every subscription and background task.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

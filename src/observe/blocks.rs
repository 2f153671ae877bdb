use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, error};

use crate::beacon::{Event, EventHandler, EventsProvider, NodeVersionProvider, SyncingProvider, Topic};
use crate::chaintime::ChainTime;
use crate::submit::Submitter;

use super::EventMetrics;

static METRICS: OnceLock<EventMetrics> = OnceLock::new();

/// One block-delay measurement.
#[derive(Serialize)]
struct DelayRecord<'a> {
    source: &'a str,
    method: &'static str,
    slot: String,
    delay_ms: String,
}

/// Watches the block stream of every upstream and submits a delay record for
/// each block event.
pub struct BlockObserver;

impl BlockObserver {
    pub async fn new<C>(
        monitor: &dyn crate::metrics::Service,
        chain_time: Arc<ChainTime>,
        providers: &HashMap<String, Arc<C>>,
        submitter: Arc<dyn Submitter>,
    ) -> Result<Self>
    where
        C: EventsProvider + NodeVersionProvider + SyncingProvider + 'static,
    {
        super::register_event_metrics(
            &METRICS,
            monitor,
            "blocks",
            "The time from the start of the slot to receipt of the block event.",
        )
        .context("failed to register metrics")?;

        for (address, client) in providers {
            let handler = block_handler(
                address.clone(),
                Arc::clone(client),
                Arc::clone(&chain_time),
                Arc::clone(&submitter),
            );
            client.subscribe(vec![Topic::Block], handler).await?;
        }

        Ok(Self)
    }
}

fn block_handler<C>(
    address: String,
    client: Arc<C>,
    chain_time: Arc<ChainTime>,
    submitter: Arc<dyn Submitter>,
) -> EventHandler
where
    C: NodeVersionProvider + SyncingProvider + 'static,
{
    Box::new(move |event| {
        let Event::Block(block) = event else {
            return;
        };

        // The delay is fixed at receipt; the upstream queries below must not
        // shift it.
        let delay_ms = chain_time.millis_since_slot_start(block.slot, SystemTime::now());
        super::monitor_event_processed(&METRICS, delay_ms);

        let address = address.clone();
        let client = Arc::clone(&client);
        let submitter = Arc::clone(&submitter);

        tokio::spawn(async move {
            match client.node_syncing().await {
                Ok(status) if status.is_syncing => {
                    debug!(address = %address, slot = block.slot, "node is syncing");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(address = %address, error = %e, "failed to obtain sync state");
                    return;
                }
            }

            let source = match client.node_version().await {
                Ok(version) => version,
                Err(e) => {
                    error!(address = %address, error = %e, "failed to obtain node version");
                    return;
                }
            };

            let record = DelayRecord {
                source: &source,
                method: "block event",
                slot: block.slot.to_string(),
                delay_ms: delay_ms.to_string(),
            };

            let body = match serde_json::to_string(&record) {
                Ok(body) => body,
                Err(e) => {
                    error!(error = %e, "failed to serialize block delay");
                    return;
                }
            };

            debug!(data = %body, "block delay");
            submitter.submit_block_delay(body);
        });
    })
}

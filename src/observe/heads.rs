use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, error};

use crate::beacon::{Event, EventHandler, EventsProvider, NodeVersionProvider, Topic};
use crate::chaintime::ChainTime;
use crate::submit::Submitter;

use super::EventMetrics;

static METRICS: OnceLock<EventMetrics> = OnceLock::new();

#[derive(Serialize)]
struct DelayRecord<'a> {
    source: &'a str,
    method: &'static str,
    slot: String,
    delay_ms: String,
}

/// Watches the head stream of every upstream and submits a delay record for
/// each head change.
pub struct HeadObserver;

impl HeadObserver {
    pub async fn new<C>(
        monitor: &dyn crate::metrics::Service,
        chain_time: Arc<ChainTime>,
        providers: &HashMap<String, Arc<C>>,
        submitter: Arc<dyn Submitter>,
    ) -> Result<Self>
    where
        C: EventsProvider + NodeVersionProvider + 'static,
    {
        super::register_event_metrics(
            &METRICS,
            monitor,
            "heads",
            "The time from the start of the slot to receipt of the head event.",
        )
        .context("failed to register metrics")?;

        for (address, client) in providers {
            let handler = head_handler(
                address.clone(),
                Arc::clone(client),
                Arc::clone(&chain_time),
                Arc::clone(&submitter),
            );
            client.subscribe(vec![Topic::Head], handler).await?;
        }

        Ok(Self)
    }
}

fn head_handler<C>(
    address: String,
    client: Arc<C>,
    chain_time: Arc<ChainTime>,
    submitter: Arc<dyn Submitter>,
) -> EventHandler
where
    C: NodeVersionProvider + 'static,
{
    Box::new(move |event| {
        let Event::Head(head) = event else {
            return;
        };

        let delay_ms = chain_time.millis_since_slot_start(head.slot, SystemTime::now());
        super::monitor_event_processed(&METRICS, delay_ms);

        let address = address.clone();
        let client = Arc::clone(&client);
        let submitter = Arc::clone(&submitter);

        tokio::spawn(async move {
            let source = match client.node_version().await {
                Ok(version) => version,
                Err(e) => {
                    error!(address = %address, error = %e, "failed to obtain node version");
                    return;
                }
            };

            let record = DelayRecord {
                source: &source,
                method: "head event",
                slot: head.slot.to_string(),
                delay_ms: delay_ms.to_string(),
            };

            let body = match serde_json::to_string(&record) {
                Ok(body) => body,
                Err(e) => {
                    error!(error = %e, "failed to serialize head delay");
                    return;
                }
            };

            debug!(data = %body, "head delay");
            submitter.submit_head_delay(body);
        });
    })
}

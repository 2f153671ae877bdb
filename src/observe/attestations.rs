use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, trace};

use crate::beacon::{
    AttestationEvent, Event, EventHandler, EventsProvider, NodeVersionProvider, Root, Topic,
};
use crate::bitlist::Bitlist;
use crate::chaintime::ChainTime;
use crate::submit::Submitter;

use super::EventMetrics;

static METRICS: OnceLock<EventMetrics> = OnceLock::new();

/// Attestations observed more than this long after their slot started (or
/// before it started) are discarded.
const MAX_DELAY_MS: i64 = 12_000;

/// Number of 100ms delay buckets per source.
const BUCKET_COUNT: usize = 120;

const BUCKET_WIDTH_MS: i64 = 100;

/// What an attestation votes for. Two attestations in the same slot with the
/// same key are votes for the same thing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VoteKey {
    committee_index: u64,
    beacon_block_root: Root,
    source_root: Root,
    target_root: Root,
}

impl VoteKey {
    fn from_event(att: &AttestationEvent) -> Self {
        Self {
            committee_index: att.committee_index,
            beacon_block_root: att.beacon_block_root,
            source_root: att.source_root,
            target_root: att.target_root,
        }
    }
}

type SourceBuckets = Box<[Option<Bitlist>; BUCKET_COUNT]>;

fn empty_buckets() -> SourceBuckets {
    Box::new(std::array::from_fn(|_| None))
}

/// Aggregation of single-validator attestations for one vote: per source
/// address, one OR-merged bitlist per 100ms delay bucket.
struct VoteSummary {
    committee_index: u64,
    beacon_block_root: Root,
    source_root: Root,
    target_root: Root,
    buckets: BTreeMap<String, SourceBuckets>,
}

impl VoteSummary {
    fn from_event(att: &AttestationEvent) -> Self {
        Self {
            committee_index: att.committee_index,
            beacon_block_root: att.beacon_block_root,
            source_root: att.source_root,
            target_root: att.target_root,
            buckets: BTreeMap::new(),
        }
    }
}

type SlotSummaries = HashMap<VoteKey, VoteSummary>;

/// Watches the attestation stream of every upstream.
///
/// Single-validator attestations are folded into a per-slot table and
/// emitted as one summary when the slot rolls over; aggregates are submitted
/// immediately with the reporting node's version as the source label.
pub struct AttestationObserver {
    submitter: Arc<dyn Submitter>,
    summaries: Mutex<HashMap<u64, SlotSummaries>>,
}

impl AttestationObserver {
    pub async fn new<C>(
        monitor: &dyn crate::metrics::Service,
        chain_time: Arc<ChainTime>,
        providers: &HashMap<String, Arc<C>>,
        submitter: Arc<dyn Submitter>,
    ) -> Result<Arc<Self>>
    where
        C: EventsProvider + NodeVersionProvider + 'static,
    {
        super::register_event_metrics(
            &METRICS,
            monitor,
            "attestations",
            "The time from the start of the slot to receipt of the attestation event.",
        )
        .context("failed to register metrics")?;

        let observer = Arc::new(Self {
            submitter,
            summaries: Mutex::new(HashMap::new()),
        });

        for (address, client) in providers {
            let handler = attestation_handler(
                Arc::clone(&observer),
                address.clone(),
                Arc::clone(client),
                Arc::clone(&chain_time),
            );
            client.subscribe(vec![Topic::Attestation], handler).await?;
        }

        Ok(observer)
    }

    /// Folds one single-validator attestation into the table. The first
    /// singleton seen for a slot evicts and submits the prior slot's
    /// summaries.
    fn apply_singleton(&self, source: &str, att: &AttestationEvent, delay_ms: i64) {
        let bucket = ((delay_ms % 1000) / BUCKET_WIDTH_MS) as usize;
        if bucket >= BUCKET_COUNT {
            debug!(bucket, "bucket out of range, ignoring");
            return;
        }

        let key = VoteKey::from_event(att);

        let mut table = self.summaries.lock();

        let slot_summaries = table.entry(att.slot).or_default();
        let summary = slot_summaries
            .entry(key)
            .or_insert_with(|| VoteSummary::from_event(att));
        let buckets = summary
            .buckets
            .entry(source.to_string())
            .or_insert_with(empty_buckets);

        let merged = match buckets[bucket].take() {
            None => att.aggregation_bits.clone(),
            Some(existing) => match existing.union(&att.aggregation_bits) {
                Ok(merged) => merged,
                Err(e) => {
                    buckets[bucket] = Some(existing);
                    drop(table);
                    error!(error = %e, slot = att.slot, "failed to aggregate attestations");
                    return;
                }
            },
        };
        buckets[bucket] = Some(merged);

        let flushed = att
            .slot
            .checked_sub(1)
            .and_then(|prior| table.remove(&prior));

        // Serialization happens outside the lock; the removed map is no
        // longer reachable by other handlers.
        drop(table);

        let Some(summaries) = flushed else {
            return;
        };

        let body = match build_summary_record(att.slot - 1, &summaries) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "failed to serialize attestation summary");
                return;
            }
        };

        trace!(data = %body, "attestation summary");
        self.submitter.submit_attestation_summary(body);
    }

    /// Submits one aggregate attestation, labelled with the reporting
    /// node's version. No table state is touched.
    fn dispatch_aggregate<C>(
        self: &Arc<Self>,
        client: Arc<C>,
        address: String,
        att: AttestationEvent,
        delay_ms: i64,
    ) where
        C: NodeVersionProvider + 'static,
    {
        let observer = Arc::clone(self);

        tokio::spawn(async move {
            let source = match client.node_version().await {
                Ok(version) => version,
                Err(e) => {
                    error!(address = %address, error = %e, "failed to obtain node version");
                    return;
                }
            };

            let body = match build_aggregate_record(&source, &att, delay_ms) {
                Ok(body) => body,
                Err(e) => {
                    error!(error = %e, "failed to serialize aggregate attestation");
                    return;
                }
            };

            trace!(data = %body, "aggregate attestation");
            observer.submitter.submit_aggregate_attestation(body);
        });
    }
}

fn attestation_handler<C>(
    observer: Arc<AttestationObserver>,
    address: String,
    client: Arc<C>,
    chain_time: Arc<ChainTime>,
) -> EventHandler
where
    C: NodeVersionProvider + 'static,
{
    Box::new(move |event| {
        let Event::Attestation(att) = event else {
            return;
        };

        let delay_ms = chain_time.millis_since_slot_start(att.slot, SystemTime::now());
        if delay_ms < 0 || delay_ms >= MAX_DELAY_MS {
            debug!(slot = att.slot, delay_ms, "delay out of range, ignoring");
            return;
        }
        super::monitor_event_processed(&METRICS, delay_ms);

        match att.aggregation_bits.count() {
            0 => debug!(slot = att.slot, "attestation has no participants, ignoring"),
            1 => observer.apply_singleton(&address, &att, delay_ms),
            _ => observer.dispatch_aggregate(
                Arc::clone(&client),
                address.clone(),
                att,
                delay_ms,
            ),
        }
    })
}

// --- Outbound record shapes ---

#[derive(Serialize)]
struct AggregateRecord<'a> {
    source: &'a str,
    method: &'static str,
    slot: String,
    committee_index: String,
    beacon_block_root: String,
    source_root: String,
    target_root: String,
    aggregation_bits: String,
    delay_ms: String,
}

#[derive(Serialize)]
struct SummaryRecord {
    method: &'static str,
    slot: String,
    attestations: Vec<SummaryAttestation>,
}

#[derive(Serialize)]
struct SummaryAttestation {
    committee_index: String,
    beacon_block_root: String,
    source_root: String,
    target_root: String,
    buckets: BTreeMap<String, Vec<String>>,
}

fn build_aggregate_record(source: &str, att: &AttestationEvent, delay_ms: i64) -> Result<String> {
    let record = AggregateRecord {
        source,
        method: "attestation event",
        slot: att.slot.to_string(),
        committee_index: att.committee_index.to_string(),
        beacon_block_root: att.beacon_block_root.to_string(),
        source_root: att.source_root.to_string(),
        target_root: att.target_root.to_string(),
        aggregation_bits: att.aggregation_bits.to_string(),
        delay_ms: delay_ms.to_string(),
    };

    serde_json::to_string(&record).context("serializing aggregate attestation")
}

fn build_summary_record(slot: u64, summaries: &SlotSummaries) -> Result<String> {
    let attestations = summaries
        .values()
        .map(|summary| SummaryAttestation {
            committee_index: summary.committee_index.to_string(),
            beacon_block_root: summary.beacon_block_root.to_string(),
            source_root: summary.source_root.to_string(),
            target_root: summary.target_root.to_string(),
            buckets: summary
                .buckets
                .iter()
                .map(|(source, buckets)| {
                    let rendered = buckets
                        .iter()
                        .map(|bucket| match bucket {
                            Some(bits) => bits.to_string(),
                            None => "0x".to_string(),
                        })
                        .collect();
                    (source.clone(), rendered)
                })
                .collect(),
        })
        .collect();

    let record = SummaryRecord {
        method: "attestation event",
        slot: slot.to_string(),
        attestations,
    };

    serde_json::to_string(&record).context("serializing attestation summary")
}

pub mod pool;
pub mod sse;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bitlist::Bitlist;

/// Delay before re-establishing a dropped event stream.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// 32-byte chain root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Root(pub [u8; 32]);

impl Root {
    /// Parses a `0x`-prefixed hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).with_context(|| format!("decoding root {s:?}"))?;

        let root: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("root must be 32 bytes, got {}", bytes.len()))?;

        Ok(Self(root))
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Delivered when an upstream first sees a block proposal for a slot.
#[derive(Debug, Clone)]
pub struct BlockEvent {
    pub slot: u64,
    pub block_root: Root,
}

/// Delivered when an upstream's head pointer changes.
#[derive(Debug, Clone)]
pub struct HeadEvent {
    pub slot: u64,
    pub block_root: Root,
}

/// An attestation seen on an upstream's attestation stream.
#[derive(Debug, Clone)]
pub struct AttestationEvent {
    pub slot: u64,
    pub committee_index: u64,
    pub beacon_block_root: Root,
    pub source_root: Root,
    pub target_root: Root,
    pub aggregation_bits: Bitlist,
}

/// One event from an upstream's event stream.
#[derive(Debug, Clone)]
pub enum Event {
    Block(BlockEvent),
    Head(HeadEvent),
    Attestation(AttestationEvent),
}

/// Event stream topics an observer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Block,
    Head,
    Attestation,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Head => "head",
            Self::Attestation => "attestation",
        }
    }
}

/// Callback invoked once per delivered event.
pub type EventHandler = Box<dyn Fn(Event) + Send + Sync>;

/// Node sync status.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub head_slot: u64,
    pub sync_distance: u64,
    pub is_optimistic: bool,
    pub el_offline: bool,
}

/// Genesis information.
#[derive(Debug, Clone, Copy)]
pub struct GenesisInfo {
    pub genesis_time: SystemTime,
}

/// Chain spec parameters the probe needs.
#[derive(Debug, Clone, Copy)]
pub struct ChainSpec {
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
}

/// One entry of the fork schedule.
#[derive(Debug, Clone)]
pub struct Fork {
    pub epoch: u64,
    pub current_version: String,
}

// Capability traits. Observers are handed an upstream only through the
// narrow set of capabilities they need, never the full client.

pub trait EventsProvider: Send + Sync {
    /// Attaches a handler to the upstream's event stream for the given
    /// topics. Returns once the subscription is open; the handler is then
    /// invoked at most once per delivered event for the life of the process.
    fn subscribe(
        &self,
        topics: Vec<Topic>,
        handler: EventHandler,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub trait NodeVersionProvider: Send + Sync {
    /// The upstream's version string, used as the source label downstream.
    fn node_version(&self) -> impl Future<Output = Result<String>> + Send;
}

pub trait SyncingProvider: Send + Sync {
    fn node_syncing(&self) -> impl Future<Output = Result<SyncStatus>> + Send;
}

pub trait GenesisProvider: Send + Sync {
    fn genesis(&self) -> impl Future<Output = Result<GenesisInfo>> + Send;
}

pub trait SpecProvider: Send + Sync {
    fn spec(&self) -> impl Future<Output = Result<ChainSpec>> + Send;
}

pub trait ForkScheduleProvider: Send + Sync {
    fn fork_schedule(&self) -> impl Future<Output = Result<Vec<Fork>>> + Send;
}

/// HTTP client for one consensus node.
pub struct Client {
    http: reqwest::Client,
    address: String,
    timeout: Duration,
    cancel: CancellationToken,
}

impl Client {
    /// Creates a client for the node at `address`. The timeout applies to
    /// individual requests; event streams are long-lived and exempt.
    pub fn new(address: &str, timeout: Duration, cancel: CancellationToken) -> Result<Self> {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(120)
        } else {
            timeout
        };

        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            address: address.trim_end_matches('/').to_string(),
            timeout,
            cancel,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Performs a GET request and deserializes the JSON response.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.address, path);

        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("requesting {path}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {} from {}: {}", status, path, body);
        }

        response
            .json()
            .await
            .with_context(|| format!("decoding response from {path}"))
    }
}

async fn open_event_stream(http: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    let response = http
        .get(url)
        .header("Accept", "text/event-stream")
        .send()
        .await
        .context("requesting event stream")?;

    let status = response.status();
    if !status.is_success() {
        bail!("unexpected status {status} opening event stream");
    }

    Ok(response)
}

impl EventsProvider for Client {
    async fn subscribe(&self, topics: Vec<Topic>, handler: EventHandler) -> Result<()> {
        let topic_list = topics
            .iter()
            .map(Topic::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let url = format!("{}/eth/v1/events?topics={}", self.address, topic_list);

        // The first connection is made before returning so that an upstream
        // without an event stream is rejected at startup.
        let response = open_event_stream(&self.http, &url)
            .await
            .with_context(|| format!("subscribing to {topic_list} events on {}", self.address))?;

        let http = self.http.clone();
        let address = self.address.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut response = Some(response);

            loop {
                let stream = match response.take() {
                    Some(r) => r,
                    None => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }

                        match open_event_stream(&http, &url).await {
                            Ok(r) => r,
                            Err(e) => {
                                warn!(
                                    address = %address,
                                    error = %e,
                                    "failed to re-establish event stream",
                                );
                                continue;
                            }
                        }
                    }
                };

                read_event_stream(stream, &handler, &cancel).await;

                if cancel.is_cancelled() {
                    return;
                }

                debug!(address = %address, topics = %topic_list, "event stream ended, reconnecting");
            }
        });

        Ok(())
    }
}

/// Consumes one event stream until it ends, errors or is cancelled.
async fn read_event_stream(
    response: reqwest::Response,
    handler: &EventHandler,
    cancel: &CancellationToken,
) {
    let mut decoder = sse::Decoder::new();
    let mut stream = response.bytes_stream().boxed();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        for frame in decoder.push(&bytes) {
                            match decode_event(&frame.event, &frame.data) {
                                Ok(Some(event)) => handler(event),
                                Ok(None) => {}
                                Err(e) => {
                                    error!(
                                        event = %frame.event,
                                        error = %e,
                                        "failed to decode event",
                                    );
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "event stream error");
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

// --- Event stream JSON structures ---

#[derive(Deserialize)]
struct BlockEventJson {
    slot: String,
    block: String,
}

#[derive(Deserialize)]
struct HeadEventJson {
    slot: String,
    block: String,
}

#[derive(Deserialize)]
struct AttestationJson {
    aggregation_bits: String,
    data: AttestationDataJson,
}

#[derive(Deserialize)]
struct AttestationDataJson {
    slot: String,
    index: String,
    beacon_block_root: String,
    source: CheckpointJson,
    target: CheckpointJson,
}

#[derive(Deserialize)]
struct CheckpointJson {
    root: String,
}

/// Decodes one event-stream frame. Unknown event types yield `None`.
pub(crate) fn decode_event(event: &str, data: &str) -> Result<Option<Event>> {
    match event {
        "block" => {
            let raw: BlockEventJson =
                serde_json::from_str(data).context("parsing block event")?;
            Ok(Some(Event::Block(BlockEvent {
                slot: parse_uint64(&raw.slot, "slot")?,
                block_root: Root::from_hex(&raw.block)?,
            })))
        }
        "head" => {
            let raw: HeadEventJson = serde_json::from_str(data).context("parsing head event")?;
            Ok(Some(Event::Head(HeadEvent {
                slot: parse_uint64(&raw.slot, "slot")?,
                block_root: Root::from_hex(&raw.block)?,
            })))
        }
        "attestation" => {
            let raw: AttestationJson =
                serde_json::from_str(data).context("parsing attestation event")?;
            Ok(Some(Event::Attestation(AttestationEvent {
                slot: parse_uint64(&raw.data.slot, "slot")?,
                committee_index: parse_uint64(&raw.data.index, "index")?,
                beacon_block_root: Root::from_hex(&raw.data.beacon_block_root)?,
                source_root: Root::from_hex(&raw.data.source.root)?,
                target_root: Root::from_hex(&raw.data.target.root)?,
                aggregation_bits: Bitlist::from_hex(&raw.aggregation_bits)?,
            })))
        }
        _ => Ok(None),
    }
}

fn parse_uint64(s: &str, field: &str) -> Result<u64> {
    s.parse::<u64>()
        .with_context(|| format!("parsing {field} value {s:?}"))
}

// --- REST API response structures ---

#[derive(Deserialize)]
struct GenesisApiResponse {
    data: GenesisData,
}

#[derive(Deserialize)]
struct GenesisData {
    genesis_time: String,
}

#[derive(Deserialize)]
struct SpecApiResponse {
    data: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct ForkScheduleApiResponse {
    data: Vec<ForkData>,
}

#[derive(Deserialize)]
struct ForkData {
    epoch: String,
    current_version: String,
}

#[derive(Deserialize)]
struct VersionApiResponse {
    data: VersionData,
}

#[derive(Deserialize)]
struct VersionData {
    version: String,
}

#[derive(Deserialize)]
struct SyncApiResponse {
    data: SyncData,
}

#[derive(Deserialize)]
struct SyncData {
    is_syncing: bool,
    head_slot: String,
    sync_distance: String,
    #[serde(default)]
    is_optimistic: bool,
    #[serde(default)]
    el_offline: bool,
}

impl GenesisProvider for Client {
    async fn genesis(&self) -> Result<GenesisInfo> {
        debug!(address = %self.address, "fetching genesis");

        let resp: GenesisApiResponse = self
            .get_json("/eth/v1/beacon/genesis")
            .await
            .context("fetching genesis")?;

        let genesis_unix = parse_uint64(&resp.data.genesis_time, "genesis_time")?;

        Ok(GenesisInfo {
            genesis_time: UNIX_EPOCH + Duration::from_secs(genesis_unix),
        })
    }
}

impl SpecProvider for Client {
    async fn spec(&self) -> Result<ChainSpec> {
        debug!(address = %self.address, "fetching spec");

        let resp: SpecApiResponse = self
            .get_json("/eth/v1/config/spec")
            .await
            .context("fetching spec")?;

        Ok(ChainSpec {
            seconds_per_slot: spec_uint64(&resp.data, "SECONDS_PER_SLOT")?,
            slots_per_epoch: spec_uint64(&resp.data, "SLOTS_PER_EPOCH")?,
        })
    }
}

impl ForkScheduleProvider for Client {
    async fn fork_schedule(&self) -> Result<Vec<Fork>> {
        debug!(address = %self.address, "fetching fork schedule");

        let resp: ForkScheduleApiResponse = self
            .get_json("/eth/v1/config/fork_schedule")
            .await
            .context("fetching fork schedule")?;

        resp.data
            .into_iter()
            .map(|fork| {
                Ok(Fork {
                    epoch: parse_uint64(&fork.epoch, "epoch")?,
                    current_version: fork.current_version,
                })
            })
            .collect()
    }
}

impl NodeVersionProvider for Client {
    async fn node_version(&self) -> Result<String> {
        let resp: VersionApiResponse = self
            .get_json("/eth/v1/node/version")
            .await
            .context("fetching node version")?;

        Ok(resp.data.version)
    }
}

impl SyncingProvider for Client {
    async fn node_syncing(&self) -> Result<SyncStatus> {
        let resp: SyncApiResponse = self
            .get_json("/eth/v1/node/syncing")
            .await
            .context("fetching sync status")?;

        Ok(SyncStatus {
            is_syncing: resp.data.is_syncing,
            head_slot: parse_uint64(&resp.data.head_slot, "head_slot")?,
            sync_distance: parse_uint64(&resp.data.sync_distance, "sync_distance")?,
            is_optimistic: resp.data.is_optimistic,
            el_offline: resp.data.el_offline,
        })
    }
}

/// Extracts a string-encoded u64 from a spec data map.
fn spec_uint64(data: &HashMap<String, serde_json::Value>, key: &str) -> Result<u64> {
    let value = data
        .get(key)
        .with_context(|| format!("spec missing required key {key:?}"))?;

    let s = value
        .as_str()
        .with_context(|| format!("spec key {key:?} is not a string"))?;

    parse_uint64(s, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_hex_round_trip() {
        let hex = "0x4242424242424242424242424242424242424242424242424242424242424242";
        let root = Root::from_hex(hex).expect("valid root");
        assert_eq!(root.to_string(), hex);
    }

    #[test]
    fn test_root_rejects_wrong_length() {
        let result = Root::from_hex("0x1234");
        assert!(result.is_err());
        assert!(result
            .expect_err("should fail")
            .to_string()
            .contains("32 bytes"));
    }

    #[test]
    fn test_decode_block_event() {
        let data = r#"{"slot":"7","block":"0x9a2fefd2fdb57f74993c7780ea5b9030d2897b615b89f808011ca5aebed54eaf","execution_optimistic":false}"#;
        let event = decode_event("block", data).expect("valid event");
        match event {
            Some(Event::Block(block)) => {
                assert_eq!(block.slot, 7);
                assert_eq!(block.block_root.0[0], 0x9a);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_head_event() {
        let data = r#"{"slot":"10","block":"0x9a2fefd2fdb57f74993c7780ea5b9030d2897b615b89f808011ca5aebed54eaf","state":"0x600e852a08c1200654ddf11025f1ceacb3c2ae34e7b52ba34e6c2f100ca238c5","epoch_transition":false}"#;
        let event = decode_event("head", data).expect("valid event");
        assert!(matches!(event, Some(Event::Head(h)) if h.slot == 10));
    }

    #[test]
    fn test_decode_attestation_event() {
        let root = "0x9a2fefd2fdb57f74993c7780ea5b9030d2897b615b89f808011ca5aebed54eaf";
        let data = format!(
            r#"{{"aggregation_bits":"0x0401","data":{{"slot":"100","index":"3","beacon_block_root":"{root}","source":{{"epoch":"2","root":"{root}"}},"target":{{"epoch":"3","root":"{root}"}}}},"signature":"0x00"}}"#,
        );
        let event = decode_event("attestation", &data).expect("valid event");
        match event {
            Some(Event::Attestation(att)) => {
                assert_eq!(att.slot, 100);
                assert_eq!(att.committee_index, 3);
                assert_eq!(att.aggregation_bits.count(), 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_topic() {
        let event = decode_event("finalized_checkpoint", "{}").expect("no error");
        assert!(event.is_none());
    }

    #[test]
    fn test_decode_malformed_data_is_an_error() {
        assert!(decode_event("block", "not json").is_err());
        assert!(decode_event("block", r#"{"slot":"x","block":"0x00"}"#).is_err());
    }

    #[test]
    fn test_spec_uint64() {
        let mut data = HashMap::new();
        data.insert(
            "SECONDS_PER_SLOT".to_string(),
            serde_json::Value::String("12".to_string()),
        );

        assert_eq!(
            spec_uint64(&data, "SECONDS_PER_SLOT").expect("should parse"),
            12,
        );
        assert!(spec_uint64(&data, "SLOTS_PER_EPOCH").is_err());

        data.insert("BLOB_SCHEDULE".to_string(), serde_json::json!([1, 2]));
        assert!(spec_uint64(&data, "BLOB_SCHEDULE").is_err());
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = Client::new(
            "http://localhost:5052/",
            Duration::from_secs(1),
            CancellationToken::new(),
        )
        .expect("valid client");
        assert_eq!(client.address(), "http://localhost:5052");
    }
}

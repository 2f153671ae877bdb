//! End-to-end test: a mock consensus node (REST + event stream) feeds the
//! observers, which submit records to a capturing collector.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use probec::agent::Agent;
use probec::config::{Config, ConsensusClientConfig, SubmitterConfig};

const BLOCK_ROOT: &str = "0x9a2fefd2fdb57f74993c7780ea5b9030d2897b615b89f808011ca5aebed54eaf";
const SOURCE_ROOT: &str = "0x600e852a08c1200654ddf11025f1ceacb3c2ae34e7b52ba34e6c2f100ca238c5";
const TARGET_ROOT: &str = "0x44db8d46ba9cca2b4a66dcd2a92d51e3c10fc7d3e5a1a1f1bfd79bd21cf21b79";

// --- Capturing collector ---

#[derive(Clone, Default)]
struct Capture {
    requests: Arc<Mutex<Vec<(String, String)>>>,
}

impl Capture {
    fn bodies_for(&self, path: &str) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, body)| body.clone())
            .collect()
    }

    async fn wait_for_paths(&self, paths: &[&str]) {
        for _ in 0..500 {
            let seen = self.requests.lock();
            if paths
                .iter()
                .all(|path| seen.iter().any(|(p, _)| p == path))
            {
                return;
            }
            drop(seen);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "timed out waiting for {paths:?}, have {:?}",
            self.requests
                .lock()
                .iter()
                .map(|(p, _)| p.clone())
                .collect::<Vec<_>>(),
        );
    }
}

async fn capture_handler(State(capture): State<Capture>, uri: Uri, body: String) -> StatusCode {
    capture.requests.lock().push((uri.path().to_string(), body));
    StatusCode::OK
}

async fn start_collector() -> (SocketAddr, Capture) {
    let capture = Capture::default();

    let app = Router::new()
        .route("/v1/blockdelay", post(capture_handler))
        .route("/v1/headdelay", post(capture_handler))
        .route("/v1/aggregateattestation", post(capture_handler))
        .route("/v1/attestationsummary", post(capture_handler))
        .with_state(capture.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind collector");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve collector");
    });

    (addr, capture)
}

// --- Mock consensus node ---

#[derive(Clone)]
struct TimedEvent {
    after: Duration,
    topic: &'static str,
    data: String,
}

#[derive(Clone)]
struct BeaconState {
    genesis_unix: u64,
    is_syncing: bool,
    events: Vec<TimedEvent>,
}

async fn genesis_handler(State(state): State<BeaconState>) -> Json<Value> {
    Json(json!({"data": {"genesis_time": state.genesis_unix.to_string()}}))
}

async fn spec_handler() -> Json<Value> {
    // One-second slots keep the rollover test fast; the probe reads the
    // value rather than assuming mainnet's 12s.
    Json(json!({"data": {"SECONDS_PER_SLOT": "1", "SLOTS_PER_EPOCH": "32"}}))
}

async fn fork_schedule_handler() -> Json<Value> {
    Json(json!({"data": [
        {"previous_version": "0x00000000", "current_version": "0x00000000", "epoch": "0"},
    ]}))
}

async fn version_handler() -> Json<Value> {
    Json(json!({"data": {"version": "mock/v1.0.0"}}))
}

async fn syncing_handler(State(state): State<BeaconState>) -> Json<Value> {
    Json(json!({"data": {
        "is_syncing": state.is_syncing,
        "head_slot": "16",
        "sync_distance": "0",
        "is_optimistic": false,
        "el_offline": false,
    }}))
}

async fn events_handler(
    State(state): State<BeaconState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = stream::iter(state.events.clone())
        .then(|event| async move {
            tokio::time::sleep(event.after).await;
            Ok(SseEvent::default().event(event.topic).data(event.data))
        })
        .chain(stream::pending());

    Sse::new(stream)
}

async fn start_beacon(state: BeaconState) -> SocketAddr {
    let app = Router::new()
        .route("/eth/v1/beacon/genesis", get(genesis_handler))
        .route("/eth/v1/config/spec", get(spec_handler))
        .route("/eth/v1/config/fork_schedule", get(fork_schedule_handler))
        .route("/eth/v1/node/version", get(version_handler))
        .route("/eth/v1/node/syncing", get(syncing_handler))
        .route("/eth/v1/events", get(events_handler))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind beacon");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve beacon");
    });

    addr
}

fn attestation_data(slot: u64, index: u64, bits: &str) -> String {
    json!({
        "aggregation_bits": bits,
        "data": {
            "slot": slot.to_string(),
            "index": index.to_string(),
            "beacon_block_root": BLOCK_ROOT,
            "source": {"epoch": "1", "root": SOURCE_ROOT},
            "target": {"epoch": "2", "root": TARGET_ROOT},
        },
        "signature": "0x00",
    })
    .to_string()
}

/// Genesis anchored so the wall clock is currently inside slot 16.
fn genesis_for_slot_16() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("after epoch")
        .as_secs();
    now - 16
}

fn probe_config(beacon: SocketAddr, collector: SocketAddr) -> Config {
    Config {
        consensus_client: ConsensusClientConfig {
            addresses: vec![format!("http://{beacon}")],
            timeout: Duration::from_secs(5),
        },
        submitter: SubmitterConfig {
            base_urls: vec![format!("http://{collector}")],
            ..Default::default()
        },
        ..Default::default()
    }
}

fn delay_ms(record: &Value) -> i64 {
    record["delay_ms"]
        .as_str()
        .expect("delay_ms is a string")
        .parse()
        .expect("delay_ms is numeric")
}

#[tokio::test]
async fn events_flow_from_upstream_to_collector() {
    let events = vec![
        TimedEvent {
            after: Duration::ZERO,
            topic: "block",
            data: json!({"slot": "16", "block": BLOCK_ROOT, "execution_optimistic": false})
                .to_string(),
        },
        TimedEvent {
            after: Duration::ZERO,
            topic: "head",
            data: json!({
                "slot": "16",
                "block": BLOCK_ROOT,
                "state": SOURCE_ROOT,
                "epoch_transition": false,
            })
            .to_string(),
        },
        TimedEvent {
            after: Duration::ZERO,
            topic: "attestation",
            data: attestation_data(16, 1, "0x0101"),
        },
        TimedEvent {
            after: Duration::ZERO,
            topic: "attestation",
            data: attestation_data(16, 4, "0x0701"),
        },
        // Arrives after slot 17 has begun; its singleton flushes slot 16.
        TimedEvent {
            after: Duration::from_millis(1_200),
            topic: "attestation",
            data: attestation_data(17, 1, "0x0101"),
        },
    ];

    let beacon = start_beacon(BeaconState {
        genesis_unix: genesis_for_slot_16(),
        is_syncing: false,
        events,
    })
    .await;
    let (collector, capture) = start_collector().await;

    let mut agent = Agent::new(probe_config(beacon, collector));
    agent.start().await.expect("agent starts");

    capture
        .wait_for_paths(&[
            "/v1/blockdelay",
            "/v1/headdelay",
            "/v1/aggregateattestation",
            "/v1/attestationsummary",
        ])
        .await;
    agent.stop();

    // Block delay record.
    let blocks = capture.bodies_for("/v1/blockdelay");
    assert_eq!(blocks.len(), 1);
    let block: Value = serde_json::from_str(&blocks[0]).expect("valid JSON");
    assert_eq!(block["source"], "mock/v1.0.0");
    assert_eq!(block["method"], "block event");
    assert_eq!(block["slot"], "16");
    assert!((0..5_000).contains(&delay_ms(&block)));

    // Head delay record.
    let heads = capture.bodies_for("/v1/headdelay");
    assert_eq!(heads.len(), 1);
    let head: Value = serde_json::from_str(&heads[0]).expect("valid JSON");
    assert_eq!(head["method"], "head event");
    assert_eq!(head["slot"], "16");

    // Aggregate attestation record, labelled with the node version.
    let aggregates = capture.bodies_for("/v1/aggregateattestation");
    assert_eq!(aggregates.len(), 1);
    let aggregate: Value = serde_json::from_str(&aggregates[0]).expect("valid JSON");
    assert_eq!(aggregate["source"], "mock/v1.0.0");
    assert_eq!(aggregate["method"], "attestation event");
    assert_eq!(aggregate["slot"], "16");
    assert_eq!(aggregate["committee_index"], "4");
    assert_eq!(aggregate["aggregation_bits"], "0x0701");
    assert_eq!(aggregate["beacon_block_root"], BLOCK_ROOT);
    assert!((0..12_000).contains(&delay_ms(&aggregate)));

    // Attestation summary for the evicted slot, keyed by upstream address.
    let summaries = capture.bodies_for("/v1/attestationsummary");
    assert_eq!(summaries.len(), 1);
    let summary: Value = serde_json::from_str(&summaries[0]).expect("valid JSON");
    assert_eq!(summary["method"], "attestation event");
    assert_eq!(summary["slot"], "16");

    let attestations = summary["attestations"].as_array().expect("array");
    assert_eq!(attestations.len(), 1);
    assert_eq!(attestations[0]["committee_index"], "1");
    assert_eq!(attestations[0]["beacon_block_root"], BLOCK_ROOT);
    assert_eq!(attestations[0]["source_root"], SOURCE_ROOT);
    assert_eq!(attestations[0]["target_root"], TARGET_ROOT);

    let buckets = attestations[0]["buckets"][format!("http://{beacon}")]
        .as_array()
        .expect("buckets for the upstream address");
    assert_eq!(buckets.len(), 120);

    let populated: Vec<&Value> = buckets.iter().filter(|b| *b != "0x").collect();
    assert_eq!(populated, vec!["0x0101"]);
}

#[tokio::test]
async fn syncing_upstream_still_reports_block_delays() {
    let events = vec![TimedEvent {
        after: Duration::ZERO,
        topic: "block",
        data: json!({"slot": "16", "block": BLOCK_ROOT, "execution_optimistic": false})
            .to_string(),
    }];

    let beacon = start_beacon(BeaconState {
        genesis_unix: genesis_for_slot_16(),
        is_syncing: true,
        events,
    })
    .await;
    let (collector, capture) = start_collector().await;

    let mut cfg = probe_config(beacon, collector);
    cfg.heads.enable = false;
    cfg.attestations.enable = false;

    let mut agent = Agent::new(cfg);
    agent.start().await.expect("agent starts");

    // Syncing is logged, not a gate: the record still flows.
    capture.wait_for_paths(&["/v1/blockdelay"]).await;
    agent.stop();

    let blocks = capture.bodies_for("/v1/blockdelay");
    assert_eq!(blocks.len(), 1);
    let block: Value = serde_json::from_str(&blocks[0]).expect("valid JSON");
    assert_eq!(block["slot"], "16");
}

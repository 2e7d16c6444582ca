use std::sync::Arc;

use anyhow::{Result, bail};
use serde_json::{Value, json};

use super::state::{FetchOutcome, RunStatus};
use super::store::memory::MemoryBlobStore;
use super::*;

const RUN_ID: &str = "run-20260220";

fn event(name: &str, payload: Value, ts: &str) -> RuntimeEvent {
    RuntimeEvent::new(RUN_ID, name, payload).at(ts)
}

fn log_lines(store: &MemoryBlobStore, run_id: &str) -> Vec<Value> {
    store
        .read(&run_events_key(run_id))
        .unwrap()
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn events_named<'a>(lines: &'a [Value], name: &str) -> Vec<&'a Value> {
    lines.iter().filter(|line| line["event"] == name).collect()
}

#[tokio::test]
async fn fetch_then_source_processed_yields_one_fetch_finished() {
    let store = Arc::new(MemoryBlobStore::new());
    let bridge = RuntimeBridge::spawn(store.clone());

    bridge.on_runtime_event(event("run_started", json!({}), "2026-02-20T10:00:00.000Z"));
    bridge.on_runtime_event(event(
        "fetch_started",
        json!({ "url": "https://example.com/a" }),
        "2026-02-20T10:00:00.000Z",
    ));
    bridge.on_runtime_event(event(
        "source_processed",
        json!({ "url": "https://example.com/a", "status": 200 }),
        "2026-02-20T10:00:01.500Z",
    ));

    let summary = bridge.finalize().await.unwrap();
    assert_eq!(summary.counters.pages_checked, 1);
    assert_eq!(summary.counters.fetched_ok, 1);
    assert_eq!(summary.counters.parse_completed, 1);

    let lines = log_lines(&store, RUN_ID);
    let finished = events_named(&lines, "fetch_finished");
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0]["payload"]["duration_ms"], 1500);
    assert_eq!(finished[0]["payload"]["outcome"], "fetched_ok");

    let processed_at = lines
        .iter()
        .position(|line| line["event"] == "source_processed")
        .unwrap();
    let finished_at = lines
        .iter()
        .position(|line| line["event"] == "fetch_finished")
        .unwrap();
    assert!(finished_at > processed_at);

    bridge.shutdown().await;
}

#[test]
fn completed_fetch_leaves_the_inflight_map() {
    let store = Arc::new(MemoryBlobStore::new());
    let mut state = BridgeState::new(store.clone());

    state
        .handle_event(event("fetch_started", json!({ "url": "a" }), "2026-02-20T10:00:05Z"))
        .unwrap();
    state
        .handle_event(event("fetch_started", json!({ "url": "b" }), "2026-02-20T10:00:05Z"))
        .unwrap();
    assert_eq!(state.inflight_count(), 2);

    state
        .handle_event(event(
            "fetch_failed",
            json!({ "url": "a", "status": 404 }),
            "2026-02-20T10:00:04Z",
        ))
        .unwrap();
    assert_eq!(state.inflight_count(), 1);

    // A second completion for the same url has nothing in flight to close.
    state
        .handle_event(event("fetch_completed", json!({ "url": "a" }), "2026-02-20T10:00:06Z"))
        .unwrap();

    let counters = &state.summary().unwrap().counters;
    assert_eq!(counters.pages_checked, 2);
    assert_eq!(counters.fetched_404, 1);
    assert_eq!(counters.fetched_ok, 0);

    let lines = log_lines(&store, RUN_ID);
    let finished = events_named(&lines, "fetch_finished");
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0]["payload"]["duration_ms"], 0);
}

#[test]
fn finalize_twice_only_moves_ended_at() {
    let store = Arc::new(MemoryBlobStore::new());
    let mut state = BridgeState::new(store.clone());

    state
        .handle_event(event("search_started", json!({}), "2026-02-20T10:00:00Z"))
        .unwrap();
    state
        .handle_event(event("parse_started", json!({}), "2026-02-20T10:00:01Z"))
        .unwrap();

    let first = state.finalize("2026-02-20T10:05:00Z").unwrap().unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.stages.search.ended_at.as_deref(), Some("2026-02-20T10:05:00Z"));
    assert_eq!(first.stages.parse.ended_at.as_deref(), Some("2026-02-20T10:05:00Z"));
    assert!(first.stages.fetch.started_at.is_none());
    assert_eq!(first.stages.get(Stage::Parse), &first.stages.parse);
    let closed_after_first = events_named(&log_lines(&store, RUN_ID), "stage_finished").len();
    assert_eq!(closed_after_first, 2);

    let second = state.finalize("2026-02-20T10:06:00Z").unwrap().unwrap();
    assert_eq!(second.ended_at.as_deref(), Some("2026-02-20T10:06:00Z"));
    assert_eq!(second.stages, first.stages);
    assert_eq!(second.counters, first.counters);
    let closed_after_second = events_named(&log_lines(&store, RUN_ID), "stage_finished").len();
    assert_eq!(closed_after_second, closed_after_first);
}

#[tokio::test]
async fn bridge_finalize_is_repeatable() {
    let store = Arc::new(MemoryBlobStore::new());
    let bridge = RuntimeBridge::spawn(store.clone());

    bridge.on_runtime_event(event("index_started", json!({}), "2026-02-20T10:00:00Z"));
    let first = bridge.finalize().await.unwrap();
    let second = bridge.finalize().await.unwrap();

    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.stages.index.ended_at, first.stages.index.ended_at);

    let persisted: Value =
        serde_json::from_str(&store.read(&run_summary_key(RUN_ID)).unwrap().unwrap()).unwrap();
    assert_eq!(persisted["status"], "completed");

    bridge.shutdown().await;
}

#[tokio::test]
async fn finalize_without_events_is_a_no_op() {
    let store = Arc::new(MemoryBlobStore::new());
    let bridge = RuntimeBridge::spawn(store.clone());

    assert!(bridge.finalize().await.is_none());
    assert!(store.read(&run_summary_key(RUN_ID)).unwrap().is_none());

    bridge.shutdown().await;
}

#[test]
fn foreign_and_anonymous_events_are_dropped() {
    let store = Arc::new(MemoryBlobStore::new());
    let mut state = BridgeState::new(store.clone());

    state
        .handle_event(RuntimeEvent::new("", "fetch_started", json!({ "url": "x" })))
        .unwrap();
    assert!(state.summary().is_none());

    state
        .handle_event(event("run_started", json!({}), "2026-02-20T10:00:00Z"))
        .unwrap();
    state
        .handle_event(
            RuntimeEvent::new("other-run", "fetch_started", json!({ "url": "x" }))
                .at("2026-02-20T10:00:01Z"),
        )
        .unwrap();

    let summary = state.summary().unwrap();
    assert_eq!(summary.run_id, RUN_ID);
    assert_eq!(summary.counters.pages_checked, 0);
    assert!(store.read(&run_events_key("other-run")).unwrap().is_none());

    // Events without a run id belong to the bound run.
    state
        .handle_event(RuntimeEvent::new("", "source_indexed", json!({})))
        .unwrap();
    assert_eq!(state.summary().unwrap().counters.indexed_docs, 1);
}

#[test]
fn finishing_before_starting_opens_and_closes_at_once() {
    let store = Arc::new(MemoryBlobStore::new());
    let mut state = BridgeState::new(store.clone());

    state
        .handle_event(event("parse_finished", json!({}), "2026-02-20T10:02:00Z"))
        .unwrap();
    state
        .handle_event(event("parse_started", json!({}), "2026-02-20T10:03:00Z"))
        .unwrap();

    let parse = &state.summary().unwrap().stages.parse;
    assert_eq!(parse.started_at.as_deref(), Some("2026-02-20T10:02:00Z"));
    assert_eq!(parse.ended_at.as_deref(), Some("2026-02-20T10:02:00Z"));

    let lines = log_lines(&store, RUN_ID);
    let names = lines
        .iter()
        .map(|line| line["event"].as_str().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        vec!["parse_finished", "stage_started", "stage_finished", "parse_started"]
    );
}

#[test]
fn generic_stage_events_read_stage_from_field_or_payload() {
    let store = Arc::new(MemoryBlobStore::new());
    let mut state = BridgeState::new(store.clone());

    let mut started = event("stage_started", json!({}), "2026-02-20T10:00:00Z");
    started.stage = Some("fetch".to_string());
    state.handle_event(started).unwrap();
    state
        .handle_event(event(
            "stage_finished",
            json!({ "stage": "fetch" }),
            "2026-02-20T10:00:09Z",
        ))
        .unwrap();

    let fetch = &state.summary().unwrap().stages.fetch;
    assert_eq!(fetch.started_at.as_deref(), Some("2026-02-20T10:00:00Z"));
    assert_eq!(fetch.ended_at.as_deref(), Some("2026-02-20T10:00:09Z"));
}

#[test]
fn counters_accumulate_and_needset_summary_is_kept() {
    let store = Arc::new(MemoryBlobStore::new());
    let mut state = BridgeState::new(store.clone());

    for (name, payload) in [
        ("fields_filled", json!({ "count": 3 })),
        ("fields_filled", json!({})),
        ("source_indexed", json!({})),
        (
            "needset_computed",
            json!({ "needset_size": 5, "total_fields": 12, "generated_at": "2026-02-20T10:00:00Z" }),
        ),
    ] {
        state
            .handle_event(event(name, payload, "2026-02-20T10:00:00Z"))
            .unwrap();
    }

    let summary = state.summary().unwrap();
    assert_eq!(summary.counters.fields_filled, 4);
    assert_eq!(summary.counters.indexed_docs, 1);
    assert!(summary.stages.index.started_at.is_some());
    let needset = summary.needset.as_ref().unwrap();
    assert_eq!(needset.needset_size, 5);
    assert_eq!(needset.total_fields, 12);

    let persisted: Value =
        serde_json::from_str(&store.read(&run_summary_key(RUN_ID)).unwrap().unwrap()).unwrap();
    assert_eq!(persisted["needset"]["needset_size"], 5);
    assert_eq!(persisted["status"], "running");
}

#[test]
fn run_completed_finalizes_open_stages() {
    let store = Arc::new(MemoryBlobStore::new());
    let mut state = BridgeState::new(store.clone());

    state
        .handle_event(event("fetch_started", json!({ "url": "a" }), "2026-02-20T10:00:00Z"))
        .unwrap();
    state
        .handle_event(event("run_completed", json!({}), "2026-02-20T10:10:00Z"))
        .unwrap();

    let summary = state.summary().unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.ended_at.as_deref(), Some("2026-02-20T10:10:00Z"));
    assert_eq!(summary.stages.fetch.ended_at.as_deref(), Some("2026-02-20T10:10:00Z"));
    assert_eq!(state.inflight_count(), 0);
}

#[test]
fn events_after_completion_are_dropped() {
    let store = Arc::new(MemoryBlobStore::new());
    let mut state = BridgeState::new(store.clone());

    state
        .handle_event(event("fetch_started", json!({ "url": "a" }), "2026-02-20T10:00:00Z"))
        .unwrap();
    state.finalize("2026-02-20T10:05:00Z").unwrap();
    let logged_at_finalize = log_lines(&store, RUN_ID).len();

    state
        .handle_event(event("fetch_started", json!({ "url": "b" }), "2026-02-20T10:06:00Z"))
        .unwrap();
    state
        .handle_event(event("parse_started", json!({}), "2026-02-20T10:06:01Z"))
        .unwrap();

    let summary = state.summary().unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counters.pages_checked, 1);
    assert!(summary.stages.parse.started_at.is_none());
    assert_eq!(summary.ended_at.as_deref(), Some("2026-02-20T10:05:00Z"));
    assert_eq!(state.inflight_count(), 0);
    assert_eq!(log_lines(&store, RUN_ID).len(), logged_at_finalize);
}

struct RejectingStore {
    inner: MemoryBlobStore,
    marker: &'static str,
}

impl BlobStore for RejectingStore {
    fn append(&self, key: &str, data: &str) -> Result<()> {
        if data.contains(self.marker) {
            bail!("disk full while appending {key}");
        }
        self.inner.append(key, data)
    }

    fn write(&self, key: &str, data: &str) -> Result<()> {
        self.inner.write(key, data)
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        self.inner.read(key)
    }
}

#[tokio::test]
async fn failed_append_does_not_stop_the_queue() {
    let store = Arc::new(RejectingStore {
        inner: MemoryBlobStore::new(),
        marker: "unwritable",
    });
    let bridge = RuntimeBridge::spawn(store.clone());

    bridge.on_runtime_event(event("run_started", json!({}), "2026-02-20T10:00:00Z"));
    bridge.on_runtime_event(event(
        "fetch_started",
        json!({ "url": "https://example.com/unwritable" }),
        "2026-02-20T10:00:01Z",
    ));
    bridge.on_runtime_event(event(
        "fetch_started",
        json!({ "url": "https://example.com/b" }),
        "2026-02-20T10:00:02Z",
    ));
    bridge.on_runtime_event(event(
        "source_processed",
        json!({ "url": "https://example.com/b", "status": 200 }),
        "2026-02-20T10:00:03Z",
    ));

    let summary = bridge.finalize().await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counters.fetched_ok, 1);

    let lines = log_lines(&store.inner, RUN_ID);
    assert!(lines.iter().all(|line| line["payload"]["url"] != "https://example.com/unwritable"));
    assert_eq!(events_named(&lines, "source_processed").len(), 1);
    assert_eq!(events_named(&lines, "fetch_finished").len(), 1);

    bridge.shutdown().await;
}

#[test]
fn fetch_outcomes_follow_status_codes() {
    let cases = [
        ("fetch_failed", json!({ "status": 404 }), FetchOutcome::NotFound),
        ("fetch_failed", json!({ "status": 410 }), FetchOutcome::NotFound),
        ("fetch_failed", json!({ "status": 403 }), FetchOutcome::Blocked),
        ("fetch_failed", json!({ "blocked": true }), FetchOutcome::Blocked),
        ("fetch_failed", json!({ "status": 200 }), FetchOutcome::Error),
        ("fetch_failed", json!({}), FetchOutcome::Error),
        ("fetch_succeeded", json!({ "status": 301 }), FetchOutcome::Ok),
        ("fetch_succeeded", json!({}), FetchOutcome::Ok),
        ("source_processed", json!({ "status": 429 }), FetchOutcome::Blocked),
        ("source_processed", json!({ "status": 500 }), FetchOutcome::Error),
    ];

    for (name, payload, expected) in cases {
        assert_eq!(FetchOutcome::classify(name, &payload), expected, "{name} {payload}");
    }
}

#[test]
fn runtime_events_parse_from_loose_json() {
    let parsed = RuntimeEvent::from_value(&json!({
        "runId": "r1",
        "type": "fetch_started",
        "ts": "2026-02-20T10:00:00Z",
        "payload": { "url": "https://example.com" }
    }))
    .unwrap();
    assert_eq!(parsed.run_id, "r1");
    assert_eq!(parsed.event, "fetch_started");
    assert_eq!(parsed.payload["url"], "https://example.com");

    assert!(RuntimeEvent::from_value(&json!({ "run_id": "r1" })).is_none());
    let bare = RuntimeEvent::from_value(&json!({ "event": "run_started", "payload": 7 })).unwrap();
    assert_eq!(bare.payload, json!({}));
    assert!(!bare.ts.is_empty());
}

#[test]
fn fs_blob_store_appends_writes_and_rejects_escaping_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::new(dir.path());

    store.append("runs/r1/run_events.ndjson", "a\n").unwrap();
    store.append("runs/r1/run_events.ndjson", "b\n").unwrap();
    assert_eq!(
        store.read("runs/r1/run_events.ndjson").unwrap().as_deref(),
        Some("a\nb\n")
    );

    store.write("runs/r1/run.json", "{}").unwrap();
    store.write("runs/r1/run.json", "{\"v\":2}").unwrap();
    assert_eq!(store.read("runs/r1/run.json").unwrap().as_deref(), Some("{\"v\":2}"));

    assert!(store.read("runs/missing.json").unwrap().is_none());
    assert!(store.write("../escape.json", "{}").is_err());
    assert!(store.write("/abs.json", "{}").is_err());
    assert!(store.append("", "x").is_err());
}

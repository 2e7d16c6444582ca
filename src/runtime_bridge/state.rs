use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::store::{BlobStore, run_events_key, run_summary_key};
use crate::needset::NeedSetSummary;
use crate::util::{count, first_present, flag, now_utc_millis_string, parse_timestamp, text};

const BLOCKED_STATUSES: [u64; 4] = [401, 403, 429, 451];
const NOT_FOUND_STATUSES: [u64; 2] = [404, 410];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Search,
    Fetch,
    Parse,
    Index,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Self::Search, Self::Fetch, Self::Parse, Self::Index];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "search" => Some(Self::Search),
            "fetch" => Some(Self::Fetch),
            "parse" => Some(Self::Parse),
            "index" => Some(Self::Index),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Fetch => "fetch",
            Self::Parse => "parse",
            Self::Index => "index",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Ok,
    NotFound,
    Blocked,
    Error,
}

impl FetchOutcome {
    pub fn classify(event: &str, payload: &Value) -> Self {
        let status = count(first_present(payload, &["status", "http_status"]));
        let blocked = flag(payload.get("blocked")).unwrap_or(false);

        match status {
            Some(code) if NOT_FOUND_STATUSES.contains(&code) => Self::NotFound,
            Some(code) if BLOCKED_STATUSES.contains(&code) => Self::Blocked,
            _ if blocked => Self::Blocked,
            _ if event == "fetch_failed" => Self::Error,
            None | Some(200..=399) => Self::Ok,
            Some(_) => Self::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "fetched_ok",
            Self::NotFound => "fetched_404",
            Self::Blocked => "fetched_blocked",
            Self::Error => "fetched_error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunCounters {
    pub pages_checked: u64,
    pub fetched_ok: u64,
    pub fetched_404: u64,
    pub fetched_blocked: u64,
    pub fetched_error: u64,
    pub parse_completed: u64,
    pub indexed_docs: u64,
    pub fields_filled: u64,
}

impl RunCounters {
    fn record_fetch(&mut self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Ok => self.fetched_ok += 1,
            FetchOutcome::NotFound => self.fetched_404 += 1,
            FetchOutcome::Blocked => self.fetched_blocked += 1,
            FetchOutcome::Error => self.fetched_error += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageWindow {
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageWindows {
    pub search: StageWindow,
    pub fetch: StageWindow,
    pub parse: StageWindow,
    pub index: StageWindow,
}

impl StageWindows {
    pub fn get(&self, stage: Stage) -> &StageWindow {
        match stage {
            Stage::Search => &self.search,
            Stage::Fetch => &self.fetch,
            Stage::Parse => &self.parse,
            Stage::Index => &self.index,
        }
    }

    fn get_mut(&mut self, stage: Stage) -> &mut StageWindow {
        match stage {
            Stage::Search => &mut self.search,
            Stage::Fetch => &mut self.fetch,
            Stage::Parse => &mut self.parse,
            Stage::Index => &mut self.index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: RunStatus,
    pub category: String,
    pub product_id: String,
    pub counters: RunCounters,
    pub stages: StageWindows,
    pub needset: Option<NeedSetSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeEvent {
    pub run_id: String,
    pub event: String,
    pub ts: String,
    pub stage: Option<String>,
    pub category: String,
    pub product_id: String,
    pub payload: Value,
}

impl RuntimeEvent {
    pub fn new(run_id: &str, event: &str, payload: Value) -> Self {
        Self {
            run_id: run_id.to_string(),
            event: event.to_string(),
            ts: now_utc_millis_string(),
            stage: None,
            category: String::new(),
            product_id: String::new(),
            payload,
        }
    }

    pub fn at(mut self, ts: &str) -> Self {
        self.ts = ts.to_string();
        self
    }

    pub fn from_value(raw: &Value) -> Option<Self> {
        let event = text(first_present(raw, &["event", "type"]))?;
        let payload = raw
            .get("payload")
            .filter(|value| value.is_object())
            .cloned()
            .unwrap_or_else(|| json!({}));

        Some(Self {
            run_id: text(first_present(raw, &["run_id", "runId"])).unwrap_or_default(),
            event,
            ts: text(first_present(raw, &["ts", "timestamp"])).unwrap_or_else(now_utc_millis_string),
            stage: text(raw.get("stage")),
            category: text(raw.get("category")).unwrap_or_default(),
            product_id: text(first_present(raw, &["product_id", "productId"])).unwrap_or_default(),
            payload,
        })
    }

    fn payload_text(&self, key: &str) -> Option<String> {
        text(self.payload.get(key))
    }
}

#[derive(Debug, Clone, Serialize)]
struct LogRecord<'a> {
    run_id: &'a str,
    category: &'a str,
    product_id: &'a str,
    ts: &'a str,
    stage: Option<&'a str>,
    event: &'a str,
    payload: &'a Value,
}

struct DerivedRecord {
    ts: String,
    stage: Option<Stage>,
    event: &'static str,
    payload: Value,
}

pub struct BridgeState {
    store: Arc<dyn BlobStore>,
    run: Option<RunSummary>,
    inflight: HashMap<String, String>,
}

impl BridgeState {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            run: None,
            inflight: HashMap::new(),
        }
    }

    pub fn summary(&self) -> Option<&RunSummary> {
        self.run.as_ref()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn handle_event(&mut self, event: RuntimeEvent) -> Result<()> {
        if !self.bind_run(&event) {
            return Ok(());
        }

        let completed = self
            .run
            .as_ref()
            .is_some_and(|run| run.status == RunStatus::Completed);
        if completed && event.event != "run_completed" {
            debug!(event = %event.event, "dropping event after run completed");
            return Ok(());
        }

        if event.event == "run_completed" {
            self.append_log(&event, &[])?;
            self.finalize(&event.ts)?;
            return Ok(());
        }

        let derived = match self.run.as_mut() {
            Some(run) => apply_event(run, &mut self.inflight, &event),
            None => return Ok(()),
        };
        self.append_log(&event, &derived)?;
        self.write_summary()
    }

    fn bind_run(&mut self, event: &RuntimeEvent) -> bool {
        match self.run.as_mut() {
            Some(run) => {
                if !event.run_id.is_empty() && event.run_id != run.run_id {
                    debug!(
                        bound_run_id = %run.run_id,
                        run_id = %event.run_id,
                        event = %event.event,
                        "dropping event for foreign run"
                    );
                    return false;
                }
                if run.category.is_empty() && !event.category.is_empty() {
                    run.category = event.category.clone();
                }
                if run.product_id.is_empty() && !event.product_id.is_empty() {
                    run.product_id = event.product_id.clone();
                }
                true
            }
            None if event.run_id.is_empty() => {
                debug!(event = %event.event, "dropping event without run id");
                false
            }
            None => {
                info!(run_id = %event.run_id, "runtime bridge bound to run");
                self.run = Some(RunSummary {
                    run_id: event.run_id.clone(),
                    started_at: event.ts.clone(),
                    ended_at: None,
                    status: RunStatus::Running,
                    category: event.category.clone(),
                    product_id: event.product_id.clone(),
                    counters: RunCounters::default(),
                    stages: StageWindows::default(),
                    needset: None,
                });
                true
            }
        }
    }

    pub fn finalize(&mut self, ts: &str) -> Result<Option<RunSummary>> {
        let Some(run) = self.run.as_mut() else {
            return Ok(None);
        };

        let mut derived = Vec::new();
        for stage in Stage::ALL {
            let window = run.stages.get_mut(stage);
            if window.started_at.is_some() && window.ended_at.is_none() {
                window.ended_at = Some(ts.to_string());
                derived.push(DerivedRecord {
                    ts: ts.to_string(),
                    stage: Some(stage),
                    event: "stage_finished",
                    payload: json!({ "stage": stage.as_str(), "reason": "finalize" }),
                });
            }
        }
        run.status = RunStatus::Completed;
        run.ended_at = Some(ts.to_string());
        self.inflight.clear();

        info!(
            run_id = %run.run_id,
            stages_closed = derived.len(),
            "runtime bridge finalized run"
        );

        self.append_derived(&derived)?;
        self.write_summary()?;
        Ok(self.run.clone())
    }

    fn append_log(&self, event: &RuntimeEvent, derived: &[DerivedRecord]) -> Result<()> {
        let Some(run) = self.run.as_ref() else {
            return Ok(());
        };

        let line = serde_json::to_string(&LogRecord {
            run_id: &run.run_id,
            category: &run.category,
            product_id: &run.product_id,
            ts: &event.ts,
            stage: event.stage.as_deref(),
            event: &event.event,
            payload: &event.payload,
        })
        .context("failed to serialize runtime event")?;
        self.store
            .append(&run_events_key(&run.run_id), &format!("{line}\n"))?;

        self.append_derived(derived)
    }

    fn append_derived(&self, derived: &[DerivedRecord]) -> Result<()> {
        let Some(run) = self.run.as_ref() else {
            return Ok(());
        };
        if derived.is_empty() {
            return Ok(());
        }

        let mut lines = String::new();
        for record in derived {
            let line = serde_json::to_string(&LogRecord {
                run_id: &run.run_id,
                category: &run.category,
                product_id: &run.product_id,
                ts: &record.ts,
                stage: record.stage.map(Stage::as_str),
                event: record.event,
                payload: &record.payload,
            })
            .context("failed to serialize derived runtime event")?;
            lines.push_str(&line);
            lines.push('\n');
        }
        self.store.append(&run_events_key(&run.run_id), &lines)
    }

    fn write_summary(&self) -> Result<()> {
        let Some(run) = self.run.as_ref() else {
            return Ok(());
        };

        let data = serde_json::to_string_pretty(run).context("failed to serialize run summary")?;
        self.store.write(&run_summary_key(&run.run_id), &format!("{data}\n"))
    }
}

fn apply_event(
    run: &mut RunSummary,
    inflight: &mut HashMap<String, String>,
    event: &RuntimeEvent,
) -> Vec<DerivedRecord> {
    let mut derived = Vec::new();
    let ts = event.ts.as_str();

    match event.event.as_str() {
        "run_started" => {}
        "search_started" | "search_query_started" | "search_results" => {
            start_stage(run, Stage::Search, ts, &mut derived);
        }
        "search_finished" | "search_completed" => {
            finish_stage(run, Stage::Search, ts, &mut derived);
        }
        "fetch_started" => {
            start_stage(run, Stage::Fetch, ts, &mut derived);
            run.counters.pages_checked += 1;
            if let Some(url) = event.payload_text("url") {
                inflight.insert(url, ts.to_string());
            }
        }
        "fetch_succeeded" | "fetch_completed" | "fetch_failed" => {
            complete_fetch(run, inflight, event, &mut derived);
        }
        "source_processed" => {
            complete_fetch(run, inflight, event, &mut derived);
            start_stage(run, Stage::Parse, ts, &mut derived);
            run.counters.parse_completed += 1;
        }
        "parse_started" => start_stage(run, Stage::Parse, ts, &mut derived),
        "parse_finished" => finish_stage(run, Stage::Parse, ts, &mut derived),
        "index_started" => start_stage(run, Stage::Index, ts, &mut derived),
        "source_indexed" => {
            start_stage(run, Stage::Index, ts, &mut derived);
            run.counters.indexed_docs += 1;
        }
        "fields_filled" => {
            start_stage(run, Stage::Index, ts, &mut derived);
            run.counters.fields_filled += count(event.payload.get("count")).unwrap_or(1);
        }
        "index_finished" => finish_stage(run, Stage::Index, ts, &mut derived),
        "stage_started" | "stage_finished" => {
            let stage = event
                .stage
                .as_deref()
                .and_then(Stage::parse)
                .or_else(|| event.payload_text("stage").as_deref().and_then(Stage::parse));
            match (stage, event.event.as_str()) {
                (Some(stage), "stage_started") => start_stage(run, stage, ts, &mut derived),
                (Some(stage), _) => finish_stage(run, stage, ts, &mut derived),
                (None, _) => debug!(event = %event.event, "stage event without known stage"),
            }
        }
        "needset_computed" => {
            run.needset = Some(NeedSetSummary {
                needset_size: count(event.payload.get("needset_size")).unwrap_or(0) as usize,
                total_fields: count(event.payload.get("total_fields")).unwrap_or(0) as usize,
                generated_at: event.payload_text("generated_at").unwrap_or_else(|| ts.to_string()),
            });
        }
        other => debug!(event = %other, "unhandled runtime event"),
    }

    derived
}

fn start_stage(run: &mut RunSummary, stage: Stage, ts: &str, derived: &mut Vec<DerivedRecord>) {
    let window = run.stages.get_mut(stage);
    if window.started_at.is_some() {
        return;
    }

    window.started_at = Some(ts.to_string());
    derived.push(DerivedRecord {
        ts: ts.to_string(),
        stage: Some(stage),
        event: "stage_started",
        payload: json!({ "stage": stage.as_str() }),
    });
}

fn finish_stage(run: &mut RunSummary, stage: Stage, ts: &str, derived: &mut Vec<DerivedRecord>) {
    start_stage(run, stage, ts, derived);

    let window = run.stages.get_mut(stage);
    if window.ended_at.is_some() {
        return;
    }

    window.ended_at = Some(ts.to_string());
    derived.push(DerivedRecord {
        ts: ts.to_string(),
        stage: Some(stage),
        event: "stage_finished",
        payload: json!({ "stage": stage.as_str() }),
    });
}

fn complete_fetch(
    run: &mut RunSummary,
    inflight: &mut HashMap<String, String>,
    event: &RuntimeEvent,
    derived: &mut Vec<DerivedRecord>,
) {
    let Some(url) = event.payload_text("url") else {
        return;
    };
    let Some(started_at) = inflight.remove(&url) else {
        return;
    };

    let outcome = FetchOutcome::classify(&event.event, &event.payload);
    run.counters.record_fetch(outcome);

    let duration_ms = match (parse_timestamp(&started_at), parse_timestamp(&event.ts)) {
        (Some(start), Some(end)) => (end - start).num_milliseconds().max(0),
        _ => 0,
    };

    derived.push(DerivedRecord {
        ts: event.ts.clone(),
        stage: Some(Stage::Fetch),
        event: "fetch_finished",
        payload: json!({
            "url": url,
            "outcome": outcome.as_str(),
            "status": count(first_present(&event.payload, &["status", "http_status"])),
            "duration_ms": duration_ms,
            "source_event": event.event,
        }),
    });
}

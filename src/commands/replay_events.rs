use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cli::ReplayEventsArgs;
use crate::runtime_bridge::{
    BlobStore, FsBlobStore, RuntimeBridge, RuntimeEvent, Stage, run_summary_key,
};

pub fn run(args: ReplayEventsArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.events)
        .with_context(|| format!("failed to read {}", args.events.display()))?;

    let mut events = Vec::new();
    let mut skipped = 0_usize;
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed = match serde_json::from_str::<Value>(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(line = index + 1, error = %err, "skipping malformed event line");
                skipped += 1;
                continue;
            }
        };
        match RuntimeEvent::from_value(&parsed) {
            Some(event) => events.push(event),
            None => {
                warn!(line = index + 1, "skipping event line without an event name");
                skipped += 1;
            }
        }
    }

    info!(
        path = %args.events.display(),
        events = events.len(),
        skipped,
        "replaying runtime events"
    );

    let final_ts = events.last().map(|event| event.ts.clone());
    let fs_store = Arc::new(FsBlobStore::new(&args.out_root));
    let store: Arc<dyn BlobStore> = fs_store.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let summary = runtime.block_on(async move {
        let bridge = RuntimeBridge::spawn(store);
        for event in events {
            bridge.on_runtime_event(event);
        }

        let summary = match final_ts {
            Some(ts) => bridge.finalize_at(ts).await,
            None => bridge.finalize().await,
        };
        bridge.shutdown().await;
        summary
    });

    match summary {
        Some(summary) => {
            for stage in Stage::ALL {
                let window = summary.stages.get(stage);
                debug!(
                    stage = stage.as_str(),
                    started_at = window.started_at.as_deref().unwrap_or(""),
                    ended_at = window.ended_at.as_deref().unwrap_or(""),
                    "stage window"
                );
            }
            info!(
                run_id = %summary.run_id,
                status = summary.status.as_str(),
                started_at = %summary.started_at,
                ended_at = %summary.ended_at.clone().unwrap_or_default(),
                pages_checked = summary.counters.pages_checked,
                fetched_ok = summary.counters.fetched_ok,
                fields_filled = summary.counters.fields_filled,
                summary_path = %fs_store.root().join(run_summary_key(&summary.run_id)).display(),
                "replay finished"
            );
        }
        None => warn!("no event carried a run id; nothing was recorded"),
    }

    Ok(())
}

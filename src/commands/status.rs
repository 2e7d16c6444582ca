use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde_json::Value;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::runtime_bridge::{BlobStore, FsBlobStore, run_events_key, run_summary_key};
use crate::util::{count, text_or_empty};

pub fn run(args: StatusArgs) -> Result<()> {
    let store = FsBlobStore::new(&args.out_root);

    info!(out_root = %args.out_root.display(), run_id = %args.run_id, "status requested");

    match store.read(&run_summary_key(&args.run_id))? {
        Some(raw) => {
            let summary: Value = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse run summary for {}", args.run_id))?;
            let counters = summary.get("counters");
            let counter = |key: &str| count(counters.and_then(|value| value.get(key))).unwrap_or(0);

            info!(
                run_id = %text_or_empty(summary.get("run_id")),
                status = %text_or_empty(summary.get("status")),
                category = %text_or_empty(summary.get("category")),
                product_id = %text_or_empty(summary.get("product_id")),
                started_at = %text_or_empty(summary.get("started_at")),
                ended_at = %text_or_empty(summary.get("ended_at")),
                pages_checked = counter("pages_checked"),
                fetched_ok = counter("fetched_ok"),
                fetched_404 = counter("fetched_404"),
                fetched_blocked = counter("fetched_blocked"),
                fetched_error = counter("fetched_error"),
                parse_completed = counter("parse_completed"),
                indexed_docs = counter("indexed_docs"),
                fields_filled = counter("fields_filled"),
                needset_size = count(summary.get("needset").and_then(|value| value.get("needset_size"))).unwrap_or(0),
                "loaded run summary"
            );
        }
        None => warn!(run_id = %args.run_id, "run summary missing"),
    }

    match store.read(&run_events_key(&args.run_id))? {
        Some(raw) => {
            let lines = raw.lines().filter(|line| !line.trim().is_empty()).count();
            info!(run_id = %args.run_id, lines, "run event log");
        }
        None => warn!(run_id = %args.run_id, "run event log missing"),
    }

    if let Some(db_path) = &args.db_path {
        report_mirror(db_path, &args.run_id)?;
    }

    Ok(())
}

fn report_mirror(db_path: &Path, run_id: &str) -> Result<()> {
    if !db_path.exists() {
        warn!(path = %db_path.display(), "indexing database missing");
        return Ok(());
    }

    let conn = Connection::open(db_path).with_context(|| format!("failed to open {}", db_path.display()))?;
    let sources = query_run_count(&conn, "SELECT COUNT(*) FROM source_registry WHERE run_id = ?1", run_id).unwrap_or(0);
    let assertions = query_run_count(
        &conn,
        "SELECT COUNT(*) FROM source_assertions a
         JOIN source_registry r ON r.source_version_id = a.source_version_id
         WHERE r.run_id = ?1",
        run_id,
    )
    .unwrap_or(0);
    let field_states = query_count(&conn, "SELECT COUNT(*) FROM item_field_state").unwrap_or(0);
    let review_queue = query_count(&conn, "SELECT COUNT(*) FROM item_review_queue").unwrap_or(0);

    info!(
        path = %db_path.display(),
        sources,
        assertions,
        field_states,
        review_queue,
        "database status"
    );

    Ok(())
}

fn query_count(conn: &Connection, sql: &str) -> Result<i64> {
    let count = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}

fn query_run_count(conn: &Connection, sql: &str, run_id: &str) -> Result<i64> {
    let count = conn.query_row(sql, [run_id], |row| row.get(0))?;
    Ok(count)
}

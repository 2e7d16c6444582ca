use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use crate::cli::NeedsetArgs;
use crate::model::NeedSetBundle;
use crate::needset::{compute_need_set, history_from_snapshot};
use crate::util::{now_utc_string, read_json, utc_compact_string, write_json_pretty};

const TOP_NEEDS_LOGGED: usize = 5;

pub fn run(args: NeedsetArgs) -> Result<()> {
    let bundle: NeedSetBundle = read_json(&args.input)?;

    let previous = match &args.previous {
        Some(path) => {
            let snapshot: Value = read_json(path)?;
            history_from_snapshot(&snapshot)
        }
        None => Vec::new(),
    };

    let generated_at = now_utc_string();
    let snapshot = compute_need_set(&bundle, previous, &generated_at);

    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&args, &bundle));
    write_json_pretty(&output_path, &snapshot)?;

    for row in snapshot.needs.iter().take(TOP_NEEDS_LOGGED) {
        debug!(
            field_key = %row.field_key,
            required_level = row.required_level.as_str(),
            need_score = row.need_score,
            reasons = row.reasons.len(),
            "ranked need"
        );
    }

    let summary = snapshot.summary();
    let top_fields = snapshot
        .ranked_field_keys()
        .into_iter()
        .take(TOP_NEEDS_LOGGED)
        .collect::<Vec<String>>();
    info!(
        run_id = %snapshot.run_id,
        product_id = %snapshot.product_id,
        total_fields = summary.total_fields,
        needset_size = summary.needset_size,
        top_fields = ?top_fields,
        history = snapshot.snapshots.len(),
        path = %output_path.display(),
        "need-set computed"
    );

    Ok(())
}

fn default_output_path(args: &NeedsetArgs, bundle: &NeedSetBundle) -> PathBuf {
    let run_id = match bundle.run_id.trim() {
        "" => format!("adhoc-{}", utc_compact_string(Utc::now())),
        run_id => run_id.to_string(),
    };

    args.out_root.join("runs").join(run_id).join("needset.json")
}

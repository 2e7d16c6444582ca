use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cli::{PackArgs, ValidationMode};
use crate::indexing::sql_mirror::{mirror_packets, open_mirror};
use crate::indexing::{
    BuildContext, ItemPacket, ItemPacketInput, RunMetaPacket, SourceInput, SourcePacket, SourcePacketBuilder,
    build_item_packet, build_run_meta_packet,
};
use crate::model::{PackBundle, PackCounts, PackPaths, PackRunManifest};
use crate::needset::ranked_field_keys_from_snapshot;
use crate::util::{ensure_directory, now_utc_string, read_json, write_json_pretty};
use crate::validation::{PacketSet, ValidationReport, ValidatorCache, validate_packets};

const MANIFEST_VERSION: u32 = 1;

pub fn run(args: PackArgs) -> Result<()> {
    let started_at = now_utc_string();
    let bundle: PackBundle = read_json(&args.input)?;
    if bundle.run_id.trim().is_empty() {
        bail!("pack input {} has no run_id", args.input.display());
    }

    let needset_field_keys = match &args.needset {
        Some(path) => {
            let snapshot: Value = read_json(path)?;
            ranked_field_keys_from_snapshot(&snapshot)
        }
        None => Vec::new(),
    };

    let ctx = BuildContext {
        run_id: bundle.run_id.clone(),
        category: bundle.category.clone(),
        product_id: bundle.product_id.clone(),
        created_at: started_at.clone(),
    };

    info!(
        run_id = %ctx.run_id,
        product_id = %ctx.product_id,
        sources = bundle.sources.len(),
        needset_fields = needset_field_keys.len(),
        "building indexing packets"
    );

    let mut warnings = Vec::new();
    let builder = SourcePacketBuilder::new()?;
    let mut inputs = Vec::with_capacity(bundle.sources.len());
    for (index, raw) in bundle.sources.iter().enumerate() {
        if !raw.is_object() {
            warn!(index, "skipping source record that is not an object");
            warnings.push(format!("source #{index} is not an object"));
            continue;
        }
        inputs.push(SourceInput::from_value(raw));
    }

    let batch = builder.build_all(&inputs, &ctx);
    if batch.superseded > 0 {
        warn!(
            run_id = %ctx.run_id,
            superseded = batch.superseded,
            "several source records share a canonical url; kept the latest fetch"
        );
        warnings.push(format!("{} duplicate source record(s) superseded", batch.superseded));
    }
    for packet in &batch.packets {
        debug!(
            source_packet_id = %packet.source_packet_id,
            canonical_url = %packet.source.canonical_url,
            assertions = packet.stats.assertion_count,
            evidence = packet.stats.evidence_count,
            "source packet built"
        );
    }
    let sources_without_candidates = batch.sources_without_candidates;
    let source_packets = batch.packets;
    let assertion_refs = batch.assertion_refs;

    let item_packet = build_item_packet(
        &ctx,
        &ItemPacketInput {
            item_identity: &bundle.item_identity,
            field_values: &bundle.field_values,
            source_packets: &source_packets,
            assertion_refs: &assertion_refs,
            needset_field_keys: &needset_field_keys,
        },
    );
    let run_meta_packet = build_run_meta_packet(&ctx, &bundle.run_summary, &source_packets, &item_packet);

    let out_dir = args.out_dir.join(&ctx.run_id);
    ensure_directory(&out_dir)?;
    let source_packets_path = out_dir.join("source_packets.json");
    let item_packet_path = out_dir.join("item_packet.json");
    let run_meta_packet_path = out_dir.join("run_meta_packet.json");

    write_json_pretty(&source_packets_path, &source_packets)?;
    write_json_pretty(&item_packet_path, &item_packet)?;
    write_json_pretty(&run_meta_packet_path, &run_meta_packet)?;

    let report = run_validation(&args, &source_packets, &item_packet, &run_meta_packet, &mut warnings)?;
    let validation_errors = report.as_ref().map(|report| report.errors.len()).unwrap_or(0);

    if let Some(db_path) = &args.db_path {
        let mut connection = open_mirror(db_path)?;
        mirror_packets(&mut connection, &source_packets, &item_packet)
            .with_context(|| format!("failed to mirror packets into {}", db_path.display()))?;
    }

    if !run_meta_packet.quality_gates_passed {
        warn!(run_id = %ctx.run_id, "one or more quality gates failed");
        warnings.push("quality gates failed".to_string());
    }

    let assertions_total = source_packets
        .iter()
        .map(|packet| packet.stats.assertion_count)
        .sum::<usize>();
    let evidence_total = source_packets
        .iter()
        .map(|packet| packet.stats.evidence_count)
        .sum::<usize>();

    let manifest = PackRunManifest {
        manifest_version: MANIFEST_VERSION,
        run_id: ctx.run_id.clone(),
        category: ctx.category.clone(),
        product_id: ctx.product_id.clone(),
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        paths: PackPaths {
            out_dir: display_path(&out_dir),
            source_packets_path: display_path(&source_packets_path),
            item_packet_path: display_path(&item_packet_path),
            run_meta_packet_path: display_path(&run_meta_packet_path),
            db_path: args.db_path.as_deref().map(display_path),
        },
        counts: PackCounts {
            sources_total: bundle.sources.len(),
            source_packets_built: source_packets.len(),
            sources_without_candidates,
            item_fields: item_packet.field_key_map.len(),
            assertions_total,
            evidence_total,
            validation_errors,
        },
        quality_gates_passed: run_meta_packet.quality_gates_passed,
        warnings,
    };
    let manifest_path = out_dir.join("pack_manifest.json");
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        run_id = %manifest.run_id,
        source_packets = manifest.counts.source_packets_built,
        sources_without_candidates = manifest.counts.sources_without_candidates,
        item_fields = manifest.counts.item_fields,
        assertions = manifest.counts.assertions_total,
        evidence = manifest.counts.evidence_total,
        quality_gates_passed = manifest.quality_gates_passed,
        manifest = %manifest_path.display(),
        "indexing packets written"
    );

    if args.validation == ValidationMode::Strict && validation_errors > 0 {
        bail!("{validation_errors} packet validation error(s); see {}", manifest_path.display());
    }

    Ok(())
}

fn run_validation(
    args: &PackArgs,
    source_packets: &[SourcePacket],
    item_packet: &ItemPacket,
    run_meta_packet: &RunMetaPacket,
    warnings: &mut Vec<String>,
) -> Result<Option<ValidationReport>> {
    if args.validation == ValidationMode::Off {
        return Ok(None);
    }

    let Some(schema_root) = resolve_schema_root(args, warnings) else {
        if args.validation == ValidationMode::Strict {
            bail!("strict validation needs an existing --schema-root");
        }
        return Ok(None);
    };

    let source_values = source_packets.iter().map(to_value).collect::<Result<Vec<Value>>>()?;
    let item_value = to_value(item_packet)?;
    let run_meta_value = to_value(run_meta_packet)?;

    let mut cache = ValidatorCache::new();
    let report = validate_packets(
        &mut cache,
        &schema_root,
        &PacketSet {
            source_packets: &source_values,
            item_packet: &item_value,
            run_meta_packet: &run_meta_value,
        },
    )?;

    for error in &report.errors {
        warn!(
            packet_type = error.packet_type.as_str(),
            packet_index = ?error.packet_index,
            message = %error.message,
            "packet failed validation"
        );
    }
    if !report.valid {
        warnings.push(format!("{} packet validation error(s)", report.errors.len()));
    }

    info!(
        schema_root = %schema_root.display(),
        schemas = cache.len(),
        valid = report.valid,
        errors = report.errors.len(),
        "packet validation finished"
    );

    Ok(Some(report))
}

fn resolve_schema_root(args: &PackArgs, warnings: &mut Vec<String>) -> Option<PathBuf> {
    let Some(schema_root) = &args.schema_root else {
        debug!("no schema root configured; skipping packet validation");
        return None;
    };

    if !schema_root.is_dir() {
        warn!(path = %schema_root.display(), "schema root missing; skipping packet validation");
        warnings.push(format!("schema root {} missing", schema_root.display()));
        return None;
    }

    Some(schema_root.clone())
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("failed to serialize packet for validation")
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

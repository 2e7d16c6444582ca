use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use super::BuildContext;
use super::item_packet::ItemPacket;
use super::source_packet::SourcePacket;
use super::taxonomy::ExtractionPhase;
use crate::util::{count, first_present, round6, short_id, unit_number};

pub const RUN_META_PACKET_SCHEMA_VERSION: &str = "2026-02-20.run-meta-packet.v1";
const RUN_META_PACKET_RECORD_KIND: &str = "run_meta_packet";
const MIN_COVERAGE_RATIO: f64 = 0.5;
const MAX_ERROR_RATIO: f64 = 0.5;
const MIN_TARGET_MATCH_PASS_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhaseStats {
    pub executed_sources: u64,
    pub assertion_count: u64,
    pub evidence_count: u64,
    pub error_count: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateComparator {
    AtLeast,
    GreaterThan,
    AtMost,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityGate {
    pub value: f64,
    pub threshold: f64,
    pub comparator: GateComparator,
    pub passed: bool,
}

impl QualityGate {
    fn evaluate(value: f64, threshold: f64, comparator: GateComparator) -> Self {
        let passed = match comparator {
            GateComparator::AtLeast => value >= threshold,
            GateComparator::GreaterThan => value > threshold,
            GateComparator::AtMost => value <= threshold,
        };
        Self {
            value: round6(value),
            threshold,
            comparator,
            passed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityGates {
    pub coverage: QualityGate,
    pub evidence: QualityGate,
    pub error_rate: QualityGate,
    pub target_match: QualityGate,
}

impl QualityGates {
    pub fn all_passed(&self) -> bool {
        [&self.coverage, &self.evidence, &self.error_rate, &self.target_match]
            .iter()
            .all(|gate| gate.passed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunTotals {
    pub source_total: u64,
    pub source_failed: u64,
    pub source_packet_count: usize,
    pub assertion_total: u64,
    pub evidence_total: u64,
    pub rejected_evidence_total: u64,
    pub item_field_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMetaPacket {
    pub schema_version: String,
    pub record_kind: String,
    pub run_meta_packet_id: String,
    pub run_id: String,
    pub category: String,
    pub product_id: String,
    pub created_at: String,
    pub item_packet_id: String,
    pub phase_summary: BTreeMap<ExtractionPhase, PhaseStats>,
    pub totals: RunTotals,
    pub quality_gates: QualityGates,
    pub quality_gates_passed: bool,
}

pub fn build_run_meta_packet(
    ctx: &BuildContext,
    run_summary: &Value,
    source_packets: &[SourcePacket],
    item_packet: &ItemPacket,
) -> RunMetaPacket {
    let mut phase_summary = ExtractionPhase::ALL
        .into_iter()
        .map(|phase| (phase, PhaseStats::default()))
        .collect::<BTreeMap<ExtractionPhase, PhaseStats>>();

    let mut assertion_total = 0_u64;
    let mut evidence_total = 0_u64;
    let mut rejected_evidence_total = 0_u64;
    let mut packets_with_errors = 0_u64;

    for packet in source_packets {
        let execution = &packet.parser_execution;
        let has_error = execution.error.is_some();
        if has_error {
            packets_with_errors += 1;
        }

        let executed = execution.phase_lineage.len() as u64;
        let duration_share = if executed == 0 {
            0
        } else {
            execution.duration_ms / executed
        };

        for (phase, lineage) in &execution.phase_lineage {
            let Some(stats) = phase_summary.get_mut(phase) else {
                continue;
            };
            stats.executed_sources += 1;
            stats.assertion_count += lineage.assertion_count as u64;
            stats.evidence_count += lineage.evidence_count as u64;
            stats.duration_ms += duration_share;
            if has_error {
                stats.error_count += 1;
            }
        }

        assertion_total += packet.stats.assertion_count as u64;
        evidence_total += packet.evidence_index.len() as u64;
        rejected_evidence_total += packet
            .evidence_index
            .values()
            .filter(|evidence| !evidence.target_match.target_match_passed)
            .count() as u64;
    }

    let source_total = count(run_summary.get("sources_attempted"))
        .unwrap_or(source_packets.len() as u64);
    let source_failed = count(run_summary.get("sources_failed")).unwrap_or(packets_with_errors);

    let coverage_ratio =
        unit_number(first_present(run_summary, &["coverage", "completeness"])).unwrap_or(0.0);
    let error_ratio = if source_total == 0 {
        0.0
    } else {
        source_failed as f64 / source_total as f64
    };
    let target_match_pass_ratio = if evidence_total == 0 {
        1.0
    } else {
        (evidence_total - rejected_evidence_total) as f64 / evidence_total as f64
    };

    let quality_gates = QualityGates {
        coverage: QualityGate::evaluate(coverage_ratio, MIN_COVERAGE_RATIO, GateComparator::AtLeast),
        evidence: QualityGate::evaluate(evidence_total as f64, 0.0, GateComparator::GreaterThan),
        error_rate: QualityGate::evaluate(error_ratio, MAX_ERROR_RATIO, GateComparator::AtMost),
        target_match: QualityGate::evaluate(
            target_match_pass_ratio,
            MIN_TARGET_MATCH_PASS_RATIO,
            GateComparator::AtLeast,
        ),
    };
    let quality_gates_passed = quality_gates.all_passed();

    RunMetaPacket {
        schema_version: RUN_META_PACKET_SCHEMA_VERSION.to_string(),
        record_kind: RUN_META_PACKET_RECORD_KIND.to_string(),
        run_meta_packet_id: short_id("rm", &[&ctx.run_id, &ctx.category, &ctx.product_id]),
        run_id: ctx.run_id.clone(),
        category: ctx.category.clone(),
        product_id: ctx.product_id.clone(),
        created_at: ctx.created_at.clone(),
        item_packet_id: item_packet.item_packet_id.clone(),
        phase_summary,
        totals: RunTotals {
            source_total,
            source_failed,
            source_packet_count: source_packets.len(),
            assertion_total,
            evidence_total,
            rejected_evidence_total,
            item_field_count: item_packet.field_key_map.len(),
        },
        quality_gates,
        quality_gates_passed,
    }
}

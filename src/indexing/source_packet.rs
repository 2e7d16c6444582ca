use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::taxonomy::{ExtractionPhase, SourceSurface, classify_phase, classify_surface};
use super::{BuildContext, ambiguity_level_for_score};
use crate::util::{
    count, first_present, flag, is_unknown_token, number, parse_timestamp, sha256_hex, short_id, text,
    unit_number, value_to_display,
};

pub const SOURCE_PACKET_SCHEMA_VERSION: &str = "2026-02-20.source-indexing-extraction-packet.v1";
const SOURCE_PACKET_RECORD_KIND: &str = "source_indexing_extraction_packet";
const TARGET_MATCH_AMBIGUITY: f64 = 0.08;
const TARGET_MISMATCH_AMBIGUITY: f64 = 0.82;
const DEFAULT_CONTEXT_KEY: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TargetMatch {
    pub target_match_passed: bool,
    pub target_match_score: f64,
}

impl TargetMatch {
    fn from_source(raw: &Value) -> Self {
        let verdict = first_present(raw, &["target_match", "identity_match"]);
        let Some(verdict) = verdict.filter(|value| value.is_object()) else {
            return Self {
                target_match_passed: false,
                target_match_score: 0.0,
            };
        };

        Self {
            target_match_passed: flag(first_present(verdict, &["target_match_passed", "passed"]))
                .unwrap_or(false),
            target_match_score: unit_number(first_present(
                verdict,
                &["target_match_score", "score"],
            ))
            .unwrap_or(0.0),
        }
    }

    pub fn ambiguity(self) -> Ambiguity {
        let score = if self.target_match_passed {
            TARGET_MATCH_AMBIGUITY
        } else {
            TARGET_MISMATCH_AMBIGUITY
        };
        Ambiguity {
            score,
            level: ambiguity_level_for_score(score).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ambiguity {
    pub score: f64,
    pub level: String,
}

#[derive(Debug, Clone)]
pub struct CandidateRow {
    pub index: usize,
    pub field_key: String,
    pub value_raw: String,
    pub value_normalized: String,
    pub unit: Option<String>,
    pub method: String,
    pub explicit_phase: Option<String>,
    pub explicit_surface: Option<String>,
    pub confidence: f64,
    pub parser_score: f64,
    pub evidence_ref_id: Option<String>,
    pub snippet_id: Option<String>,
    pub quote: Option<String>,
    pub key_path: Option<String>,
    pub file_uri: Option<String>,
    pub context_key: String,
}

impl CandidateRow {
    fn from_value(index: usize, raw: &Value) -> Option<Self> {
        let field_key = text(first_present(raw, &["field_key", "field"]))?;
        let value = raw.get("value");
        let normalized = raw.get("normalized_value");
        if is_unknown_token(value) && is_unknown_token(normalized) {
            return None;
        }

        let value_raw = if is_unknown_token(value) {
            value_to_display(normalized)
        } else {
            value_to_display(value)
        };
        let value_normalized = if is_unknown_token(normalized) {
            value_raw.clone()
        } else {
            value_to_display(normalized)
        };

        let confidence = unit_number(raw.get("confidence")).unwrap_or(0.0);
        let parser_score = number(first_present(raw, &["parser_score", "score"]))
            .unwrap_or(confidence);

        Some(Self {
            index,
            field_key,
            value_raw,
            value_normalized,
            unit: text(raw.get("unit")),
            method: text(first_present(raw, &["method", "extraction_method"])).unwrap_or_default(),
            explicit_phase: text(first_present(raw, &["phase_id", "phase"])),
            explicit_surface: text(first_present(raw, &["source_surface", "surface"])),
            confidence,
            parser_score,
            evidence_ref_id: text(first_present(raw, &["evidence_ref_id", "evidence_id"])),
            snippet_id: text(first_present(raw, &["snippet_id", "snippetId"])),
            quote: text(first_present(raw, &["quote", "snippet_text", "snippet"])),
            key_path: text(first_present(raw, &["key_path", "keyPath"])),
            file_uri: text(first_present(raw, &["file_uri", "artifact_uri"])),
            context_key: text(raw.get("context")).unwrap_or_else(|| DEFAULT_CONTEXT_KEY.to_string()),
        })
    }

    fn evidence_seed(&self) -> String {
        if let Some(evidence_ref_id) = &self.evidence_ref_id {
            return format!("ref:{evidence_ref_id}");
        }
        if let Some(snippet_id) = &self.snippet_id {
            return format!("snippet:{snippet_id}");
        }
        format!("row:{}|{}|{}", self.field_key, self.index, self.value_raw)
    }
}

#[derive(Debug, Clone)]
pub struct SourceInput {
    pub url: Option<String>,
    pub final_url: Option<String>,
    pub canonical_url: Option<String>,
    pub host: Option<String>,
    pub title: String,
    pub http_status: Option<u64>,
    pub fetched_at: Option<String>,
    pub tier: Option<u64>,
    pub content_type: Option<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub target_match: TargetMatch,
    pub html_uri: Option<String>,
    pub dom_snapshot_uri: Option<String>,
    pub screenshot_uri: Option<String>,
    pub candidates: Vec<CandidateRow>,
    pub skipped_unknown_rows: usize,
}

impl SourceInput {
    pub fn from_value(raw: &Value) -> Self {
        let artifacts = raw.get("artifacts").filter(|value| value.is_object());
        let artifact_uri = |keys: &[&str]| {
            artifacts
                .and_then(|block| text(first_present(block, keys)))
                .or_else(|| text(first_present(raw, keys)))
        };

        let rows = match first_present(raw, &["field_candidates", "candidates"]) {
            Some(Value::Array(rows)) => rows.as_slice(),
            _ => &[],
        };
        let candidates = rows
            .iter()
            .enumerate()
            .filter_map(|(index, row)| CandidateRow::from_value(index, row))
            .collect::<Vec<CandidateRow>>();
        let skipped_unknown_rows = rows.len() - candidates.len();

        let http_status = count(first_present(raw, &["status", "http_status"]));
        let error = text(raw.get("error")).or_else(|| {
            http_status
                .filter(|status| *status >= 400)
                .map(|status| format!("http_{status}"))
        });

        Self {
            url: text(raw.get("url")),
            final_url: text(raw.get("final_url")),
            canonical_url: text(raw.get("canonical_url")),
            host: text(raw.get("host")),
            title: text(raw.get("title")).unwrap_or_default(),
            http_status,
            fetched_at: text(first_present(raw, &["fetched_at", "ts"])),
            tier: count(raw.get("tier")).filter(|tier| *tier > 0),
            content_type: text(raw.get("content_type")),
            duration_ms: count(raw.get("duration_ms")).unwrap_or(0),
            error,
            target_match: TargetMatch::from_source(raw),
            html_uri: artifact_uri(&["html_uri", "page_html_uri"]),
            dom_snapshot_uri: artifact_uri(&["dom_snapshot_uri", "dom_uri"]),
            screenshot_uri: artifact_uri(&["screenshot_uri"]),
            candidates,
            skipped_unknown_rows,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Html,
    DomSnapshot,
    Screenshot,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::DomSnapshot => "dom_snapshot",
            Self::Screenshot => "screenshot",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceDescriptor {
    pub canonical_url: String,
    pub url: Option<String>,
    pub final_url: Option<String>,
    pub host: String,
    pub tier: Option<u64>,
    pub title: String,
    pub http_status: Option<u64>,
    pub fetched_at: Option<String>,
    pub content_hash: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseLineage {
    pub assertion_count: usize,
    pub evidence_count: usize,
    pub field_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParserExecution {
    pub phases_executed: Vec<ExtractionPhase>,
    pub surfaces_seen: Vec<SourceSurface>,
    pub phase_lineage: BTreeMap<ExtractionPhase, PhaseLineage>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    pub source_packet_id: String,
    pub source_version_id: String,
    pub artifact_kind: ArtifactKind,
    pub uri: String,
    pub captured_at: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceRecord {
    pub evidence_id: String,
    pub source_packet_id: String,
    pub source_version_id: String,
    pub artifact_id: String,
    pub field_key: String,
    pub quote: String,
    pub snippet_id: Option<String>,
    pub key_path: Option<String>,
    pub method: String,
    pub phase_id: ExtractionPhase,
    pub source_surface: SourceSurface,
    pub url: String,
    pub host: String,
    pub tier: Option<u64>,
    pub captured_at: Option<String>,
    pub target_match: TargetMatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssertionRecord {
    pub assertion_id: String,
    pub field_key: String,
    pub context_key: String,
    pub value_raw: String,
    pub value_normalized: String,
    pub unit: Option<String>,
    pub confidence: f64,
    pub parser_score: f64,
    pub method: String,
    pub phase_id: ExtractionPhase,
    pub source_surface: SourceSurface,
    pub evidence_refs: Vec<String>,
    pub target_match: TargetMatch,
    pub ambiguity: Ambiguity,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FieldContexts {
    pub contexts: BTreeMap<String, ContextAssertions>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextAssertions {
    pub assertions: Vec<AssertionRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub field_count: usize,
    pub assertion_count: usize,
    pub evidence_count: usize,
    pub artifact_count: usize,
    pub skipped_unknown_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRegistryRow {
    pub source_packet_id: String,
    pub source_version_id: String,
    pub run_id: String,
    pub category: String,
    pub product_id: String,
    pub canonical_url: String,
    pub host: String,
    pub tier: Option<u64>,
    pub http_status: Option<u64>,
    pub content_hash: String,
    pub fetched_at: Option<String>,
    pub target_match_passed: bool,
    pub target_match_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssertionRow {
    pub assertion_id: String,
    pub source_packet_id: String,
    pub source_version_id: String,
    pub field_key: String,
    pub context_key: String,
    pub value_raw: String,
    pub value_normalized: String,
    pub unit: Option<String>,
    pub confidence: f64,
    pub parser_score: f64,
    pub phase_id: ExtractionPhase,
    pub source_surface: SourceSurface,
    pub primary_evidence_id: Option<String>,
    pub target_match_passed: bool,
    pub ambiguity_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceRow {
    pub evidence_id: String,
    pub source_packet_id: String,
    pub source_version_id: String,
    pub artifact_id: String,
    pub field_key: String,
    pub quote: String,
    pub snippet_id: Option<String>,
    pub key_path: Option<String>,
    pub phase_id: ExtractionPhase,
    pub source_surface: SourceSurface,
    pub target_match_passed: bool,
    pub target_match_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSqlProjection {
    pub source_registry: Vec<SourceRegistryRow>,
    pub artifacts: Vec<ArtifactRecord>,
    pub assertions: Vec<AssertionRow>,
    pub evidence: Vec<EvidenceRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourcePacket {
    pub schema_version: String,
    pub record_kind: String,
    pub source_packet_id: String,
    pub source_version_id: String,
    pub run_id: String,
    pub category: String,
    pub product_id: String,
    pub created_at: String,
    pub source: SourceDescriptor,
    pub target_match: TargetMatch,
    pub parser_execution: ParserExecution,
    pub artifact_index: BTreeMap<String, ArtifactRecord>,
    pub evidence_index: BTreeMap<String, EvidenceRecord>,
    pub field_key_map: BTreeMap<String, FieldContexts>,
    pub stats: SourceStats,
    pub sql_projection: SourceSqlProjection,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssertionRef {
    pub assertion_id: String,
    pub field_key: String,
    pub context_key: String,
    pub source_packet_id: Option<String>,
    pub source_version_id: Option<String>,
    pub canonical_url: Option<String>,
    pub host: Option<String>,
    pub tier: Option<u64>,
    pub value: String,
    pub value_normalized: String,
    pub unit: Option<String>,
    pub confidence: f64,
    pub parser_score: f64,
    pub method: String,
    pub evidence_refs: Vec<String>,
    pub target_match_passed: bool,
    pub ambiguity_score: f64,
}

#[derive(Debug, Clone)]
pub struct SourcePacketOutput {
    pub packet: SourcePacket,
    pub assertion_refs: Vec<AssertionRef>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub packets: Vec<SourcePacket>,
    pub assertion_refs: Vec<AssertionRef>,
    pub sources_without_candidates: usize,
    pub superseded: usize,
}

// Later fetches win; unparseable timestamps fall back to input order.
fn supersedes(incoming: &SourcePacket, kept: &SourcePacket) -> bool {
    let fetched = |packet: &SourcePacket| packet.source.fetched_at.as_deref().and_then(parse_timestamp);
    match (fetched(incoming), fetched(kept)) {
        (Some(incoming), Some(kept)) => incoming >= kept,
        _ => true,
    }
}

struct KnownArtifacts {
    html: ArtifactRecord,
    dom_snapshot: Option<ArtifactRecord>,
    screenshot: Option<ArtifactRecord>,
}

impl KnownArtifacts {
    fn attribute(&self, file_uri: Option<&str>, surface: SourceSurface) -> &ArtifactRecord {
        let uri_matches = |artifact: &ArtifactRecord| file_uri == Some(artifact.uri.as_str());

        if let Some(screenshot) = &self.screenshot {
            if uri_matches(screenshot) || surface == SourceSurface::ScreenshotCapture {
                return screenshot;
            }
        }
        if let Some(dom_snapshot) = &self.dom_snapshot {
            if uri_matches(dom_snapshot) || surface == SourceSurface::DynamicDom {
                return dom_snapshot;
            }
        }
        &self.html
    }

    fn into_records(self) -> Vec<ArtifactRecord> {
        std::iter::once(self.html)
            .chain(self.dom_snapshot)
            .chain(self.screenshot)
            .collect()
    }
}

pub struct SourcePacketBuilder {
    url_pattern: Regex,
}

impl SourcePacketBuilder {
    pub fn new() -> Result<Self> {
        let url_pattern = Regex::new(r"^(?i)(https?)://([^/?#\s]+)([^#\s]*)")
            .context("failed to compile canonical url regex")?;
        Ok(Self { url_pattern })
    }

    pub fn canonicalize_url(&self, raw: &str) -> Option<String> {
        let captures = self.url_pattern.captures(raw.trim())?;
        let scheme = captures.get(1)?.as_str().to_ascii_lowercase();
        let host = captures.get(2)?.as_str().to_ascii_lowercase();
        let tail = captures.get(3).map(|value| value.as_str()).unwrap_or("");
        let path = if tail.is_empty() {
            "/".to_string()
        } else if tail.starts_with('?') {
            format!("/{tail}")
        } else {
            tail.to_string()
        };

        Some(format!("{scheme}://{host}{path}"))
    }

    fn host_of(&self, canonical_url: &str) -> String {
        self.url_pattern
            .captures(canonical_url)
            .and_then(|captures| captures.get(2))
            .map(|value| value.as_str().to_string())
            .unwrap_or_default()
    }

    pub fn build(&self, source: &SourceInput, ctx: &BuildContext) -> Option<SourcePacketOutput> {
        let canonical_url = [&source.canonical_url, &source.final_url, &source.url]
            .into_iter()
            .flatten()
            .find_map(|candidate| self.canonicalize_url(candidate))?;
        if source.candidates.is_empty() {
            return None;
        }

        let host = source
            .host
            .clone()
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_else(|| self.host_of(&canonical_url));
        let status_text = source
            .http_status
            .map(|status| status.to_string())
            .unwrap_or_default();
        let fetched_at = source.fetched_at.clone().unwrap_or_default();
        let content_hash = format!(
            "sha256:{}",
            sha256_hex(&[canonical_url.as_str(), &source.title, &status_text, &fetched_at].join("|"))
        );

        let source_packet_id = short_id("sp", &[&canonical_url]);
        let source_version_id = short_id("sv", &[&canonical_url, &content_hash]);

        let artifacts = self.known_artifacts(source, &canonical_url, &source_packet_id, &source_version_id);
        let target_match = source.target_match;
        let ambiguity = target_match.ambiguity();

        let mut evidence_index = BTreeMap::<String, EvidenceRecord>::new();
        let mut field_key_map = BTreeMap::<String, FieldContexts>::new();
        let mut phase_lineage = BTreeMap::<ExtractionPhase, PhaseLineage>::new();
        let mut phase_fields = BTreeMap::<ExtractionPhase, BTreeSet<String>>::new();
        let mut surfaces_seen = BTreeSet::<SourceSurface>::new();
        let mut assertion_refs = Vec::with_capacity(source.candidates.len());
        let mut assertion_rows = Vec::with_capacity(source.candidates.len());

        for row in &source.candidates {
            let phase = classify_phase(row.explicit_phase.as_deref(), &row.method);
            let surface = classify_surface(row.explicit_surface.as_deref(), &row.method);
            surfaces_seen.insert(surface);

            let artifact = artifacts.attribute(row.file_uri.as_deref(), surface);
            let evidence_id = short_id("ev", &[&source_version_id, &row.evidence_seed()]);
            let lineage = phase_lineage.entry(phase).or_default();
            if !evidence_index.contains_key(&evidence_id) {
                lineage.evidence_count += 1;
                evidence_index.insert(
                    evidence_id.clone(),
                    EvidenceRecord {
                        evidence_id: evidence_id.clone(),
                        source_packet_id: source_packet_id.clone(),
                        source_version_id: source_version_id.clone(),
                        artifact_id: artifact.artifact_id.clone(),
                        field_key: row.field_key.clone(),
                        quote: row.quote.clone().unwrap_or_else(|| row.value_raw.clone()),
                        snippet_id: row.snippet_id.clone(),
                        key_path: row.key_path.clone(),
                        method: row.method.clone(),
                        phase_id: phase,
                        source_surface: surface,
                        url: canonical_url.clone(),
                        host: host.clone(),
                        tier: source.tier,
                        captured_at: source.fetched_at.clone(),
                        target_match,
                    },
                );
            }
            lineage.assertion_count += 1;
            phase_fields
                .entry(phase)
                .or_default()
                .insert(row.field_key.clone());

            let index_text = row.index.to_string();
            let assertion_id = short_id(
                "as",
                &[
                    &source_version_id,
                    &row.field_key,
                    &row.context_key,
                    &index_text,
                    &row.value_raw,
                ],
            );

            let assertion = AssertionRecord {
                assertion_id: assertion_id.clone(),
                field_key: row.field_key.clone(),
                context_key: row.context_key.clone(),
                value_raw: row.value_raw.clone(),
                value_normalized: row.value_normalized.clone(),
                unit: row.unit.clone(),
                confidence: row.confidence,
                parser_score: row.parser_score,
                method: row.method.clone(),
                phase_id: phase,
                source_surface: surface,
                evidence_refs: vec![evidence_id.clone()],
                target_match,
                ambiguity: ambiguity.clone(),
            };

            assertion_rows.push(AssertionRow {
                assertion_id: assertion_id.clone(),
                source_packet_id: source_packet_id.clone(),
                source_version_id: source_version_id.clone(),
                field_key: row.field_key.clone(),
                context_key: row.context_key.clone(),
                value_raw: row.value_raw.clone(),
                value_normalized: row.value_normalized.clone(),
                unit: row.unit.clone(),
                confidence: row.confidence,
                parser_score: row.parser_score,
                phase_id: phase,
                source_surface: surface,
                primary_evidence_id: Some(evidence_id.clone()),
                target_match_passed: target_match.target_match_passed,
                ambiguity_score: ambiguity.score,
            });

            assertion_refs.push(AssertionRef {
                assertion_id,
                field_key: row.field_key.clone(),
                context_key: row.context_key.clone(),
                source_packet_id: Some(source_packet_id.clone()),
                source_version_id: Some(source_version_id.clone()),
                canonical_url: Some(canonical_url.clone()),
                host: Some(host.clone()),
                tier: source.tier,
                value: row.value_raw.clone(),
                value_normalized: row.value_normalized.clone(),
                unit: row.unit.clone(),
                confidence: row.confidence,
                parser_score: row.parser_score,
                method: row.method.clone(),
                evidence_refs: vec![evidence_id],
                target_match_passed: target_match.target_match_passed,
                ambiguity_score: ambiguity.score,
            });

            field_key_map
                .entry(row.field_key.clone())
                .or_default()
                .contexts
                .entry(row.context_key.clone())
                .or_default()
                .assertions
                .push(assertion);
        }

        for (phase, fields) in phase_fields {
            if let Some(lineage) = phase_lineage.get_mut(&phase) {
                lineage.field_count = fields.len();
            }
        }

        let artifact_records = artifacts.into_records();
        let artifact_index = artifact_records
            .iter()
            .map(|artifact| (artifact.artifact_id.clone(), artifact.clone()))
            .collect::<BTreeMap<String, ArtifactRecord>>();

        let evidence_rows = evidence_index
            .values()
            .map(|evidence| EvidenceRow {
                evidence_id: evidence.evidence_id.clone(),
                source_packet_id: evidence.source_packet_id.clone(),
                source_version_id: evidence.source_version_id.clone(),
                artifact_id: evidence.artifact_id.clone(),
                field_key: evidence.field_key.clone(),
                quote: evidence.quote.clone(),
                snippet_id: evidence.snippet_id.clone(),
                key_path: evidence.key_path.clone(),
                phase_id: evidence.phase_id,
                source_surface: evidence.source_surface,
                target_match_passed: target_match.target_match_passed,
                target_match_score: target_match.target_match_score,
            })
            .collect::<Vec<EvidenceRow>>();

        let registry_row = SourceRegistryRow {
            source_packet_id: source_packet_id.clone(),
            source_version_id: source_version_id.clone(),
            run_id: ctx.run_id.clone(),
            category: ctx.category.clone(),
            product_id: ctx.product_id.clone(),
            canonical_url: canonical_url.clone(),
            host: host.clone(),
            tier: source.tier,
            http_status: source.http_status,
            content_hash: content_hash.clone(),
            fetched_at: source.fetched_at.clone(),
            target_match_passed: target_match.target_match_passed,
            target_match_score: target_match.target_match_score,
        };

        let stats = SourceStats {
            field_count: field_key_map.len(),
            assertion_count: assertion_rows.len(),
            evidence_count: evidence_index.len(),
            artifact_count: artifact_index.len(),
            skipped_unknown_rows: source.skipped_unknown_rows,
        };

        let packet = SourcePacket {
            schema_version: SOURCE_PACKET_SCHEMA_VERSION.to_string(),
            record_kind: SOURCE_PACKET_RECORD_KIND.to_string(),
            source_packet_id,
            source_version_id,
            run_id: ctx.run_id.clone(),
            category: ctx.category.clone(),
            product_id: ctx.product_id.clone(),
            created_at: ctx.created_at.clone(),
            source: SourceDescriptor {
                canonical_url,
                url: source.url.clone(),
                final_url: source.final_url.clone(),
                host,
                tier: source.tier,
                title: source.title.clone(),
                http_status: source.http_status,
                fetched_at: source.fetched_at.clone(),
                content_hash,
                content_type: source.content_type.clone(),
            },
            target_match,
            parser_execution: ParserExecution {
                phases_executed: phase_lineage.keys().copied().collect(),
                surfaces_seen: surfaces_seen.into_iter().collect(),
                phase_lineage,
                duration_ms: source.duration_ms,
                error: source.error.clone(),
            },
            artifact_index,
            evidence_index,
            field_key_map,
            stats,
            sql_projection: SourceSqlProjection {
                source_registry: vec![registry_row],
                artifacts: artifact_records,
                assertions: assertion_rows,
                evidence: evidence_rows,
            },
        };

        Some(SourcePacketOutput {
            packet,
            assertion_refs,
        })
    }

    pub fn build_all(&self, sources: &[SourceInput], ctx: &BuildContext) -> SourceBatch {
        let mut outputs = Vec::<SourcePacketOutput>::new();
        let mut by_url = HashMap::<String, usize>::new();
        let mut sources_without_candidates = 0;
        let mut superseded = 0;

        for source in sources {
            let Some(output) = self.build(source, ctx) else {
                sources_without_candidates += 1;
                continue;
            };

            let canonical_url = output.packet.source.canonical_url.clone();
            match by_url.get(&canonical_url) {
                Some(&index) => {
                    superseded += 1;
                    if supersedes(&output.packet, &outputs[index].packet) {
                        debug!(canonical_url = %canonical_url, "newer fetch replaces source packet");
                        outputs[index] = output;
                    } else {
                        debug!(canonical_url = %canonical_url, "older fetch dropped for source packet");
                    }
                }
                None => {
                    by_url.insert(canonical_url, outputs.len());
                    outputs.push(output);
                }
            }
        }

        let mut batch = SourceBatch {
            sources_without_candidates,
            superseded,
            ..SourceBatch::default()
        };
        for output in outputs {
            batch.packets.push(output.packet);
            batch.assertion_refs.extend(output.assertion_refs);
        }
        batch
    }

    fn known_artifacts(
        &self,
        source: &SourceInput,
        canonical_url: &str,
        source_packet_id: &str,
        source_version_id: &str,
    ) -> KnownArtifacts {
        let record = |kind: ArtifactKind, uri: &str, content_type: Option<String>| ArtifactRecord {
            artifact_id: short_id("art", &[source_version_id, kind.as_str(), uri]),
            source_packet_id: source_packet_id.to_string(),
            source_version_id: source_version_id.to_string(),
            artifact_kind: kind,
            uri: uri.to_string(),
            captured_at: source.fetched_at.clone(),
            content_type,
        };

        let html_uri = source.html_uri.as_deref().unwrap_or(canonical_url);
        KnownArtifacts {
            html: record(
                ArtifactKind::Html,
                html_uri,
                source
                    .content_type
                    .clone()
                    .or_else(|| Some("text/html".to_string())),
            ),
            dom_snapshot: source.dom_snapshot_uri.as_deref().map(|uri| {
                record(ArtifactKind::DomSnapshot, uri, Some("text/html".to_string()))
            }),
            screenshot: source
                .screenshot_uri
                .as_deref()
                .map(|uri| record(ArtifactKind::Screenshot, uri, Some("image/png".to_string()))),
        }
    }
}

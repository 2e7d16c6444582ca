use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

use super::source_packet::{AssertionRef, SourcePacket};
use super::{BuildContext, ambiguity_level_for_score};
use crate::util::{is_unknown_token, short_id, text, value_to_display};

pub const ITEM_PACKET_SCHEMA_VERSION: &str = "2026-02-20.item-indexing-extraction-packet.v1";
const ITEM_PACKET_RECORD_KIND: &str = "item_indexing_extraction_packet";
const PRIORITY_FIELD_LIMIT: usize = 24;
const FALLBACK_FIELD_KEY: &str = "model";
const FALLBACK_METHOD: &str = "fallback";

#[derive(Debug, Clone, Serialize)]
pub struct SourcePacketRef {
    pub source_packet_id: String,
    pub source_version_id: String,
    pub canonical_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedCandidate {
    pub rank: usize,
    #[serde(flatten)]
    pub assertion: AssertionRef,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldMetrics {
    pub candidate_count: usize,
    pub max_ambiguity_score: f64,
    pub ambiguity_level: String,
    pub has_conflict: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemField {
    pub field_key: String,
    pub value: String,
    pub value_source: String,
    pub confidence: f64,
    pub candidates: Vec<RankedCandidate>,
    pub metrics: FieldMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexingProjection {
    pub priority_field_keys: Vec<String>,
    pub field_count: usize,
    pub candidate_count: usize,
    pub conflict_field_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFieldStateRow {
    pub item_packet_id: String,
    pub field_key: String,
    pub value: String,
    pub confidence: f64,
    pub candidate_count: usize,
    pub ambiguity_level: String,
    pub has_conflict: bool,
    pub top_assertion_id: Option<String>,
    pub priority_rank: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemCandidateRow {
    pub item_packet_id: String,
    pub field_key: String,
    pub rank: usize,
    pub assertion_id: String,
    pub source_packet_id: Option<String>,
    pub value: String,
    pub confidence: f64,
    pub parser_score: f64,
    pub method: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewQueueRow {
    pub item_packet_id: String,
    pub field_key: String,
    pub reason: String,
    pub ambiguity_level: String,
    pub candidate_count: usize,
    pub priority_rank: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemSqlProjection {
    pub item_field_state: Vec<ItemFieldStateRow>,
    pub item_candidates: Vec<ItemCandidateRow>,
    pub review_queue: Vec<ReviewQueueRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemPacket {
    pub schema_version: String,
    pub record_kind: String,
    pub item_packet_id: String,
    pub run_id: String,
    pub category: String,
    pub product_id: String,
    pub created_at: String,
    pub item_identity: Value,
    pub source_packet_refs: Vec<SourcePacketRef>,
    pub field_key_map: BTreeMap<String, ItemField>,
    pub field_source_index: BTreeMap<String, Vec<String>>,
    pub indexing_projection: IndexingProjection,
    pub sql_projection: ItemSqlProjection,
}

pub struct ItemPacketInput<'a> {
    pub item_identity: &'a Value,
    pub field_values: &'a Value,
    pub source_packets: &'a [SourcePacket],
    pub assertion_refs: &'a [AssertionRef],
    pub needset_field_keys: &'a [String],
}

pub fn build_item_packet(ctx: &BuildContext, input: &ItemPacketInput<'_>) -> ItemPacket {
    let item_packet_id = short_id("ip", &[&ctx.category, &ctx.product_id]);

    let mut grouped = BTreeMap::<String, Vec<AssertionRef>>::new();
    for assertion in input.assertion_refs {
        grouped
            .entry(assertion.field_key.clone())
            .or_default()
            .push(assertion.clone());
    }
    if grouped.is_empty() {
        let fallback = fallback_model_candidate(&item_packet_id, input.item_identity, ctx);
        grouped.insert(FALLBACK_FIELD_KEY.to_string(), vec![fallback]);
    }

    let mut field_key_map = BTreeMap::<String, ItemField>::new();
    let mut field_source_index = BTreeMap::<String, Vec<String>>::new();
    for (field_key, mut candidates) in grouped {
        candidates.sort_by(|a, b| b.parser_score.total_cmp(&a.parser_score));

        let sources = candidates
            .iter()
            .filter_map(|candidate| candidate.source_packet_id.clone())
            .collect::<BTreeSet<String>>();
        field_source_index.insert(field_key.clone(), sources.into_iter().collect());

        field_key_map.insert(
            field_key.clone(),
            aggregate_field(&field_key, candidates, input.field_values),
        );
    }

    let priority_field_keys = if input.needset_field_keys.is_empty() {
        field_key_map
            .keys()
            .take(PRIORITY_FIELD_LIMIT)
            .cloned()
            .collect::<Vec<String>>()
    } else {
        input
            .needset_field_keys
            .iter()
            .take(PRIORITY_FIELD_LIMIT)
            .cloned()
            .collect::<Vec<String>>()
    };
    let priority_rank = |field_key: &str| {
        priority_field_keys
            .iter()
            .position(|key| key == field_key)
            .map(|index| index + 1)
    };

    let mut item_field_state = Vec::with_capacity(field_key_map.len());
    let mut item_candidates = Vec::new();
    let mut review_queue = Vec::new();
    for field in field_key_map.values() {
        item_field_state.push(ItemFieldStateRow {
            item_packet_id: item_packet_id.clone(),
            field_key: field.field_key.clone(),
            value: field.value.clone(),
            confidence: field.confidence,
            candidate_count: field.metrics.candidate_count,
            ambiguity_level: field.metrics.ambiguity_level.clone(),
            has_conflict: field.metrics.has_conflict,
            top_assertion_id: field
                .candidates
                .first()
                .map(|candidate| candidate.assertion.assertion_id.clone()),
            priority_rank: priority_rank(&field.field_key),
        });

        item_candidates.extend(field.candidates.iter().map(|candidate| ItemCandidateRow {
            item_packet_id: item_packet_id.clone(),
            field_key: field.field_key.clone(),
            rank: candidate.rank,
            assertion_id: candidate.assertion.assertion_id.clone(),
            source_packet_id: candidate.assertion.source_packet_id.clone(),
            value: candidate.assertion.value.clone(),
            confidence: candidate.assertion.confidence,
            parser_score: candidate.assertion.parser_score,
            method: candidate.assertion.method.clone(),
        }));

        let reason = if field.metrics.has_conflict {
            Some("conflict")
        } else if field.metrics.ambiguity_level != "low" {
            Some("ambiguity")
        } else {
            None
        };
        if let Some(reason) = reason {
            review_queue.push(ReviewQueueRow {
                item_packet_id: item_packet_id.clone(),
                field_key: field.field_key.clone(),
                reason: reason.to_string(),
                ambiguity_level: field.metrics.ambiguity_level.clone(),
                candidate_count: field.metrics.candidate_count,
                priority_rank: priority_rank(&field.field_key),
            });
        }
    }

    let source_packet_refs = input
        .source_packets
        .iter()
        .map(|packet| SourcePacketRef {
            source_packet_id: packet.source_packet_id.clone(),
            source_version_id: packet.source_version_id.clone(),
            canonical_url: packet.source.canonical_url.clone(),
        })
        .collect::<Vec<SourcePacketRef>>();

    let indexing_projection = IndexingProjection {
        priority_field_keys,
        field_count: field_key_map.len(),
        candidate_count: item_candidates.len(),
        conflict_field_count: field_key_map
            .values()
            .filter(|field| field.metrics.has_conflict)
            .count(),
    };

    ItemPacket {
        schema_version: ITEM_PACKET_SCHEMA_VERSION.to_string(),
        record_kind: ITEM_PACKET_RECORD_KIND.to_string(),
        item_packet_id,
        run_id: ctx.run_id.clone(),
        category: ctx.category.clone(),
        product_id: ctx.product_id.clone(),
        created_at: ctx.created_at.clone(),
        item_identity: input.item_identity.clone(),
        source_packet_refs,
        field_key_map,
        field_source_index,
        indexing_projection,
        sql_projection: ItemSqlProjection {
            item_field_state,
            item_candidates,
            review_queue,
        },
    }
}

fn aggregate_field(field_key: &str, candidates: Vec<AssertionRef>, field_values: &Value) -> ItemField {
    let resolved = field_values
        .get(field_key)
        .filter(|value| !is_unknown_token(Some(value)));
    let (value, value_source) = match resolved {
        Some(value) => (value_to_display(Some(value)), "consensus"),
        None => (
            candidates
                .first()
                .map(|candidate| candidate.value.clone())
                .unwrap_or_default(),
            "top_candidate",
        ),
    };

    let max_ambiguity_score = candidates
        .iter()
        .map(|candidate| candidate.ambiguity_score)
        .fold(0.0_f64, f64::max);
    let metrics = FieldMetrics {
        candidate_count: candidates.len(),
        max_ambiguity_score,
        ambiguity_level: ambiguity_level_for_score(max_ambiguity_score).to_string(),
        has_conflict: candidates.len() > 1,
    };

    ItemField {
        field_key: field_key.to_string(),
        value,
        value_source: value_source.to_string(),
        confidence: candidates
            .first()
            .map(|candidate| candidate.confidence)
            .unwrap_or(0.0),
        candidates: candidates
            .into_iter()
            .enumerate()
            .map(|(index, assertion)| RankedCandidate {
                rank: index + 1,
                assertion,
            })
            .collect(),
        metrics,
    }
}

fn fallback_model_candidate(
    item_packet_id: &str,
    item_identity: &Value,
    ctx: &BuildContext,
) -> AssertionRef {
    let value = text(item_identity.get("model")).unwrap_or_else(|| ctx.product_id.clone());

    AssertionRef {
        assertion_id: short_id("as", &[item_packet_id, FALLBACK_FIELD_KEY, FALLBACK_METHOD, &value]),
        field_key: FALLBACK_FIELD_KEY.to_string(),
        context_key: "default".to_string(),
        source_packet_id: None,
        source_version_id: None,
        canonical_url: None,
        host: None,
        tier: None,
        value: value.clone(),
        value_normalized: value,
        unit: None,
        confidence: 1.0,
        parser_score: 1.0,
        method: FALLBACK_METHOD.to_string(),
        evidence_refs: Vec::new(),
        target_match_passed: true,
        ambiguity_score: 0.0,
    }
}

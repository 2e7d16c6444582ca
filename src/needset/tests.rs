use serde_json::{Value, json};

use super::*;
use crate::needset::scorer::{NeedReason, NeedStatus};

const NOW: &str = "2026-02-20T12:00:00Z";

fn locked_identity() -> Value {
    json!({
        "confidence": 0.995,
        "identity_gate_validated": true
    })
}

fn provisional_identity() -> Value {
    json!({ "confidence": 0.92 })
}

fn bundle(provenance: Value, field_rules: Value, identity: Value) -> NeedSetBundle {
    NeedSetBundle {
        run_id: "run-1".to_string(),
        category: "mouse".to_string(),
        product_id: "mouse-1".to_string(),
        provenance,
        field_rules,
        identity,
        ..NeedSetBundle::default()
    }
}

fn row<'a>(snapshot: &'a NeedSetSnapshot, field_key: &str) -> &'a NeedRow {
    snapshot
        .needs
        .iter()
        .find(|row| row.field_key == field_key)
        .unwrap_or_else(|| panic!("missing need row for {field_key}"))
}

#[test]
fn missing_critical_field_with_open_gate_scores_eight() {
    let snapshot = compute_need_set(
        &bundle(
            json!({ "dpi": { "value": "unk" } }),
            json!({ "dpi": { "required_level": "critical", "min_evidence_refs": 0 } }),
            locked_identity(),
        ),
        Vec::new(),
        NOW,
    );

    let dpi = row(&snapshot, "dpi");
    assert!(dpi.reasons.contains(&NeedReason::Missing));
    assert!(!dpi.reasons.contains(&NeedReason::MinRefsFail));
    assert!(!dpi.reasons.contains(&NeedReason::IdentityUnlocked));
    assert!(!dpi.reasons.contains(&NeedReason::BlockedByIdentity));
    assert!(!dpi.reasons.contains(&NeedReason::PublishGateBlock));
    assert_eq!(dpi.status, NeedStatus::Unknown);
    assert_eq!(dpi.need_score, 8.0);
    assert!(dpi.value.is_none());
}

#[test]
fn provisional_identity_caps_gated_confidence() {
    let snapshot = compute_need_set(
        &bundle(
            json!({
                "weight": {
                    "value": "58 g",
                    "confidence": 0.9,
                    "pass_target": 0.8,
                    "evidence": [{ "url": "https://example.com/spec", "tier": 1 }]
                }
            }),
            json!({ "weight": { "required_level": "expected" } }),
            provisional_identity(),
        ),
        Vec::new(),
        NOW,
    );

    let weight = row(&snapshot, "weight");
    assert_eq!(weight.effective_confidence, Some(0.74));
    assert_eq!(weight.reasons, vec![NeedReason::LowConf]);
    assert_eq!(weight.need_score, 0.26);
    assert_eq!(weight.status, NeedStatus::Accepted);
    assert_eq!(weight.value.as_deref(), Some("58 g"));
}

#[test]
fn ungated_field_keeps_raw_confidence() {
    let snapshot = compute_need_set(
        &bundle(
            json!({
                "color": {
                    "value": "black",
                    "confidence": 0.7,
                    "evidence": [{ "url": "https://example.com/spec" }]
                }
            }),
            json!({ "color": { "required_level": "optional", "identity_gated": false } }),
            provisional_identity(),
        ),
        Vec::new(),
        NOW,
    );

    assert_eq!(row(&snapshot, "color").effective_confidence, Some(0.7));
}

#[test]
fn closed_gate_blocks_required_levels_and_flags_missing_values() {
    let snapshot = compute_need_set(
        &bundle(
            json!({ "sensor": { "value": null } }),
            json!({ "sensor": { "required_level": "critical" } }),
            json!({ "confidence": 0.3 }),
        ),
        Vec::new(),
        NOW,
    );

    let sensor = row(&snapshot, "sensor");
    for reason in [
        NeedReason::Missing,
        NeedReason::MinRefsFail,
        NeedReason::LowConf,
        NeedReason::IdentityUnlocked,
        NeedReason::BlockedByIdentity,
        NeedReason::PublishGateBlock,
    ] {
        assert!(sensor.reasons.contains(&reason), "expected {reason:?}");
    }
    assert_eq!(sensor.blocked_by, vec!["identity_gate", "publish_gate"]);
    assert_eq!(sensor.need_score, round_score(2.0 * 4.0 * 1.5 * 1.35 * 1.2));
}

fn round_score(value: f64) -> f64 {
    crate::util::round6(value)
}

#[test]
fn satisfied_fields_are_left_out() {
    let snapshot = compute_need_set(
        &bundle(
            json!({
                "buttons": {
                    "value": 6,
                    "confidence": 0.97,
                    "evidence": [{ "url": "https://example.com/spec", "tier": 1 }]
                }
            }),
            json!({ "buttons": { "required_level": "required" } }),
            locked_identity(),
        ),
        Vec::new(),
        NOW,
    );

    assert_eq!(snapshot.total_fields, 1);
    assert_eq!(snapshot.needset_size, 0);
    assert!(snapshot.needs.is_empty());
}

#[test]
fn every_row_carries_at_least_one_reason_and_bounded_confidence() {
    let snapshot = compute_need_set(
        &bundle(
            json!({
                "a": { "value": "x", "confidence": 0.95 },
                "b": { "value": "unknown" },
                "c": { "value": "y", "confidence": 0.5, "evidence": [{ "url": "u", "tier": 3 }] },
                "d": { "value": "z", "confidence": 1.0, "evidence": [{ "url": "u" }] }
            }),
            json!({
                "a": { "required_level": "identity" },
                "c": { "required_level": "required", "tier_preference": [1] }
            }),
            json!({ "status": "conflict", "confidence": 0.5 }),
        ),
        Vec::new(),
        NOW,
    );

    assert!(!snapshot.needs.is_empty());
    for need in &snapshot.needs {
        assert!(!need.reasons.is_empty(), "{} has no reasons", need.field_key);
        if let (Some(raw), Some(effective)) = (need.confidence, need.effective_confidence) {
            assert!(effective <= raw);
        }
    }
    assert_eq!(row(&snapshot, "d").effective_confidence, Some(0.39));
}

#[test]
fn ranking_breaks_score_ties_by_weight_then_key() {
    let snapshot = compute_need_set(
        &bundle(
            json!({
                "b_optional": { "value": "unk" },
                "a_optional": { "value": "" },
                "required_field": {
                    "value": "present",
                    "confidence": 0.0,
                    "evidence": [{ "url": "https://example.com/spec" }]
                }
            }),
            json!({
                "required_field": { "required_level": "required" },
                "a_optional": { "min_evidence_refs": 0 },
                "b_optional": { "min_evidence_refs": 0 }
            }),
            locked_identity(),
        ),
        Vec::new(),
        NOW,
    );

    let keys = snapshot.ranked_field_keys();
    assert_eq!(keys, vec!["required_field", "a_optional", "b_optional"]);
    assert!(snapshot.needs.iter().all(|need| need.need_score == 2.0));
}

#[test]
fn identical_inputs_produce_identical_snapshots() {
    let input = bundle(
        json!({
            "dpi": { "value": "unk" },
            "weight": { "value": "60", "confidence": 0.4 }
        }),
        json!({ "dpi": { "priority": "critical" } }),
        provisional_identity(),
    );

    let first = compute_need_set(&input, Vec::new(), NOW);
    let second = compute_need_set(&input, Vec::new(), NOW);
    assert_eq!(first.needs, second.needs);
    assert_eq!(first.reason_counts, second.reason_counts);
}

#[test]
fn field_keys_are_the_union_of_order_provenance_and_rules() {
    let mut input = bundle(
        json!({ "from_provenance": { "value": "x", "confidence": 1.0 } }),
        json!({ "from_rules": { "required_level": "expected" } }),
        locked_identity(),
    );
    input.field_order = json!(["from_order", "from_provenance"]);

    let snapshot = compute_need_set(&input, Vec::new(), NOW);
    assert_eq!(snapshot.total_fields, 3);
    assert!(snapshot.needs.iter().any(|need| need.field_key == "from_order"));
    assert!(snapshot.needs.iter().any(|need| need.field_key == "from_rules"));
}

#[test]
fn malformed_sections_are_tolerated() {
    let input = NeedSetBundle {
        run_id: "run-1".to_string(),
        field_order: json!("not-an-array"),
        provenance: json!([1, 2, 3]),
        field_rules: json!("critical"),
        field_reasoning: json!(42),
        constraint_analysis: json!({ "contradictions": "weight" }),
        identity: json!("locked"),
        ..NeedSetBundle::default()
    };

    let snapshot = compute_need_set(&input, Vec::new(), NOW);
    assert_eq!(snapshot.total_fields, 0);
    assert!(snapshot.needs.is_empty());
    assert_eq!(snapshot.identity_lock_state.status.as_str(), "unlocked");
}

#[test]
fn run_level_contradictions_mark_conflict() {
    let mut input = bundle(
        json!({
            "weight": {
                "value": "58",
                "confidence": 0.99,
                "evidence": [{ "url": "https://example.com/spec", "tier": 1 }]
            }
        }),
        json!({ "weight": { "required_level": "expected" } }),
        locked_identity(),
    );
    input.constraint_analysis = json!({ "contradictions": [{ "fields": ["weight", "length"] }] });

    let snapshot = compute_need_set(&input, Vec::new(), NOW);
    let weight = row(&snapshot, "weight");
    assert_eq!(weight.reasons, vec![NeedReason::Conflict]);
    assert_eq!(weight.status, NeedStatus::Conflict);
}

#[test]
fn per_field_reasoning_conflict_is_detected() {
    let mut input = bundle(
        json!({ "dpi": { "value": "26000", "confidence": 0.99, "evidence": [{ "url": "u" }] } }),
        Value::Null,
        locked_identity(),
    );
    input.field_reasoning = json!({ "dpi": { "reasons": ["constraint_conflict"] } });

    let snapshot = compute_need_set(&input, Vec::new(), NOW);
    assert!(row(&snapshot, "dpi").reasons.contains(&NeedReason::Conflict));
}

#[test]
fn tier_preference_requires_tier_one_evidence() {
    let snapshot = compute_need_set(
        &bundle(
            json!({
                "polling_rate": {
                    "value": "1000",
                    "confidence": 0.95,
                    "evidence": [{ "url": "https://review.example.com/a", "tier": 2 }]
                }
            }),
            json!({ "polling_rate": { "evidence": { "tier_preference": [1, 2] } } }),
            locked_identity(),
        ),
        Vec::new(),
        NOW,
    );

    let polling = row(&snapshot, "polling_rate");
    assert_eq!(polling.reasons, vec![NeedReason::TierPrefUnmet]);
    assert_eq!(polling.best_tier_seen, Some(2));
}

#[test]
fn duplicate_evidence_refs_count_once() {
    let snapshot = compute_need_set(
        &bundle(
            json!({
                "weight": {
                    "value": "58",
                    "confidence": 0.95,
                    "evidence": [
                        { "url": "https://example.com/spec", "keyPath": "specs.weight", "snippet_id": "s1" },
                        { "url": "https://example.com/spec", "key_path": "specs.weight", "snippetId": "s1" }
                    ]
                }
            }),
            json!({ "weight": { "min_evidence_refs": 2 } }),
            locked_identity(),
        ),
        Vec::new(),
        NOW,
    );

    let weight = row(&snapshot, "weight");
    assert_eq!(weight.refs_found, 1);
    assert_eq!(weight.reasons, vec![NeedReason::MinRefsFail]);
}

#[test]
fn missing_field_still_owes_its_evidence_refs() {
    let snapshot = compute_need_set(
        &bundle(
            json!({ "dpi": { "value": "unk" } }),
            json!({ "dpi": { "required_level": "critical", "min_evidence_refs": 3 } }),
            locked_identity(),
        ),
        Vec::new(),
        NOW,
    );

    let dpi = row(&snapshot, "dpi");
    assert_eq!(dpi.refs_found, 0);
    assert_eq!(dpi.min_refs, 3);
    assert!(dpi.reasons.contains(&NeedReason::Missing));
    assert!(dpi.reasons.contains(&NeedReason::MinRefsFail));
    assert_eq!(dpi.need_score, 12.0);
}

#[test]
fn snapshot_history_is_capped() {
    let previous = (0..60)
        .map(|index| NeedSetHistoryEntry {
            ts: format!("2026-01-01T00:00:{:02}Z", index % 60),
            needset_size: index,
        })
        .collect::<Vec<_>>();

    let snapshot = compute_need_set(
        &bundle(json!({ "dpi": { "value": "unk" } }), Value::Null, locked_identity()),
        previous,
        NOW,
    );

    assert_eq!(snapshot.snapshots.len(), 50);
    let last = snapshot.snapshots.last().unwrap();
    assert_eq!(last.ts, NOW);
    assert_eq!(last.needset_size, 1);
    assert_eq!(snapshot.snapshots[0].needset_size, 11);
}

#[test]
fn history_and_ranking_round_trip_through_json() {
    let snapshot = compute_need_set(
        &bundle(
            json!({ "dpi": { "value": "unk" }, "weight": { "value": "unk" } }),
            json!({ "dpi": { "required_level": "critical" } }),
            locked_identity(),
        ),
        Vec::new(),
        NOW,
    );
    let document = serde_json::to_value(&snapshot).unwrap();

    let history = history_from_snapshot(&document);
    assert_eq!(history, snapshot.snapshots);
    assert_eq!(ranked_field_keys_from_snapshot(&document), vec!["dpi", "weight"]);
    assert_eq!(snapshot.reason_counts.get("missing"), Some(&2));
    assert_eq!(snapshot.required_level_counts.get("critical"), Some(&1));
}

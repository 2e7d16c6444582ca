use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use crate::identity::{IdentityAuditRow, IdentityContext, normalize_identity_context};
use crate::model::NeedSetBundle;
use crate::util::{count, text};

pub mod scorer;
#[cfg(test)]
mod tests;

pub use scorer::NeedRow;
use scorer::{
    FieldProvenance, FieldReasoning, FieldRule, FieldSignals, contradiction_field_keys,
    score_field,
};

const SNAPSHOT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NeedSetHistoryEntry {
    pub ts: String,
    pub needset_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NeedSetSummary {
    pub needset_size: usize,
    pub total_fields: usize,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NeedSetSnapshot {
    pub run_id: String,
    pub category: String,
    pub product_id: String,
    pub generated_at: String,
    pub total_fields: usize,
    pub needset_size: usize,
    pub identity_lock_state: IdentityContext,
    pub identity_audit_rows: Vec<IdentityAuditRow>,
    pub reason_counts: BTreeMap<String, usize>,
    pub required_level_counts: BTreeMap<String, usize>,
    pub needs: Vec<NeedRow>,
    pub snapshots: Vec<NeedSetHistoryEntry>,
}

impl NeedSetSnapshot {
    pub fn summary(&self) -> NeedSetSummary {
        NeedSetSummary {
            needset_size: self.needset_size,
            total_fields: self.total_fields,
            generated_at: self.generated_at.clone(),
        }
    }

    pub fn ranked_field_keys(&self) -> Vec<String> {
        self.needs.iter().map(|row| row.field_key.clone()).collect()
    }
}

pub fn compute_need_set(
    bundle: &NeedSetBundle,
    previous_snapshots: Vec<NeedSetHistoryEntry>,
    generated_at: &str,
) -> NeedSetSnapshot {
    let identity = normalize_identity_context(&bundle.identity, generated_at);
    let run_contradictions = contradiction_field_keys(&bundle.constraint_analysis);
    let field_keys = collect_field_keys(bundle);

    let mut needs = field_keys
        .iter()
        .filter_map(|field_key| {
            let provenance = FieldProvenance::from_value(bundle.provenance.get(field_key));
            let rule = FieldRule::from_value(bundle.field_rules.get(field_key));
            let reasoning = FieldReasoning::from_value(bundle.field_reasoning.get(field_key));

            score_field(&FieldSignals {
                field_key,
                provenance: &provenance,
                rule: &rule,
                reasoning: &reasoning,
                run_contradictions: &run_contradictions,
                identity: &identity,
            })
        })
        .collect::<Vec<NeedRow>>();

    sort_need_rows(&mut needs);

    let mut reason_counts = BTreeMap::<String, usize>::new();
    let mut required_level_counts = BTreeMap::<String, usize>::new();
    for row in &needs {
        for reason in &row.reasons {
            *reason_counts.entry(reason.as_str().to_string()).or_default() += 1;
        }
        *required_level_counts
            .entry(row.required_level.as_str().to_string())
            .or_default() += 1;
    }

    let mut snapshots = previous_snapshots;
    snapshots.push(NeedSetHistoryEntry {
        ts: generated_at.to_string(),
        needset_size: needs.len(),
    });
    let overflow = snapshots.len().saturating_sub(SNAPSHOT_HISTORY_LIMIT);
    snapshots.drain(..overflow);

    let identity_audit_rows = identity.audit_rows.clone();

    NeedSetSnapshot {
        run_id: bundle.run_id.clone(),
        category: bundle.category.clone(),
        product_id: bundle.product_id.clone(),
        generated_at: generated_at.to_string(),
        total_fields: field_keys.len(),
        needset_size: needs.len(),
        identity_lock_state: identity,
        identity_audit_rows,
        reason_counts,
        required_level_counts,
        needs,
        snapshots,
    }
}

pub fn sort_need_rows(rows: &mut [NeedRow]) {
    rows.sort_by(|a, b| {
        b.need_score
            .total_cmp(&a.need_score)
            .then_with(|| {
                b.required_level
                    .weight()
                    .cmp(&a.required_level.weight())
            })
            .then_with(|| a.field_key.cmp(&b.field_key))
    });
}

fn collect_field_keys(bundle: &NeedSetBundle) -> Vec<String> {
    let mut seen = HashSet::<String>::new();
    let mut keys = Vec::new();

    let declared = match &bundle.field_order {
        Value::Array(items) => items.iter().filter_map(|item| text(Some(item))).collect(),
        _ => Vec::new(),
    };
    let provenance_keys = object_keys(&bundle.provenance);
    let rule_keys = object_keys(&bundle.field_rules);

    for key in declared.into_iter().chain(provenance_keys).chain(rule_keys) {
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    }

    keys
}

fn object_keys(raw: &Value) -> Vec<String> {
    match raw {
        Value::Object(map) => map
            .keys()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

pub fn history_from_snapshot(previous: &Value) -> Vec<NeedSetHistoryEntry> {
    let Some(Value::Array(entries)) = previous.get("snapshots") else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            Some(NeedSetHistoryEntry {
                ts: text(entry.get("ts"))?,
                needset_size: count(entry.get("needset_size")).unwrap_or(0) as usize,
            })
        })
        .collect()
}

pub fn ranked_field_keys_from_snapshot(snapshot: &Value) -> Vec<String> {
    let Some(Value::Array(needs)) = snapshot.get("needs") else {
        return Vec::new();
    };

    needs
        .iter()
        .filter_map(|row| text(row.get("field_key")))
        .collect()
}

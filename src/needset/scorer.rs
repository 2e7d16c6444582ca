use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use crate::identity::IdentityContext;
use crate::util::{
    count, first_present, flag, is_unknown_token, number, round6, string_list, text, unit_number,
    value_to_display,
};

pub const DEFAULT_PASS_TARGET: f64 = 0.8;
const DEFAULT_MIN_EVIDENCE_REFS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredLevel {
    Identity,
    Critical,
    Required,
    Expected,
    Optional,
}

impl RequiredLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "identity" => Some(Self::Identity),
            "critical" => Some(Self::Critical),
            "required" => Some(Self::Required),
            "expected" => Some(Self::Expected),
            "optional" => Some(Self::Optional),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Critical => "critical",
            Self::Required => "required",
            Self::Expected => "expected",
            Self::Optional => "optional",
        }
    }

    pub fn weight(self) -> u32 {
        match self {
            Self::Identity => 5,
            Self::Critical => 4,
            Self::Required => 2,
            Self::Expected | Self::Optional => 1,
        }
    }

    pub fn blocks_on_gates(self) -> bool {
        matches!(self, Self::Identity | Self::Critical | Self::Required)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NeedReason {
    Missing,
    TierPrefUnmet,
    MinRefsFail,
    Conflict,
    LowConf,
    IdentityUnlocked,
    BlockedByIdentity,
    PublishGateBlock,
}

impl NeedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::TierPrefUnmet => "tier_pref_unmet",
            Self::MinRefsFail => "min_refs_fail",
            Self::Conflict => "conflict",
            Self::LowConf => "low_conf",
            Self::IdentityUnlocked => "identity_unlocked",
            Self::BlockedByIdentity => "blocked_by_identity",
            Self::PublishGateBlock => "publish_gate_block",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NeedStatus {
    Unknown,
    Conflict,
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidenceRef {
    pub url: String,
    pub host: String,
    pub tier: Option<u64>,
    pub key_path: String,
    pub snippet_id: String,
}

impl EvidenceRef {
    fn from_value(raw: &Value) -> Self {
        Self {
            url: text(raw.get("url")).unwrap_or_default(),
            host: text(raw.get("host")).unwrap_or_default(),
            tier: count(raw.get("tier")).filter(|tier| *tier > 0),
            key_path: text(first_present(raw, &["keyPath", "key_path"])).unwrap_or_default(),
            snippet_id: text(first_present(raw, &["snippet_id", "snippetId"])).unwrap_or_default(),
        }
    }

    fn dedupe_key(&self) -> String {
        format!("{}|{}|{}", self.url, self.key_path, self.snippet_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldProvenance {
    pub value: Option<Value>,
    pub confidence: Option<f64>,
    pub pass_target: Option<f64>,
    pub meets_pass_target: Option<bool>,
    pub evidence: Vec<EvidenceRef>,
}

impl FieldProvenance {
    pub fn from_value(raw: Option<&Value>) -> Self {
        let Some(raw) = raw.filter(|value| value.is_object()) else {
            return Self::default();
        };

        let evidence = match raw.get("evidence") {
            Some(Value::Array(rows)) => rows
                .iter()
                .filter(|row| row.is_object())
                .map(EvidenceRef::from_value)
                .collect(),
            _ => Vec::new(),
        };

        Self {
            value: raw.get("value").cloned(),
            confidence: unit_number(raw.get("confidence")),
            pass_target: unit_number(raw.get("pass_target")),
            meets_pass_target: flag(raw.get("meets_pass_target")),
            evidence,
        }
    }

    pub fn is_missing(&self) -> bool {
        is_unknown_token(self.value.as_ref())
    }

    pub fn best_tier(&self) -> Option<u64> {
        self.evidence.iter().filter_map(|row| row.tier).min()
    }

    pub fn distinct_ref_count(&self) -> usize {
        self.evidence
            .iter()
            .map(EvidenceRef::dedupe_key)
            .collect::<HashSet<String>>()
            .len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    pub required_level: RequiredLevel,
    pub min_evidence_refs: usize,
    pub prefers_tier_one: bool,
    pub identity_gated: bool,
    pub pass_target: Option<f64>,
}

impl Default for FieldRule {
    fn default() -> Self {
        Self {
            required_level: RequiredLevel::Optional,
            min_evidence_refs: DEFAULT_MIN_EVIDENCE_REFS,
            prefers_tier_one: false,
            identity_gated: true,
            pass_target: None,
        }
    }
}

impl FieldRule {
    pub fn from_value(raw: Option<&Value>) -> Self {
        let Some(raw) = raw.filter(|value| value.is_object()) else {
            return Self::default();
        };
        let evidence_block = raw.get("evidence").filter(|value| value.is_object());
        let lookup = |key: &str| {
            raw.get(key)
                .filter(|value| !value.is_null())
                .or_else(|| evidence_block.and_then(|block| block.get(key)))
        };

        let required_level = text(first_present(raw, &["required_level", "priority"]))
            .as_deref()
            .and_then(RequiredLevel::parse)
            .unwrap_or(RequiredLevel::Optional);

        let min_evidence_refs = count(lookup("min_evidence_refs"))
            .map(|value| value as usize)
            .unwrap_or(DEFAULT_MIN_EVIDENCE_REFS);

        let prefers_tier_one = match lookup("tier_preference") {
            Some(Value::Array(tiers)) => tiers
                .first()
                .and_then(|tier| number(Some(tier)))
                .map(|tier| tier == 1.0)
                .unwrap_or(false),
            Some(other) => number(Some(other)) == Some(1.0),
            None => false,
        };

        Self {
            required_level,
            min_evidence_refs,
            prefers_tier_one,
            identity_gated: flag(raw.get("identity_gated")).unwrap_or(true),
            pass_target: unit_number(raw.get("pass_target")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldReasoning {
    pub reasons: Vec<String>,
    pub contradiction_count: usize,
}

impl FieldReasoning {
    pub fn from_value(raw: Option<&Value>) -> Self {
        let Some(raw) = raw.filter(|value| value.is_object()) else {
            return Self::default();
        };

        let contradiction_count = match raw.get("contradictions") {
            Some(Value::Array(items)) => items.len(),
            _ => 0,
        };

        Self {
            reasons: string_list(raw.get("reasons")),
            contradiction_count,
        }
    }

    fn signals_conflict(&self) -> bool {
        self.contradiction_count > 0
            || self
                .reasons
                .iter()
                .any(|reason| reason.eq_ignore_ascii_case("constraint_conflict"))
    }
}

pub fn contradiction_field_keys(constraint_analysis: &Value) -> HashSet<String> {
    let mut fields = HashSet::new();
    let Some(Value::Array(entries)) = constraint_analysis.get("contradictions") else {
        return fields;
    };

    for entry in entries {
        if let Some(field) = entry.as_str() {
            fields.insert(field.trim().to_string());
            continue;
        }
        fields.extend(string_list(first_present(entry, &["fields", "field_keys"])));
        fields.extend(text(first_present(entry, &["field_key", "field"])));
    }

    fields
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NeedRow {
    pub field_key: String,
    pub required_level: RequiredLevel,
    pub status: NeedStatus,
    pub value: Option<String>,
    pub confidence: Option<f64>,
    pub effective_confidence: Option<f64>,
    pub pass_target: f64,
    pub meets_pass_target: Option<bool>,
    pub best_tier_seen: Option<u64>,
    pub refs_found: usize,
    pub min_refs: usize,
    pub blocked_by: Vec<String>,
    pub reasons: Vec<NeedReason>,
    pub need_score: f64,
}

pub struct FieldSignals<'a> {
    pub field_key: &'a str,
    pub provenance: &'a FieldProvenance,
    pub rule: &'a FieldRule,
    pub reasoning: &'a FieldReasoning,
    pub run_contradictions: &'a HashSet<String>,
    pub identity: &'a IdentityContext,
}

pub fn effective_confidence(
    confidence: Option<f64>,
    rule: &FieldRule,
    identity: &IdentityContext,
) -> Option<f64> {
    let confidence = confidence?;
    if rule.identity_gated && !identity.extraction_gate_open {
        Some(confidence.min(identity.status.confidence_cap()))
    } else {
        Some(confidence)
    }
}

pub fn score_field(signals: &FieldSignals<'_>) -> Option<NeedRow> {
    let FieldSignals {
        field_key,
        provenance,
        rule,
        reasoning,
        run_contradictions,
        identity,
    } = *signals;

    let level = rule.required_level;
    let gate_closed = !identity.extraction_gate_open;

    let missing = provenance.is_missing();
    let conflict = reasoning.signals_conflict() || run_contradictions.contains(field_key);
    let best_tier = provenance.best_tier();
    let tier_deficit = rule.prefers_tier_one && best_tier.is_none_or(|tier| tier > 1);
    let refs_found = provenance.distinct_ref_count();
    let min_refs_deficit = refs_found < rule.min_evidence_refs;
    let blocked_by_identity = level.blocks_on_gates() && gate_closed;
    let publish_gate_blocked = level.blocks_on_gates() && !identity.publishable;

    let effective = effective_confidence(provenance.confidence, rule, identity);
    let pass_target = provenance
        .pass_target
        .or(rule.pass_target)
        .unwrap_or(DEFAULT_PASS_TARGET);
    let low_conf = match effective {
        Some(value) => value < pass_target,
        None => missing,
    };

    let mut reasons = Vec::new();
    if missing {
        reasons.push(NeedReason::Missing);
    }
    if tier_deficit {
        reasons.push(NeedReason::TierPrefUnmet);
    }
    if min_refs_deficit {
        reasons.push(NeedReason::MinRefsFail);
    }
    if conflict {
        reasons.push(NeedReason::Conflict);
    }
    if low_conf {
        reasons.push(NeedReason::LowConf);
    }
    if missing && gate_closed {
        reasons.push(NeedReason::IdentityUnlocked);
    }
    if blocked_by_identity {
        reasons.push(NeedReason::BlockedByIdentity);
    }
    if publish_gate_blocked {
        reasons.push(NeedReason::PublishGateBlock);
    }

    if reasons.is_empty() {
        return None;
    }

    let mut blocked_by = Vec::new();
    if blocked_by_identity {
        blocked_by.push("identity_gate".to_string());
    }
    if publish_gate_blocked {
        blocked_by.push("publish_gate".to_string());
    }

    let status = if conflict {
        NeedStatus::Conflict
    } else if missing {
        NeedStatus::Unknown
    } else {
        NeedStatus::Accepted
    };

    let factor = |condition: bool, weight: f64| if condition { weight } else { 1.0 };
    let need_score = factor(missing, 2.0)
        * effective.map(|value| 1.0 - value).unwrap_or(1.0)
        * f64::from(level.weight())
        * factor(tier_deficit, 2.0)
        * factor(min_refs_deficit, 1.5)
        * factor(conflict, 1.5)
        * factor(blocked_by_identity, 1.35)
        * factor(publish_gate_blocked, 1.2);

    Some(NeedRow {
        field_key: field_key.to_string(),
        required_level: level,
        status,
        value: (!missing).then(|| value_to_display(provenance.value.as_ref())),
        confidence: provenance.confidence,
        effective_confidence: effective,
        pass_target,
        meets_pass_target: provenance.meets_pass_target,
        best_tier_seen: best_tier,
        refs_found,
        min_refs: rule.min_evidence_refs,
        blocked_by,
        reasons,
        need_score: round6(need_score),
    })
}

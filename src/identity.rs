use serde::Serialize;
use serde_json::Value;

use crate::util::{count, first_present, flag, normalize_timestamp, string_list, text, unit_number};

const AUDIT_ROW_LIMIT: usize = 24;
const LOCKED_CONFIDENCE: f64 = 0.99;
const PROVISIONAL_CONFIDENCE: f64 = 0.9;
const CONFLICT_MARKERS: [&str; 3] = ["conflict", "mismatch", "major_anchor"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Locked,
    Provisional,
    Unlocked,
    Conflict,
}

impl IdentityStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "locked" => Some(Self::Locked),
            "provisional" => Some(Self::Provisional),
            "unlocked" => Some(Self::Unlocked),
            "conflict" => Some(Self::Conflict),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::Provisional => "provisional",
            Self::Unlocked => "unlocked",
            Self::Conflict => "conflict",
        }
    }

    // Highest confidence a gated field may report while the extraction gate is closed.
    pub fn confidence_cap(self) -> f64 {
        match self {
            Self::Locked => 1.0,
            Self::Provisional => 0.74,
            Self::Conflict => 0.39,
            Self::Unlocked => 0.59,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityLevel {
    Easy,
    Medium,
    Hard,
    VeryHard,
    ExtraHard,
    Unknown,
}

impl AmbiguityLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "easy" => Some(Self::Easy),
            "medium" => Some(Self::Medium),
            "hard" => Some(Self::Hard),
            "very_hard" => Some(Self::VeryHard),
            "extra_hard" => Some(Self::ExtraHard),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn from_family_model_count(family_model_count: u64) -> Self {
        match family_model_count {
            0 => Self::Unknown,
            1 => Self::Easy,
            2..=3 => Self::Medium,
            4..=5 => Self::Hard,
            6..=8 => Self::VeryHard,
            _ => Self::ExtraHard,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityAuditRow {
    pub ts: String,
    pub event: String,
    pub status: Option<String>,
    pub confidence: Option<f64>,
    pub reason_codes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityContext {
    pub status: IdentityStatus,
    pub confidence: f64,
    pub identity_gate_validated: bool,
    pub extraction_gate_open: bool,
    pub family_model_count: u64,
    pub ambiguity_level: AmbiguityLevel,
    pub publishable: bool,
    pub publish_blockers: Vec<String>,
    pub reason_codes: Vec<String>,
    #[serde(skip)]
    pub audit_rows: Vec<IdentityAuditRow>,
}

impl Default for IdentityContext {
    fn default() -> Self {
        normalize_identity_context(&Value::Null, "")
    }
}

pub fn normalize_identity_context(raw: &Value, now: &str) -> IdentityContext {
    let confidence = unit_number(raw.get("confidence")).unwrap_or(0.0);
    let identity_gate_validated = flag(raw.get("identity_gate_validated")).unwrap_or(false);
    let reason_codes = string_list(raw.get("reason_codes"));

    let status = text(raw.get("status"))
        .as_deref()
        .and_then(IdentityStatus::parse)
        .unwrap_or_else(|| {
            derive_status(confidence, identity_gate_validated, &reason_codes)
        });

    let family_model_count = count(raw.get("family_model_count")).unwrap_or(0);
    let ambiguity_level = text(raw.get("ambiguity_level"))
        .as_deref()
        .and_then(AmbiguityLevel::parse)
        .unwrap_or_else(|| AmbiguityLevel::from_family_model_count(family_model_count));

    let extraction_gate_open = flag(raw.get("extraction_gate_open")).unwrap_or(false)
        || status == IdentityStatus::Locked;

    let publish_blockers = string_list(raw.get("publish_blockers"));
    let publishable = flag(raw.get("publishable"))
        .unwrap_or(status == IdentityStatus::Locked && publish_blockers.is_empty());

    IdentityContext {
        status,
        confidence,
        identity_gate_validated,
        extraction_gate_open,
        family_model_count,
        ambiguity_level,
        publishable,
        publish_blockers,
        reason_codes,
        audit_rows: normalize_audit_rows(raw.get("audit_rows"), now),
    }
}

fn derive_status(
    confidence: f64,
    identity_gate_validated: bool,
    reason_codes: &[String],
) -> IdentityStatus {
    if identity_gate_validated && confidence >= LOCKED_CONFIDENCE {
        return IdentityStatus::Locked;
    }

    let has_conflict_code = reason_codes.iter().any(|code| {
        let lowered = code.to_ascii_lowercase();
        CONFLICT_MARKERS.iter().any(|marker| lowered.contains(marker))
    });
    if has_conflict_code {
        return IdentityStatus::Conflict;
    }

    if confidence >= PROVISIONAL_CONFIDENCE {
        IdentityStatus::Provisional
    } else {
        IdentityStatus::Unlocked
    }
}

fn normalize_audit_rows(raw: Option<&Value>, now: &str) -> Vec<IdentityAuditRow> {
    let Some(Value::Array(rows)) = raw else {
        return Vec::new();
    };

    let skip = rows.len().saturating_sub(AUDIT_ROW_LIMIT);
    rows.iter()
        .skip(skip)
        .map(|row| IdentityAuditRow {
            ts: normalize_timestamp(first_present(row, &["ts", "timestamp", "at"]), now),
            event: text(first_present(row, &["event", "action"]))
                .unwrap_or_else(|| "identity_update".to_string()),
            status: text(row.get("status")),
            confidence: unit_number(row.get("confidence")),
            reason_codes: string_list(row.get("reason_codes")),
        })
        .collect()
}

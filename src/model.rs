use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NeedSetBundle {
    pub run_id: String,
    pub category: String,
    pub product_id: String,
    pub field_order: Value,
    pub provenance: Value,
    pub field_rules: Value,
    pub field_reasoning: Value,
    pub constraint_analysis: Value,
    pub identity: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PackBundle {
    pub run_id: String,
    pub category: String,
    pub product_id: String,
    pub item_identity: Value,
    pub field_values: Value,
    pub run_summary: Value,
    pub sources: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackPaths {
    pub out_dir: String,
    pub source_packets_path: String,
    pub item_packet_path: String,
    pub run_meta_packet_path: String,
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackCounts {
    pub sources_total: usize,
    pub source_packets_built: usize,
    pub sources_without_candidates: usize,
    pub item_fields: usize,
    pub assertions_total: usize,
    pub evidence_total: usize,
    pub validation_errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub category: String,
    pub product_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub paths: PackPaths,
    pub counts: PackCounts,
    pub quality_gates_passed: bool,
    pub warnings: Vec<String>,
}

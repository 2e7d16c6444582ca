use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, JSONSchema};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::util::read_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketType {
    SourceIndexingExtractionPacket,
    ItemIndexingExtractionPacket,
    RunMetaPacket,
}

impl PacketType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceIndexingExtractionPacket => "source_indexing_extraction_packet",
            Self::ItemIndexingExtractionPacket => "item_indexing_extraction_packet",
            Self::RunMetaPacket => "run_meta_packet",
        }
    }

    pub fn schema_path(self, schema_root: &Path) -> PathBuf {
        schema_root.join(format!("{}.schema.json", self.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    pub packet_type: PacketType,
    pub packet_index: Option<usize>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

pub trait PacketValidator: Send + Sync {
    fn validate(&self, document: &Value) -> Vec<String>;
}

pub struct JsonSchemaValidator {
    compiled: JSONSchema,
}

impl JsonSchemaValidator {
    pub fn compile(schema: &Value) -> Result<Self> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|err| anyhow!("failed to compile schema: {err}"))?;
        Ok(Self { compiled })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let schema: Value = read_json(path)?;
        Self::compile(&schema).with_context(|| format!("invalid schema {}", path.display()))
    }
}

impl PacketValidator for JsonSchemaValidator {
    fn validate(&self, document: &Value) -> Vec<String> {
        match self.compiled.validate(document) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|err| format!("{err} at {}", err.instance_path))
                .collect(),
        }
    }
}

#[derive(Default)]
pub struct ValidatorCache {
    validators: HashMap<PathBuf, Box<dyn PacketValidator>>,
}

impl ValidatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn get_or_compile(&mut self, schema_path: &Path) -> Result<&dyn PacketValidator> {
        let key = normalize_schema_path(schema_path);
        if !self.validators.contains_key(&key) {
            debug!(schema = %key.display(), "compiling packet schema");
            let validator = JsonSchemaValidator::from_path(&key)?;
            self.validators.insert(key.clone(), Box::new(validator));
        }

        match self.validators.get(&key) {
            Some(validator) => Ok(validator.as_ref()),
            None => bail!("validator cache lost entry for {}", key.display()),
        }
    }
}

fn normalize_schema_path(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

pub struct PacketSet<'a> {
    pub source_packets: &'a [Value],
    pub item_packet: &'a Value,
    pub run_meta_packet: &'a Value,
}

pub fn validate_packets(
    cache: &mut ValidatorCache,
    schema_root: &Path,
    packets: &PacketSet<'_>,
) -> Result<ValidationReport> {
    let mut errors = Vec::new();

    let validator = cache.get_or_compile(&PacketType::SourceIndexingExtractionPacket.schema_path(schema_root))?;
    for (index, packet) in packets.source_packets.iter().enumerate() {
        errors.extend(validator.validate(packet).into_iter().map(|message| ValidationError {
            packet_type: PacketType::SourceIndexingExtractionPacket,
            packet_index: Some(index),
            message,
        }));
    }

    for (packet_type, packet) in [
        (PacketType::ItemIndexingExtractionPacket, packets.item_packet),
        (PacketType::RunMetaPacket, packets.run_meta_packet),
    ] {
        let validator = cache.get_or_compile(&packet_type.schema_path(schema_root))?;
        errors.extend(validator.validate(packet).into_iter().map(|message| ValidationError {
            packet_type,
            packet_index: None,
            message,
        }));
    }

    Ok(ValidationReport::from_errors(errors))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::util::write_json_pretty;

    fn write_schemas(root: &Path) {
        write_json_pretty(
            &PacketType::SourceIndexingExtractionPacket.schema_path(root),
            &json!({
                "type": "object",
                "required": ["schema_version", "source_packet_id", "field_key_map"],
                "properties": {
                    "schema_version": { "const": "2026-02-20.source-indexing-extraction-packet.v1" },
                    "field_key_map": { "type": "object" }
                }
            }),
        )
        .unwrap();
        write_json_pretty(
            &PacketType::ItemIndexingExtractionPacket.schema_path(root),
            &json!({ "required": ["item_packet_id"] }),
        )
        .unwrap();
        write_json_pretty(
            &PacketType::RunMetaPacket.schema_path(root),
            &json!({ "required": ["run_meta_packet_id"], "properties": { "phase_summary": { "type": "object" } } }),
        )
        .unwrap();
    }

    #[test]
    fn report_lists_errors_with_packet_positions() {
        let dir = tempfile::tempdir().unwrap();
        write_schemas(dir.path());

        let sources = vec![
            json!({
                "schema_version": "2026-02-20.source-indexing-extraction-packet.v1",
                "source_packet_id": "sp_1",
                "field_key_map": {}
            }),
            json!({
                "schema_version": "v0",
                "field_key_map": []
            }),
        ];
        let item = json!({ "item_packet_id": "ip_1" });
        let run_meta = json!({ "phase_summary": [] });

        let mut cache = ValidatorCache::new();
        let report = validate_packets(
            &mut cache,
            dir.path(),
            &PacketSet {
                source_packets: &sources,
                item_packet: &item,
                run_meta_packet: &run_meta,
            },
        )
        .unwrap();

        assert!(!report.valid);
        let source_errors = report
            .errors
            .iter()
            .filter(|error| error.packet_type == PacketType::SourceIndexingExtractionPacket)
            .collect::<Vec<_>>();
        assert_eq!(source_errors.len(), 3);
        assert!(source_errors.iter().all(|error| error.packet_index == Some(1)));

        let run_meta_errors = report
            .errors
            .iter()
            .filter(|error| error.packet_type == PacketType::RunMetaPacket)
            .collect::<Vec<_>>();
        assert_eq!(run_meta_errors.len(), 2);
        assert!(run_meta_errors.iter().all(|error| error.packet_index.is_none()));

        let serialized = serde_json::to_value(&report).unwrap();
        assert_eq!(serialized["errors"][0]["packet_type"], "source_indexing_extraction_packet");
    }

    #[test]
    fn nested_violations_are_reported_with_their_location() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = dir.path().join("strict.schema.json");
        write_json_pretty(
            &schema_path,
            &json!({
                "type": "object",
                "properties": {
                    "field_key_map": {
                        "type": "object",
                        "additionalProperties": {
                            "type": "object",
                            "required": ["contexts"],
                            "properties": { "contexts": { "type": "object" } }
                        }
                    }
                },
                "additionalProperties": false
            }),
        )
        .unwrap();

        let mut cache = ValidatorCache::new();
        let validator = cache.get_or_compile(&schema_path).unwrap();

        assert!(validator.validate(&json!({ "field_key_map": { "dpi": { "contexts": {} } } })).is_empty());

        let messages = validator.validate(&json!({
            "field_key_map": { "dpi": { "contexts": [] } },
            "unexpected": true
        }));
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().any(|message| message.ends_with("at /field_key_map/dpi/contexts")));
    }

    #[test]
    fn malformed_schema_fails_to_compile() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = dir.path().join("broken.schema.json");
        write_json_pretty(&schema_path, &json!({ "type": "not-a-type" })).unwrap();

        let mut cache = ValidatorCache::new();
        assert!(cache.get_or_compile(&schema_path).is_err());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn cache_compiles_each_schema_once() {
        let dir = tempfile::tempdir().unwrap();
        write_schemas(dir.path());

        let mut cache = ValidatorCache::new();
        let direct = PacketType::ItemIndexingExtractionPacket.schema_path(dir.path());
        let dotted = dir
            .path()
            .join(".")
            .join("item_indexing_extraction_packet.schema.json");

        assert!(cache.get_or_compile(&direct).unwrap().validate(&json!({})).len() == 1);
        assert!(cache.get_or_compile(&dotted).unwrap().validate(&json!({ "item_packet_id": "ip" })).is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn missing_schema_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ValidatorCache::new();
        let result = cache.get_or_compile(&PacketType::RunMetaPacket.schema_path(dir.path()));
        assert!(result.is_err());
        assert_eq!(cache.len(), 0);
    }
}

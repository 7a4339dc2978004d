use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::color::ColorSubstitutionRule;
use crate::geometry::{Rectangle, RegionOutcome};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRequestRecord {
    pub operation: String,
    pub region: Option<Rectangle>,
    pub color_rule: Option<ColorSubstitutionRule>,
    pub prompt: Option<String>,
    pub detector: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl EditRequestRecord {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            region: None,
            color_rule: None,
            prompt: None,
            detector: None,
            model: None,
            metadata: Map::new(),
        }
    }
}

/// What the pipeline actually did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditResultRecord {
    pub invocation_id: String,
    pub passthrough: bool,
    pub region: Option<RegionOutcome>,
    pub frame_count: usize,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub delays_cs: Vec<u16>,
    pub loop_count: String,
    pub input_sha256: String,
    pub output_sha256: String,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub stages: Vec<String>,
}

pub fn build_receipt(
    request: &EditRequestRecord,
    result: &EditResultRecord,
    input_path: Option<&Path>,
    output_path: Option<&Path>,
    warnings: &[String],
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "request".to_string(),
        sanitize_payload(&serde_json::to_value(request).unwrap_or(Value::Null)),
    );
    root.insert(
        "result".to_string(),
        serde_json::to_value(result).unwrap_or(Value::Null),
    );
    root.insert(
        "warnings".to_string(),
        Value::Array(warnings.iter().cloned().map(Value::String).collect()),
    );

    let mut artifacts = Map::new();
    artifacts.insert("input_path".to_string(), path_value(input_path));
    artifacts.insert("output_path".to_string(), path_value(output_path));
    root.insert("artifacts".to_string(), Value::Object(artifacts));
    root.insert("ts".to_string(), Value::String(now_utc_iso()));
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

fn path_value(path: Option<&Path>) -> Value {
    path.map(|value| Value::String(value.to_string_lossy().to_string()))
        .unwrap_or(Value::Null)
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) => value.clone(),
        Value::String(text) if text.starts_with("data:") => {
            Value::String("<omitted>".to_string())
        }
        Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "data_uri" | "image" | "image_bytes" | "data" | "inline_data"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

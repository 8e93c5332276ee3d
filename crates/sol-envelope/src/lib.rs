// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parses raw model output into a typed [`sol_core::OutputEnvelope`] and
//! enforces the egress/ingress shape contract (§4.1).
#![deny(unsafe_code)]

use schemars::schema_for;
use serde_json::{Map, Value};
use sol_core::{EnvelopeMeta, OutputEnvelope};
use thiserror::Error;

/// Hard cap on a raw model response, in UTF-8 bytes.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// One issue found while validating an envelope, capped to the first 3.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Issue {
    pub path: String,
    pub code: String,
    pub message: String,
}

/// Why an envelope failed to validate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("payload exceeds {MAX_PAYLOAD_BYTES} bytes")]
    PayloadTooLarge,
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("schema invalid ({} issues)", .0.len())]
    SchemaInvalid(Vec<Issue>),
}

impl EnvelopeError {
    /// Stable code for persistence/HTTP surfacing (§7): `output_contract_failed:<reason>`.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::PayloadTooLarge => "payload_too_large",
            Self::InvalidJson(_) => "invalid_json",
            Self::SchemaInvalid(_) => "schema_invalid",
        }
    }
}

const GHOST_TYPE_ALIASES: &[(&str, &str)] = &[
    ("memory", "memory_artifact"),
    ("journal", "journal_moment"),
    ("action", "action_proposal"),
];

/// Normalize known meta aliases in place: `ghost_type`→`ghost_kind` (mapped
/// through [`GHOST_TYPE_ALIASES`]), `metaVersion`→`meta_version`, and
/// default `meta_version` to `"v1"` whenever `meta` is present.
pub fn normalize_meta_aliases(meta: &mut Map<String, Value>) {
    if let Some(Value::String(raw)) = meta.remove("ghost_type") {
        let mapped = GHOST_TYPE_ALIASES
            .iter()
            .find(|(from, _)| *from == raw)
            .map(|(_, to)| to.to_string())
            .unwrap_or(raw);
        meta.entry("ghost_kind".to_string())
            .or_insert(Value::String(mapped));
    }
    if let Some(v) = meta.remove("metaVersion") {
        meta.entry("meta_version".to_string()).or_insert(v);
    }
    meta.entry("meta_version".to_string())
        .or_insert_with(|| Value::String("v1".to_string()));
}

/// Parse and validate a raw model response, producing a typed
/// [`OutputEnvelope`] or a typed [`EnvelopeError`].
///
/// `attempt_index` is accepted for symmetry with the orchestrator's retry
/// bookkeeping (§4.9) but does not change validation behavior: a
/// `payload_too_large` failure is never retried regardless of attempt.
pub fn parse(raw: &str, _attempt_index: u8) -> Result<OutputEnvelope, EnvelopeError> {
    if raw.len() > MAX_PAYLOAD_BYTES {
        return Err(EnvelopeError::PayloadTooLarge);
    }

    let mut value: Value =
        serde_json::from_str(raw).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;

    let Some(obj) = value.as_object_mut() else {
        return Err(EnvelopeError::SchemaInvalid(vec![Issue {
            path: "$".into(),
            code: "not_an_object".into(),
            message: "top-level response must be a JSON object".into(),
        }]));
    };

    if let Some(Value::Object(meta)) = obj.get_mut("meta") {
        normalize_meta_aliases(meta);
    }

    validate_v0_minimum(obj)?;

    let has_ghost_keys = matches!(obj.get("meta"), Some(Value::Object(m)) if m.contains_key("ghost_kind") || m.contains_key("ghost_payload"));

    let envelope: OutputEnvelope = serde_json::from_value(value.clone())
        .map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;

    if has_ghost_keys {
        if let Err(issues) = validate_full_schema(&value) {
            return Err(EnvelopeError::SchemaInvalid(issues));
        }
    }

    Ok(envelope)
}

fn validate_v0_minimum(obj: &Map<String, Value>) -> Result<(), EnvelopeError> {
    let mut issues = Vec::new();

    for key in obj.keys() {
        if key != "assistant_text" && key != "meta" {
            issues.push(Issue {
                path: format!("$.{key}"),
                code: "unknown_top_level_field".into(),
                message: format!("'{key}' is not a recognized top-level field"),
            });
        }
    }

    match obj.get("assistant_text") {
        Some(Value::String(s)) if !s.is_empty() => {}
        Some(Value::String(_)) => issues.push(Issue {
            path: "$.assistant_text".into(),
            code: "empty".into(),
            message: "assistant_text must be non-empty".into(),
        }),
        Some(_) => issues.push(Issue {
            path: "$.assistant_text".into(),
            code: "wrong_type".into(),
            message: "assistant_text must be a string".into(),
        }),
        None => issues.push(Issue {
            path: "$.assistant_text".into(),
            code: "missing".into(),
            message: "assistant_text is required".into(),
        }),
    }

    if let Some(Value::Object(meta)) = obj.get("meta") {
        for key in meta.keys() {
            if !EnvelopeMeta::ALLOWED_KEYS.contains(&key.as_str()) {
                issues.push(Issue {
                    path: format!("$.meta.{key}"),
                    code: "unknown_meta_key".into(),
                    message: format!("'{key}' is not an allowlisted meta key"),
                });
            }
        }
    }

    issues.truncate(3);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(EnvelopeError::SchemaInvalid(issues))
    }
}

fn validate_full_schema(value: &Value) -> Result<(), Vec<Issue>> {
    let schema = schema_for!(OutputEnvelope);
    let schema_value = serde_json::to_value(&schema).expect("schema always serializes");
    let validator = jsonschema::validator_for(&schema_value).expect("derived schema compiles");

    let issues: Vec<Issue> = validator
        .iter_errors(value)
        .take(3)
        .map(|e| Issue {
            path: e.instance_path.to_string(),
            code: "ghost_card_shape_invalid".into(),
            message: e.to_string(),
        })
        .collect();

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

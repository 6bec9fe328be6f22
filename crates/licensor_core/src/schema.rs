//! Template checks applied to feature payloads at issuance.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::LicenseError;

/// A license template: a JSON Schema every feature payload issued under it must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub payload_schema: Value,
}

impl Template {
    pub fn new(id: impl Into<String>, name: impl Into<String>, payload_schema: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            payload_schema,
        }
    }

    /// Parse a template file: either a full template object or a bare schema.
    pub fn from_json(id: &str, raw: &str) -> Result<Self, LicenseError> {
        let value: Value = serde_json::from_str(raw)?;
        if value.get("payload_schema").is_some() {
            return Ok(serde_json::from_value(value)?);
        }
        Ok(Self::new(id, id, value))
    }
}

/// Check that `features` is an object and, when a template is given, that it
/// satisfies the template's schema. All violations are reported together.
pub fn validate_features(
    template: Option<&Template>,
    features: &Value,
) -> Result<Map<String, Value>, LicenseError> {
    let object = features.as_object().ok_or_else(|| {
        LicenseError::SchemaValidation("feature payload must be a JSON object".to_string())
    })?;

    if let Some(template) = template {
        let validator = jsonschema::validator_for(&template.payload_schema).map_err(|e| {
            LicenseError::SchemaValidation(format!(
                "template {} has an invalid schema: {}",
                template.id, e
            ))
        })?;
        let violations: Vec<String> = validator
            .iter_errors(features)
            .map(|e| {
                let path = e.instance_path().to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();
        if !violations.is_empty() {
            return Err(LicenseError::SchemaValidation(violations.join("; ")));
        }
    }

    Ok(object.clone())
}

//! Blueprints: one template plus an ordered list of mutations.
//!
//! A blueprint document is checked by a [`StructuralValidator`] before it
//! is deserialized, so a caller gets field-scoped errors for every problem
//! at once rather than the first serde failure.

use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, FieldError, Result};
use crate::mutate::{ComponentChange, SlotChange, ThemeChange};

/// Checks the shape of a JSON document.
pub trait StructuralValidator: Send + Sync {
    /// Every problem found, or `Ok` when the document is well-formed.
    fn validate(&self, document: &Value) -> std::result::Result<(), Vec<FieldError>>;
}

/// JSON Schema (Draft 7) validator.
pub struct JsonSchemaValidator {
    compiled: JSONSchema,
}

impl std::fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSchemaValidator").finish_non_exhaustive()
    }
}

impl JsonSchemaValidator {
    /// Validator for blueprint documents, using the embedded schema.
    pub fn blueprint() -> Result<Self> {
        let schema: Value = serde_json::from_str(include_str!("schemas/blueprint.schema.json"))
            .map_err(|e| EngineError::Config(format!("failed to parse blueprint schema: {e}")))?;
        Self::from_schema(&schema)
    }

    pub fn from_schema(schema: &Value) -> Result<Self> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| EngineError::Config(format!("failed to compile schema: {e}")))?;
        Ok(Self { compiled })
    }
}

impl StructuralValidator for JsonSchemaValidator {
    fn validate(&self, document: &Value) -> std::result::Result<(), Vec<FieldError>> {
        self.compiled.validate(document).map_err(|errors| {
            errors
                .map(|e| FieldError {
                    path: e.instance_path.to_string(),
                    message: e.to_string(),
                })
                .collect()
        })
    }
}

/// One mutation in a blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    FillSlot(SlotChange),
    RewriteTheme(ThemeChange),
    InsertComponent(ComponentChange),
}

impl Step {
    pub fn op(&self) -> &'static str {
        match self {
            Step::FillSlot(_) => "fill_slot",
            Step::RewriteTheme(_) => "rewrite_theme",
            Step::InsertComponent(_) => "insert_component",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub template: String,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Blueprint {
    /// Validate `document` with `validator` (when given), then deserialize.
    pub fn from_document(document: &Value, validator: Option<&dyn StructuralValidator>) -> Result<Self> {
        if let Some(validator) = validator {
            validator
                .validate(document)
                .map_err(|errors| EngineError::ValidationFailed { errors })?;
        }
        serde_json::from_value(document.clone()).map_err(|e| EngineError::ValidationFailed {
            errors: vec![FieldError {
                path: String::new(),
                message: e.to_string(),
            }],
        })
    }
}

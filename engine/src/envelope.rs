//! The response envelope every public operation returns.
//!
//! Success and failure serialize to disjoint shapes so callers can branch on
//! the presence of `error`:
//!
//! ```json
//! { "ok": true, "changed": true, "changed_files": ["app/page.tsx"], "warnings": [], "elapsed_ms": 3 }
//! { "error": { "code": "SLOT_NOT_FOUND", "message": "…", "details": { … } } }
//! ```

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{EngineError, ErrorClass, ErrorCode};
use crate::mutate::{MutationResult, Warning};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Success {
    pub ok: bool,
    pub changed: bool,
    pub changed_files: Vec<String>,
    pub warnings: Vec<String>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub simulated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Success(Success),
    Failure { error: ErrorBody },
}

impl Envelope {
    pub fn success(changed: bool, changed_files: Vec<String>, elapsed: Duration) -> Self {
        Envelope::Success(Success {
            ok: true,
            changed,
            changed_files,
            warnings: Vec::new(),
            elapsed_ms: elapsed.as_millis() as u64,
            simulated: false,
            data: None,
        })
    }

    /// A read-only result: nothing changed, `data` carries the payload.
    pub fn read_only(data: Value, elapsed: Duration) -> Self {
        Self::success(false, Vec::new(), elapsed).with_data(data)
    }

    pub fn from_mutation(result: MutationResult) -> Self {
        let mut envelope = Self::success(result.changed, result.files_written, result.elapsed)
            .with_warnings(result.warnings.iter().map(Warning::to_string));
        if let Envelope::Success(success) = &mut envelope {
            success.simulated = result.simulated;
        }
        envelope
    }

    /// Convert `err` and log it at the level its class calls for.
    pub fn failure(operation: &str, err: &EngineError) -> Self {
        let code = err.code().as_str();
        match err.class() {
            ErrorClass::Contention => {
                tracing::debug!(operation, code, retry_after = ?err.retry_after(), "{err}");
            }
            ErrorClass::InputRejection => tracing::info!(operation, code, "{err}"),
            ErrorClass::Integrity => tracing::error!(operation, code, "{err}"),
            ErrorClass::WriteFailure | ErrorClass::Infrastructure => {
                tracing::warn!(operation, code, "{err}");
            }
        }
        Envelope::Failure {
            error: ErrorBody {
                code: err.code(),
                message: err.to_string(),
                details: err.details(),
            },
        }
    }

    /// `Ok` through `on_ok`, `Err` through [`Envelope::failure`].
    pub fn from_result<T>(
        operation: &str,
        result: crate::error::Result<T>,
        on_ok: impl FnOnce(T) -> Envelope,
    ) -> Self {
        match result {
            Ok(value) => on_ok(value),
            Err(err) => Self::failure(operation, &err),
        }
    }

    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = String>) -> Self {
        if let Envelope::Success(success) = &mut self {
            success.warnings.extend(warnings);
        }
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        if let Envelope::Success(success) = &mut self {
            success.data = Some(data);
        }
        self
    }

    /// Add `key` to a failure's `details` object.
    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        if let Envelope::Failure { error } = &mut self {
            if !error.details.is_object() {
                error.details = Value::Object(Map::new());
            }
            if let Some(details) = error.details.as_object_mut() {
                details.insert(key.to_string(), value);
            }
        }
        self
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Envelope::Success(_))
    }

    pub fn changed(&self) -> bool {
        matches!(self, Envelope::Success(Success { changed: true, .. }))
    }

    pub fn changed_files(&self) -> &[String] {
        match self {
            Envelope::Success(success) => &success.changed_files,
            Envelope::Failure { .. } => &[],
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Envelope::Success(_) => None,
            Envelope::Failure { error } => Some(error.code),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "error": { "code": "CONFIG_ERROR", "message": e.to_string(), "details": {} } })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mutate::WarningCode;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn success_shape() {
        let envelope = Envelope::from_mutation(MutationResult {
            changed: true,
            files_written: vec!["app/page.tsx".into()],
            warnings: vec![Warning::new(WarningCode::DuplicateMatch, "2 files matched")],
            elapsed: Duration::from_millis(7),
            simulated: false,
        });
        assert_eq!(
            envelope.to_json(),
            json!({
                "ok": true,
                "changed": true,
                "changed_files": ["app/page.tsx"],
                "warnings": ["DUPLICATE_MATCH: 2 files matched"],
                "elapsed_ms": 7,
            })
        );
    }

    #[test]
    fn failure_shape_has_no_success_fields() {
        let err = EngineError::SlotNotFound {
            file: "app/page.tsx".into(),
            slot: "pricing".into(),
            available: vec!["hero".into()],
        };
        let value = Envelope::failure("fill_slot", &err)
            .with_detail("step", json!(2))
            .to_json();

        assert_eq!(value["error"]["code"], "SLOT_NOT_FOUND");
        assert_eq!(value["error"]["details"]["available_slots"], json!(["hero"]));
        assert_eq!(value["error"]["details"]["step"], 2);
        assert!(value.get("ok").is_none());
        assert!(value.get("changed").is_none());
    }

    #[test]
    fn simulated_and_data_appear_only_when_set() {
        let value = Envelope::read_only(json!({ "entries": 0 }), Duration::ZERO).to_json();
        assert_eq!(value["data"]["entries"], 0);
        assert!(value.get("simulated").is_none());
        assert_eq!(value["changed_files"], json!([]));
    }
}

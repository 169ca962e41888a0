//! Error taxonomy for materialization and mutation.
//!
//! Every failure carries a machine-stable [`ErrorCode`], a human message
//! (the `Display` impl) and structured `details` that give a caller enough
//! context to self-correct: the offending archive entry, the rule it broke,
//! or the identifiers that *are* available.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Engine result type alias
pub type Result<T> = std::result::Result<T, EngineError>;

/// Machine-stable error codes surfaced in the response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PathTraversalBlocked,
    AbsolutePathBlocked,
    UnsafeEntryType,
    EntryTooLarge,
    ArchiveTooLarge,
    TooManyEntries,
    InvalidArchive,
    ConflictExists,
    InvalidDestination,
    SlotNotFound,
    SlotMarkerInvalid,
    AnchorNotFound,
    TargetNotFound,
    StyleFileNotFound,
    InvalidChange,
    IntegrityMismatch,
    OriginUnavailable,
    TemplateNotFound,
    ValidationFailed,
    WriteFailed,
    IoError,
    ConfigError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::PathTraversalBlocked => "PATH_TRAVERSAL_BLOCKED",
            ErrorCode::AbsolutePathBlocked => "ABSOLUTE_PATH_BLOCKED",
            ErrorCode::UnsafeEntryType => "UNSAFE_ENTRY_TYPE",
            ErrorCode::EntryTooLarge => "ENTRY_TOO_LARGE",
            ErrorCode::ArchiveTooLarge => "ARCHIVE_TOO_LARGE",
            ErrorCode::TooManyEntries => "TOO_MANY_ENTRIES",
            ErrorCode::InvalidArchive => "INVALID_ARCHIVE",
            ErrorCode::ConflictExists => "CONFLICT_EXISTS",
            ErrorCode::InvalidDestination => "INVALID_DESTINATION",
            ErrorCode::SlotNotFound => "SLOT_NOT_FOUND",
            ErrorCode::SlotMarkerInvalid => "SLOT_MARKER_INVALID",
            ErrorCode::AnchorNotFound => "ANCHOR_NOT_FOUND",
            ErrorCode::TargetNotFound => "TARGET_NOT_FOUND",
            ErrorCode::StyleFileNotFound => "STYLE_FILE_NOT_FOUND",
            ErrorCode::InvalidChange => "INVALID_CHANGE",
            ErrorCode::IntegrityMismatch => "INTEGRITY_MISMATCH",
            ErrorCode::OriginUnavailable => "ORIGIN_UNAVAILABLE",
            ErrorCode::TemplateNotFound => "TEMPLATE_NOT_FOUND",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::WriteFailed => "WRITE_FAILED",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::ConfigError => "CONFIG_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unsafe or malformed input, detected before any write.
    InputRejection,
    /// Directory already locked. Routine; the caller retries.
    Contention,
    /// Hash mismatch from cache or origin. Never silently ignored.
    Integrity,
    /// A write failed; every target kept its previous content.
    WriteFailure,
    /// Origin, filesystem or configuration trouble outside the caller's input.
    Infrastructure,
}

/// Which step of template resolution observed a bad hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStage {
    /// Fetched bytes disagree with what origin advertised.
    Origin,
    /// Blob re-read after writing it to the cache disagrees with the fetch.
    Written,
}

/// A field-path scoped problem reported by a structural validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

/// Engine error taxonomy
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("archive entry '{entry}' escapes the destination root")]
    PathTraversal { entry: String },

    #[error("archive entry '{entry}' is an absolute path")]
    AbsolutePath { entry: String },

    #[error("archive entry '{entry}' is a {kind} entry, only files and directories are allowed")]
    UnsafeEntryType { entry: String, kind: String },

    #[error("archive entry '{entry}' is {size} bytes, over the {limit}-byte entry ceiling")]
    EntryTooLarge { entry: String, size: u64, limit: u64 },

    #[error("archive expands past the {limit}-byte ceiling at entry '{entry}'")]
    ArchiveTooLarge { entry: String, total: u64, limit: u64 },

    #[error("archive holds more than {limit} entries")]
    TooManyEntries { count: usize, limit: usize },

    #[error("invalid archive: {reason}")]
    InvalidArchive {
        entry: Option<String>,
        reason: String,
    },

    #[error("destination {} is not empty; pass overwrite to replace it", path.display())]
    DestinationNotEmpty { path: PathBuf },

    #[error("directory {} is locked by another operation until {expires_at}", path.display())]
    Locked {
        path: PathBuf,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        retry_after: Duration,
    },

    #[error("invalid destination {}: {reason}", path.display())]
    InvalidDestination { path: PathBuf, reason: String },

    #[error("slot '{slot}' not found in {}", file.display())]
    SlotNotFound {
        file: PathBuf,
        slot: String,
        available: Vec<String>,
    },

    #[error("slot '{slot}' in {} at line {line}: {reason}", file.display())]
    SlotMarkerInvalid {
        file: PathBuf,
        slot: String,
        line: usize,
        reason: String,
    },

    #[error("anchor '{anchor}' not found in {}", file.display())]
    AnchorNotFound {
        file: PathBuf,
        anchor: String,
        available: Vec<String>,
    },

    #[error("no file matches target '{pattern}'")]
    TargetNotFound { pattern: String },

    #[error("no style file found (looked for {})", candidates.join(", "))]
    StyleFileNotFound { candidates: Vec<String> },

    #[error("invalid change: {reason}")]
    InvalidChange { reason: String },

    #[error("integrity mismatch for template '{template_id}': expected {expected}, got {actual}")]
    IntegrityMismatch {
        template_id: String,
        expected: String,
        actual: String,
        stage: IntegrityStage,
    },

    #[error("origin unavailable for template '{template_id}': {reason}")]
    OriginUnavailable { template_id: String, reason: String },

    #[error("template '{template_id}' is not known to origin")]
    TemplateNotFound { template_id: String },

    #[error("document failed structural validation ({} error(s))", errors.len())]
    ValidationFailed { errors: Vec<FieldError> },

    #[error("write to {} failed; no target was changed: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_change(reason: impl Into<String>) -> Self {
        EngineError::InvalidChange {
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::PathTraversal { .. } => ErrorCode::PathTraversalBlocked,
            EngineError::AbsolutePath { .. } => ErrorCode::AbsolutePathBlocked,
            EngineError::UnsafeEntryType { .. } => ErrorCode::UnsafeEntryType,
            EngineError::EntryTooLarge { .. } => ErrorCode::EntryTooLarge,
            EngineError::ArchiveTooLarge { .. } => ErrorCode::ArchiveTooLarge,
            EngineError::TooManyEntries { .. } => ErrorCode::TooManyEntries,
            EngineError::InvalidArchive { .. } => ErrorCode::InvalidArchive,
            EngineError::DestinationNotEmpty { .. } | EngineError::Locked { .. } => {
                ErrorCode::ConflictExists
            }
            EngineError::InvalidDestination { .. } => ErrorCode::InvalidDestination,
            EngineError::SlotNotFound { .. } => ErrorCode::SlotNotFound,
            EngineError::SlotMarkerInvalid { .. } => ErrorCode::SlotMarkerInvalid,
            EngineError::AnchorNotFound { .. } => ErrorCode::AnchorNotFound,
            EngineError::TargetNotFound { .. } => ErrorCode::TargetNotFound,
            EngineError::StyleFileNotFound { .. } => ErrorCode::StyleFileNotFound,
            EngineError::InvalidChange { .. } => ErrorCode::InvalidChange,
            EngineError::IntegrityMismatch { .. } => ErrorCode::IntegrityMismatch,
            EngineError::OriginUnavailable { .. } => ErrorCode::OriginUnavailable,
            EngineError::TemplateNotFound { .. } => ErrorCode::TemplateNotFound,
            EngineError::ValidationFailed { .. } => ErrorCode::ValidationFailed,
            EngineError::WriteFailed { .. } => ErrorCode::WriteFailed,
            EngineError::Io { .. } => ErrorCode::IoError,
            EngineError::Config(_) => ErrorCode::ConfigError,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Locked { .. } => ErrorClass::Contention,
            EngineError::IntegrityMismatch { .. } => ErrorClass::Integrity,
            EngineError::WriteFailed { .. } => ErrorClass::WriteFailure,
            EngineError::OriginUnavailable { .. }
            | EngineError::Io { .. }
            | EngineError::Config(_) => ErrorClass::Infrastructure,
            _ => ErrorClass::InputRejection,
        }
    }

    /// Contention and an unreachable origin can succeed on a later attempt;
    /// nothing else will.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Locked { .. } | EngineError::OriginUnavailable { .. }
        )
    }

    /// Hint for how long a caller should wait before retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::Locked { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Structured context for the envelope's `details` object.
    pub fn details(&self) -> Value {
        match self {
            EngineError::PathTraversal { entry } => {
                json!({ "entry": entry, "rule": "parent_traversal" })
            }
            EngineError::AbsolutePath { entry } => {
                json!({ "entry": entry, "rule": "absolute_path" })
            }
            EngineError::UnsafeEntryType { entry, kind } => {
                json!({ "entry": entry, "rule": "entry_type", "kind": kind })
            }
            EngineError::EntryTooLarge { entry, size, limit } => {
                json!({ "entry": entry, "rule": "max_entry_bytes", "size": size, "limit": limit })
            }
            EngineError::ArchiveTooLarge {
                entry,
                total,
                limit,
            } => {
                json!({ "entry": entry, "rule": "max_total_bytes", "total": total, "limit": limit })
            }
            EngineError::TooManyEntries { count, limit } => {
                json!({ "rule": "max_entries", "count": count, "limit": limit })
            }
            EngineError::InvalidArchive { entry, reason } => {
                json!({ "entry": entry, "reason": reason })
            }
            EngineError::DestinationNotEmpty { path } => {
                json!({ "reason": "destination_not_empty", "path": path })
            }
            EngineError::Locked {
                path,
                acquired_at,
                expires_at,
                retry_after,
            } => json!({
                "reason": "locked",
                "path": path,
                "acquired_at": acquired_at.to_rfc3339(),
                "expires_at": expires_at.to_rfc3339(),
                "retry_after_ms": u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                "retryable": true,
            }),
            EngineError::InvalidDestination { path, reason } => {
                json!({ "path": path, "reason": reason })
            }
            EngineError::SlotNotFound {
                file,
                slot,
                available,
            } => json!({ "file": file, "slot": slot, "available_slots": available }),
            EngineError::SlotMarkerInvalid {
                file,
                slot,
                line,
                reason,
            } => json!({ "file": file, "slot": slot, "line": line, "reason": reason }),
            EngineError::AnchorNotFound {
                file,
                anchor,
                available,
            } => json!({ "file": file, "anchor": anchor, "available_anchors": available }),
            EngineError::TargetNotFound { pattern } => json!({ "target": pattern }),
            EngineError::StyleFileNotFound { candidates } => json!({ "candidates": candidates }),
            EngineError::InvalidChange { reason } => json!({ "reason": reason }),
            EngineError::IntegrityMismatch {
                template_id,
                expected,
                actual,
                stage,
            } => json!({
                "template_id": template_id,
                "expected": expected,
                "actual": actual,
                "stage": stage,
            }),
            EngineError::OriginUnavailable {
                template_id,
                reason,
            } => json!({ "template_id": template_id, "reason": reason, "retryable": true }),
            EngineError::TemplateNotFound { template_id } => json!({ "template_id": template_id }),
            EngineError::ValidationFailed { errors } => json!({ "errors": errors }),
            EngineError::WriteFailed { path, source } => {
                json!({ "path": path, "io_error": source.to_string(), "rolled_back": true })
            }
            EngineError::Io { path, source } => {
                json!({ "path": path, "io_error": source.to_string() })
            }
            EngineError::Config(msg) => json!({ "reason": msg }),
        }
    }
}

impl From<crate::config::ConfigError> for EngineError {
    fn from(err: crate::config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

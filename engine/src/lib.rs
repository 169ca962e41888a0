//! Template materialization and mutation engine.
//!
//! Turns a cached, checksummed template archive into a live project tree and
//! then applies idempotent, simulate-capable content mutations to it:
//!
//! - [`store`]: template id → verified archive bytes (content-addressed cache)
//! - [`archive`]: two-phase extraction that rejects unsafe entries up front
//! - [`atomic`]: crash-safe single-file and batch writes, directory swaps
//! - [`lock`]: per-directory exclusive locks with expiry
//! - [`mutate`]: slot filler, theme rewriter and component inserter
//! - [`engine`]: the facade that returns an [`Envelope`] for everything

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod archive;
pub mod atomic;
pub mod blueprint;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
#[cfg(any(test, feature = "dev-faults"))]
pub mod faults;
pub mod lock;
pub mod mutate;
pub mod store;

pub use blueprint::{Blueprint, JsonSchemaValidator, Step, StructuralValidator};
pub use config::{ConfigLoader, EngineConfig};
pub use engine::{Engine, MaterializeOptions};
pub use envelope::Envelope;
pub use error::{EngineError, ErrorClass, ErrorCode, FieldError, Result};
pub use lock::{LockHandle, LockManager};
pub use mutate::{
    ComponentChange, ImportKind, ImportSpec, InsertPosition, MutationOptions, SlotChange,
    ThemeChange, ThemeScope,
};
pub use store::{IntegrityStore, MirrorOrigin, TemplateOrigin};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

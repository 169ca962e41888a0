//! Safe Archive Extractor.
//!
//! Two phases: [`plan`] validates the complete directory table in memory,
//! then [`extract`] writes into a staging sibling and swaps it into place.
//! A rejected archive never leaves a file behind.

pub mod extract;
pub mod plan;

pub use extract::{ExtractOptions, ExtractionResult, Extractor};
pub use plan::{ArchiveFormat, ExtractionPlan, PlanEntry, validate_entry_path};

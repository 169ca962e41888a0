//! Template subcommands.
//!
//! - `tplforge materialize <template> <dest>`
//! - `tplforge blueprint <file> <dest>`

use std::path::{Path, PathBuf};

use clap::Parser;
use serde_json::Value;
use tplforge_engine::{Engine, EngineError, Envelope, FieldError, MaterializeOptions};

#[derive(Debug, Parser)]
pub struct MaterializeArgs {
    /// Template id
    pub template: String,

    /// Destination directory (must be empty unless --overwrite)
    pub dest: PathBuf,

    /// Replace a non-empty destination
    #[arg(long)]
    pub overwrite: bool,

    /// Validate and report without writing
    #[arg(long)]
    pub simulate: bool,

    /// Ask origin even when the cache has a verified copy
    #[arg(long)]
    pub force_refresh: bool,
}

pub async fn materialize(engine: &Engine, args: MaterializeArgs) -> Envelope {
    let options = MaterializeOptions {
        overwrite: args.overwrite,
        simulate: args.simulate,
        force_refresh: args.force_refresh,
    };
    engine.materialize(&args.template, &args.dest, options).await
}

#[derive(Debug, Parser)]
pub struct BlueprintArgs {
    /// Blueprint JSON document
    pub file: PathBuf,

    /// Destination directory
    pub dest: PathBuf,

    /// Run every step against a scratch copy and leave dest untouched
    #[arg(long)]
    pub simulate: bool,
}

pub async fn blueprint(engine: &Engine, args: BlueprintArgs) -> Envelope {
    match read_document(&args.file) {
        Ok(document) => engine.run_blueprint(&document, &args.dest, args.simulate).await,
        Err(err) => Envelope::failure("run_blueprint", &err),
    }
}

fn read_document(path: &Path) -> tplforge_engine::Result<Value> {
    let text = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
    serde_json::from_str(&text).map_err(|e| EngineError::ValidationFailed {
        errors: vec![FieldError {
            path: String::new(),
            message: format!("not a JSON document: {e}"),
        }],
    })
}

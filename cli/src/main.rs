//! `tplforge` entry point.
//!
//! Every subcommand prints exactly one response envelope as pretty JSON on
//! stdout. Logs go to stderr, filtered by `RUST_LOG` (default `warn`).
//!
//! ## Exit codes
//!
//! - `0` the envelope is a success
//! - `2` the input was rejected or the directory was busy
//! - `3` integrity, write or infrastructure failure

mod mutate_cmd;
mod template_cmd;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tplforge_engine::config::EngineConfig;
use tplforge_engine::{ConfigLoader, Engine, Envelope, ErrorCode, JsonSchemaValidator};
use tracing_subscriber::EnvFilter;

/// Materialize project templates and apply content mutations to them.
#[derive(Debug, Parser)]
#[command(name = "tplforge", version)]
struct Cli {
    /// Configuration file (defaults to ./tplforge.toml, then the user config dir)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Cache directory, overriding the configured one
    #[arg(long, global = true, value_name = "DIR")]
    cache_root: Option<PathBuf>,

    /// Serve templates from this local mirror directory
    #[arg(long, global = true, value_name = "DIR")]
    mirror: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Unpack a template into a destination directory
    Materialize(template_cmd::MaterializeArgs),
    /// Replace the content between a named slot's markers
    FillSlot(mutate_cmd::FillSlotArgs),
    /// Set theme tokens in the project's style file
    Theme(mutate_cmd::ThemeArgs),
    /// Insert a component next to an anchored element
    Insert(mutate_cmd::InsertArgs),
    /// List templates in the cache
    List,
    /// Show cache size
    Stats,
    /// Materialize a template and run a list of mutation steps
    Blueprint(template_cmd::BlueprintArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let envelope = match build_engine(&cli) {
        Ok(engine) => run(&engine, cli.command).await,
        Err(err) => Envelope::failure("load_config", &err),
    };

    println!("{}", serde_json::to_string_pretty(&envelope)?);
    let code = exit_code(&envelope);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn init_logging() {
    let default_level = "warn";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(cli: &Cli) -> tplforge_engine::Result<EngineConfig> {
    let mut loader = match &cli.config {
        Some(path) => ConfigLoader::new().with_file(path),
        None => ConfigLoader::discover(),
    };
    if let Some(cache_root) = &cli.cache_root {
        loader = loader.with_cache_root(cache_root);
    }
    if let Some(mirror) = &cli.mirror {
        loader = loader.with_mirror_dir(mirror);
    }
    Ok(loader.load()?)
}

fn build_engine(cli: &Cli) -> tplforge_engine::Result<Engine> {
    let config = load_config(cli)?;
    let validator = JsonSchemaValidator::blueprint()?;
    Ok(Engine::from_config(config)?.with_validator(Arc::new(validator)))
}

async fn run(engine: &Engine, command: Command) -> Envelope {
    match command {
        Command::Materialize(args) => template_cmd::materialize(engine, args).await,
        Command::FillSlot(args) => mutate_cmd::fill_slot(engine, args),
        Command::Theme(args) => mutate_cmd::theme(engine, args),
        Command::Insert(args) => mutate_cmd::insert(engine, args),
        Command::List => engine.list_templates().await,
        Command::Stats => engine.store_stats().await,
        Command::Blueprint(args) => template_cmd::blueprint(engine, args).await,
    }
}

fn exit_code(envelope: &Envelope) -> i32 {
    match envelope.error_code() {
        None => 0,
        Some(
            ErrorCode::IntegrityMismatch
            | ErrorCode::OriginUnavailable
            | ErrorCode::WriteFailed
            | ErrorCode::IoError
            | ErrorCode::ConfigError,
        ) => 3,
        Some(_) => 2,
    }
}

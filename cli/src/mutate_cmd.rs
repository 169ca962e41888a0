//! Mutation subcommands.
//!
//! - `tplforge fill-slot <root> <target> <slot> --content <text>`
//! - `tplforge theme <root> --set primary=#0f172a [--dark]`
//! - `tplforge insert <root> <target> <anchor> --symbol <S>`

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;
use serde_json::Value;
use tplforge_engine::{
    ComponentChange, Engine, EngineError, Envelope, ImportKind, ImportSpec, InsertPosition,
    MutationOptions, SlotChange, ThemeChange, ThemeScope,
};

#[derive(Debug, Parser)]
pub struct FillSlotArgs {
    /// Project root
    pub root: PathBuf,

    /// File path or wildcard pattern, relative to the root
    pub target: String,

    /// Slot name
    pub slot: String,

    /// Replacement content
    #[arg(long, conflicts_with = "content_file", required_unless_present = "content_file")]
    pub content: Option<String>,

    /// Read the replacement content from a file
    #[arg(long, value_name = "PATH")]
    pub content_file: Option<PathBuf>,

    /// Report without writing
    #[arg(long)]
    pub simulate: bool,
}

pub fn fill_slot(engine: &Engine, args: FillSlotArgs) -> Envelope {
    let content = match (args.content, args.content_file) {
        (Some(content), _) => content,
        (None, Some(path)) => match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => return Envelope::failure("fill_slot", &EngineError::io(path, e)),
        },
        (None, None) => String::new(),
    };
    let change = SlotChange {
        target: args.target,
        slot: args.slot,
        content,
    };
    engine.fill_slot(&args.root, &change, options(args.simulate))
}

#[derive(Debug, Parser)]
pub struct ThemeArgs {
    /// Project root
    pub root: PathBuf,

    /// Token to set, with or without the leading `--`
    #[arg(long = "set", value_name = "NAME=VALUE", required = true, value_parser = parse_token)]
    pub tokens: Vec<(String, String)>,

    /// Target the alternate (dark) scope instead of the default one
    #[arg(long)]
    pub dark: bool,

    /// Style file relative to the root
    #[arg(long, value_name = "PATH")]
    pub file: Option<String>,

    /// Report without writing
    #[arg(long)]
    pub simulate: bool,
}

pub fn theme(engine: &Engine, args: ThemeArgs) -> Envelope {
    let change = ThemeChange {
        file: args.file,
        scope: if args.dark {
            ThemeScope::Alternate
        } else {
            ThemeScope::Default
        },
        tokens: args.tokens.into_iter().collect(),
    };
    engine.rewrite_theme(&args.root, &change, options(args.simulate))
}

#[derive(Debug, Parser)]
pub struct InsertArgs {
    /// Project root
    pub root: PathBuf,

    /// File path or wildcard pattern, relative to the root
    pub target: String,

    /// `data-anchor` id of the existing element
    pub anchor: String,

    /// Component to insert, e.g. `Hero` or `Ui.Badge`
    #[arg(long)]
    pub symbol: String,

    /// `data-anchor` id for the new element
    #[arg(long)]
    pub id: Option<String>,

    /// Insert before the anchor instead of after it
    #[arg(long)]
    pub before: bool,

    /// Attribute; the value is parsed as JSON, falling back to a string
    #[arg(long = "attr", value_name = "KEY=JSON", value_parser = parse_attribute)]
    pub attributes: Vec<(String, Value)>,

    /// Element children
    #[arg(long)]
    pub children: Option<String>,

    /// Module to import the symbol from
    #[arg(long, value_name = "SOURCE")]
    pub import_from: Option<String>,

    /// Import the symbol as the module's default export
    #[arg(long, requires = "import_from")]
    pub default_import: bool,

    /// Report without writing
    #[arg(long)]
    pub simulate: bool,
}

pub fn insert(engine: &Engine, args: InsertArgs) -> Envelope {
    let kind = if args.default_import {
        ImportKind::Default
    } else {
        ImportKind::Named
    };
    let change = ComponentChange {
        target: args.target,
        anchor: args.anchor,
        position: if args.before {
            InsertPosition::Before
        } else {
            InsertPosition::After
        },
        symbol: args.symbol,
        id: args.id,
        attributes: args.attributes.into_iter().collect::<BTreeMap<_, _>>(),
        children: args.children,
        import: args.import_from.map(|source| ImportSpec { source, kind }),
    };
    engine.insert_component(&args.root, &change, options(args.simulate))
}

fn options(simulate: bool) -> MutationOptions {
    MutationOptions { simulate }
}

fn parse_token(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}

fn parse_attribute(raw: &str) -> Result<(String, Value), String> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(format!("expected KEY=JSON, got '{raw}'"));
    };
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attributes_parse_as_json_or_text() {
        assert_eq!(parse_attribute("count=3"), Ok(("count".into(), json!(3))));
        assert_eq!(parse_attribute("open=true"), Ok(("open".into(), json!(true))));
        assert_eq!(
            parse_attribute("title=Hello there"),
            Ok(("title".into(), json!("Hello there")))
        );
        assert!(parse_attribute("title").is_err());
    }

    #[test]
    fn tokens_need_a_name() {
        assert_eq!(
            parse_token("--primary=#0f172a"),
            Ok(("--primary".into(), "#0f172a".into()))
        );
        assert!(parse_token("=red").is_err());
        assert!(parse_token("primary").is_err());
    }
}

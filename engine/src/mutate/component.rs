//! Component inserter.
//!
//! Places a new element next to an anchored one (`data-anchor="<id>"`) and
//! makes sure the element's symbol is imported.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::imports::ensure_import;
use super::markup::{AnchorElement, element_end, find_anchors, render_element, scan_tags};
use super::target::resolve_target;
use super::{
    MutationOptions, MutationResult, Mutator, Staged, Warning, WarningCode, finish, indent_at,
    line_ending, line_start, read_text,
};
use crate::atomic::AtomicWriter;
use crate::config::ScanConfig;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPosition {
    Before,
    #[default]
    After,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportKind {
    #[default]
    Named,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSpec {
    /// Module specifier, e.g. `@/components/hero`.
    pub source: String,
    #[serde(default)]
    pub kind: ImportKind,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ComponentChange {
    pub target: String,
    /// Id of the existing anchor element.
    pub anchor: String,
    #[serde(default)]
    pub position: InsertPosition,
    /// Element name, e.g. `Hero` or `Ui.Badge`.
    pub symbol: String,
    /// `data-anchor` of the new element, so later changes can target it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ImportSpec>,
}

/// Whether an element matching `change` already sits next to `anchor` on
/// the requested side.
fn already_adjacent(text: &str, anchor: &AnchorElement, anchor_end: usize, change: &ComponentChange) -> bool {
    let tags = scan_tags(text);
    let same_element = |index: usize| {
        let tag = &tags[index];
        !tag.closing
            && tag.name == change.symbol
            && match &change.id {
                Some(id) => tag.anchor.as_deref() == Some(id.as_str()),
                None => true,
            }
    };

    match change.position {
        InsertPosition::After => {
            let rest = &text[anchor_end..];
            let next = anchor_end + (rest.len() - rest.trim_start().len());
            tags.iter()
                .position(|t| t.start == next)
                .is_some_and(same_element)
        }
        InsertPosition::Before => {
            let previous = text[..anchor.start].trim_end().len();
            (0..tags.len())
                .filter(|&i| tags[i].start < anchor.start)
                .any(|i| same_element(i) && element_end(&tags, i) == Some(previous))
        }
    }
}

/// Insert `element` on its own line next to the anchor.
fn insert_element(
    text: &str,
    anchor: &AnchorElement,
    anchor_end: usize,
    element: &str,
    position: InsertPosition,
) -> String {
    let eol = line_ending(text);
    let indent = indent_at(text, anchor.start);
    let mut out = text.to_string();
    match position {
        InsertPosition::After => {
            out.insert_str(anchor_end, &format!("{eol}{indent}{element}"));
        }
        InsertPosition::Before => {
            let start_of_line = line_start(text, anchor.start);
            if text[start_of_line..anchor.start].trim().is_empty() {
                out.insert_str(start_of_line, &format!("{indent}{element}{eol}"));
            } else {
                out.insert_str(anchor.start, &format!("{element}{eol}{indent}"));
            }
        }
    }
    out
}

/// Compute the new file content for `change`.
pub fn insert(text: &str, file: &Path, change: &ComponentChange, warnings: &mut Vec<Warning>) -> Result<String> {
    let element = render_element(
        &change.symbol,
        change.id.as_deref(),
        &change.attributes,
        change.children.as_deref(),
    )?;

    let anchors = find_anchors(text);
    let matching: Vec<&AnchorElement> = anchors.iter().filter(|a| a.id == change.anchor).collect();
    let Some(anchor) = matching.first().copied() else {
        let mut available: Vec<String> = Vec::new();
        for anchor in &anchors {
            if !available.contains(&anchor.id) {
                available.push(anchor.id.clone());
            }
        }
        return Err(EngineError::AnchorNotFound {
            file: file.to_path_buf(),
            anchor: change.anchor.clone(),
            available,
        });
    };
    if matching.len() > 1 {
        warnings.push(Warning::new(
            WarningCode::DuplicateAnchor,
            format!(
                "anchor '{}' appears {} times in {}; using the first",
                change.anchor,
                matching.len(),
                file.display()
            ),
        ));
    }
    let Some(anchor_end) = anchor.end else {
        return Err(EngineError::invalid_change(format!(
            "anchor '{}' <{}> in {} is never closed",
            anchor.id,
            anchor.name,
            file.display()
        )));
    };

    let mut updated = if already_adjacent(text, anchor, anchor_end, change) {
        tracing::debug!(anchor = %change.anchor, symbol = %change.symbol, "element already in place");
        text.to_string()
    } else {
        insert_element(text, anchor, anchor_end, &element, change.position)
    };

    if let Some(spec) = &change.import {
        updated = ensure_import(&updated, &change.symbol, spec, warnings);
    }
    Ok(updated)
}

#[derive(Debug, Clone, Default)]
pub struct ComponentInserter {
    ignore_dirs: Vec<String>,
    writer: AtomicWriter,
}

impl ComponentInserter {
    pub fn new(scan: &ScanConfig) -> Self {
        Self {
            ignore_dirs: scan.ignore_dirs.clone(),
            writer: AtomicWriter::new(),
        }
    }

    pub fn with_writer(mut self, writer: AtomicWriter) -> Self {
        self.writer = writer;
        self
    }
}

impl Mutator for ComponentInserter {
    type Change = ComponentChange;

    fn name(&self) -> &'static str {
        "insert_component"
    }

    fn apply(
        &self,
        root: &Path,
        change: &ComponentChange,
        options: MutationOptions,
    ) -> Result<MutationResult> {
        let started = Instant::now();
        let target = resolve_target(root, &change.target, &self.ignore_dirs)?;
        let original = read_text(&target.path)?;
        let mut warnings = target.warnings;
        let updated = insert(&original, Path::new(&target.rel), change, &mut warnings)?;

        finish(
            &self.writer,
            vec![Staged {
                rel: target.rel,
                path: target.path,
                original,
                updated,
            }],
            warnings,
            started,
            options,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    const PAGE: &str = "import { Header } from \"@/components/header\";\n\nexport default function Page() {\n  return (\n    <main>\n      <Header data-anchor=\"header\" />\n      <section data-anchor=\"content\">\n        <p>Body</p>\n      </section>\n    </main>\n  );\n}\n";

    fn change(anchor: &str, position: InsertPosition) -> ComponentChange {
        ComponentChange {
            target: "app/page.tsx".into(),
            anchor: anchor.into(),
            position,
            symbol: "Hero".into(),
            id: Some("hero".into()),
            attributes: BTreeMap::from([("title".to_string(), json!("Welcome"))]),
            children: None,
            import: Some(ImportSpec {
                source: "@/components/hero".into(),
                kind: ImportKind::Named,
            }),
        }
    }

    #[test]
    fn inserts_after_anchor_with_import() {
        let mut warnings = Vec::new();
        let out = insert(PAGE, Path::new("page.tsx"), &change("header", InsertPosition::After), &mut warnings).unwrap();
        assert_eq!(
            out,
            "import { Header } from \"@/components/header\";\nimport { Hero } from \"@/components/hero\";\n\nexport default function Page() {\n  return (\n    <main>\n      <Header data-anchor=\"header\" />\n      <Hero data-anchor=\"hero\" title=\"Welcome\" />\n      <section data-anchor=\"content\">\n        <p>Body</p>\n      </section>\n    </main>\n  );\n}\n"
        );
        assert!(warnings.is_empty());
    }

    #[test]
    fn inserts_before_multiline_anchor() {
        let mut warnings = Vec::new();
        let mut before = change("content", InsertPosition::Before);
        before.import = None;
        let out = insert(PAGE, Path::new("page.tsx"), &before, &mut warnings).unwrap();
        assert!(out.contains(
            "      <Header data-anchor=\"header\" />\n      <Hero data-anchor=\"hero\" title=\"Welcome\" />\n      <section data-anchor=\"content\">"
        ));
        let again = insert(&out, Path::new("page.tsx"), &before, &mut warnings).unwrap();
        assert_eq!(again, out);
    }

    #[test]
    fn inserting_after_a_multiline_element_goes_past_its_close() {
        let mut warnings = Vec::new();
        let mut after = change("content", InsertPosition::After);
        after.import = None;
        let out = insert(PAGE, Path::new("page.tsx"), &after, &mut warnings).unwrap();
        assert!(out.contains("      </section>\n      <Hero data-anchor=\"hero\" title=\"Welcome\" />\n    </main>"));
    }

    #[test]
    fn unknown_anchor_lists_known_ones() {
        let mut warnings = Vec::new();
        let err = insert(PAGE, Path::new("page.tsx"), &change("pricing", InsertPosition::After), &mut warnings)
            .unwrap_err();
        assert_eq!(err.code().as_str(), "ANCHOR_NOT_FOUND");
        assert_eq!(err.details()["available_anchors"], json!(["header", "content"]));
    }

    #[test]
    fn duplicate_anchor_uses_first_and_warns() {
        let text = "<A data-anchor=\"x\" />\n<B data-anchor=\"x\" />\n";
        let mut warnings = Vec::new();
        let mut first = change("x", InsertPosition::After);
        first.import = None;
        let out = insert(text, Path::new("page.tsx"), &first, &mut warnings).unwrap();
        assert_eq!(
            out,
            "<A data-anchor=\"x\" />\n<Hero data-anchor=\"hero\" title=\"Welcome\" />\n<B data-anchor=\"x\" />\n"
        );
        assert_eq!(warnings[0].code, WarningCode::DuplicateAnchor);
    }

    #[test]
    fn inserting_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("app")).unwrap();
        fs::write(dir.path().join("app/page.tsx"), PAGE).unwrap();
        let inserter = ComponentInserter::default();
        let change = change("header", InsertPosition::After);

        let first = inserter
            .apply(dir.path(), &change, MutationOptions::default())
            .unwrap();
        let after_first = fs::read_to_string(dir.path().join("app/page.tsx")).unwrap();
        let second = inserter
            .apply(dir.path(), &change, MutationOptions::default())
            .unwrap();

        assert!(first.changed);
        assert!(!second.changed);
        assert!(second.files_written.is_empty());
        assert_eq!(
            fs::read_to_string(dir.path().join("app/page.tsx")).unwrap(),
            after_first
        );
    }
}

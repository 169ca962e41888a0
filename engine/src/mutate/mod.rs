//! Mutation Operators.
//!
//! Every operator follows the same skeleton: locate the region in the
//! current tree, compute the new content, compare it with what is on disk,
//! and write through [`AtomicWriter`] only when something actually changed.
//! A no-op is a successful result with `changed == false`.

pub mod color;
pub mod component;
pub mod imports;
pub mod markup;
pub mod slot;
pub mod target;
pub mod theme;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};

use crate::atomic::{AtomicWriter, WriteOp};
use crate::error::{EngineError, Result};

pub use component::{ComponentChange, ComponentInserter, ImportKind, ImportSpec, InsertPosition};
pub use slot::{SlotChange, SlotFiller, SlotRegion};
pub use theme::{ThemeChange, ThemeRewriter, ThemeScope};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationOptions {
    /// Compute the change and report it without writing.
    pub simulate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    DuplicateMatch,
    ThemeBlockCreated,
    DuplicateToken,
    ImportConflict,
    DuplicateAnchor,
}

impl WarningCode {
    pub fn as_str(self) -> &'static str {
        match self {
            WarningCode::DuplicateMatch => "DUPLICATE_MATCH",
            WarningCode::ThemeBlockCreated => "THEME_BLOCK_CREATED",
            WarningCode::DuplicateToken => "DUPLICATE_TOKEN",
            WarningCode::ImportConflict => "IMPORT_CONFLICT",
            WarningCode::DuplicateAnchor => "DUPLICATE_ANCHOR",
        }
    }
}

/// Something worth telling the caller that did not stop the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub code: WarningCode,
    pub message: String,
}

impl Warning {
    pub fn new(code: WarningCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationResult {
    pub changed: bool,
    /// Files written (or that would be written when simulating), relative
    /// to the tree root with `/` separators.
    pub files_written: Vec<String>,
    pub warnings: Vec<Warning>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub simulated: bool,
}

fn as_millis<S: Serializer>(elapsed: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(elapsed.as_millis() as u64)
}

/// Common contract of the three operators.
pub trait Mutator {
    type Change;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn apply(
        &self,
        root: &Path,
        change: &Self::Change,
        options: MutationOptions,
    ) -> Result<MutationResult>;
}

/// New content computed for one file.
#[derive(Debug)]
pub(crate) struct Staged {
    pub rel: String,
    pub path: PathBuf,
    pub original: String,
    pub updated: String,
}

/// Compare, then write what differs (or only report it when simulating).
pub(crate) fn finish(
    writer: &AtomicWriter,
    staged: Vec<Staged>,
    warnings: Vec<Warning>,
    started: Instant,
    options: MutationOptions,
) -> Result<MutationResult> {
    let changed: Vec<Staged> = staged
        .into_iter()
        .filter(|s| s.original.as_bytes() != s.updated.as_bytes())
        .collect();
    let files: Vec<String> = changed.iter().map(|s| s.rel.clone()).collect();

    if !changed.is_empty() && !options.simulate {
        match changed.as_slice() {
            [single] => writer.write_one(&single.path, single.updated.as_bytes())?,
            many => writer.write_many(
                &many
                    .iter()
                    .map(|s| WriteOp::new(&s.path, s.updated.as_bytes()))
                    .collect::<Vec<_>>(),
            )?,
        }
    }

    Ok(MutationResult {
        changed: !changed.is_empty(),
        files_written: files,
        warnings,
        elapsed: started.elapsed(),
        simulated: options.simulate,
    })
}

pub(crate) fn read_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| EngineError::io(path, e))?;
    String::from_utf8(bytes).map_err(|_| {
        EngineError::invalid_change(format!("{} is not UTF-8 text", path.display()))
    })
}

/// The file's own line ending: `\r\n` if it uses any, else `\n`.
pub(crate) fn line_ending(text: &str) -> &'static str {
    if text.contains("\r\n") { "\r\n" } else { "\n" }
}

/// Leading spaces and tabs of the line containing `offset`.
pub(crate) fn indent_at(text: &str, offset: usize) -> &str {
    let line_start = line_start(text, offset);
    let rest = &text[line_start..];
    let width = rest
        .find(|c: char| c != ' ' && c != '\t')
        .unwrap_or(rest.len());
    &rest[..width]
}

pub(crate) fn line_start(text: &str, offset: usize) -> usize {
    text[..offset].rfind('\n').map_or(0, |i| i + 1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn identical_content_is_not_written() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "same").unwrap();
        let staged = vec![Staged {
            rel: "a.txt".into(),
            path: path.clone(),
            original: "same".into(),
            updated: "same".into(),
        }];

        let result = finish(
            &AtomicWriter::new(),
            staged,
            Vec::new(),
            Instant::now(),
            MutationOptions::default(),
        )
        .unwrap();

        assert!(!result.changed);
        assert!(result.files_written.is_empty());
    }

    #[test]
    fn simulate_reports_but_does_not_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "old").unwrap();
        let staged = vec![Staged {
            rel: "a.txt".into(),
            path: path.clone(),
            original: "old".into(),
            updated: "new".into(),
        }];

        let result = finish(
            &AtomicWriter::new(),
            staged,
            Vec::new(),
            Instant::now(),
            MutationOptions { simulate: true },
        )
        .unwrap();

        assert!(result.changed && result.simulated);
        assert_eq!(result.files_written, vec!["a.txt"]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old");
    }

    #[test]
    fn indentation_helpers() {
        let text = "a\n    <Hero />\n\tb";
        let hero = text.find("<Hero").unwrap();
        assert_eq!(indent_at(text, hero), "    ");
        assert_eq!(line_start(text, hero), 2);
        assert_eq!(indent_at(text, text.len()), "\t");
        assert_eq!(line_ending("a\r\nb"), "\r\n");
    }

    #[test]
    fn warnings_render_with_their_code() {
        let warning = Warning::new(WarningCode::DuplicateMatch, "2 files matched");
        assert_eq!(warning.to_string(), "DUPLICATE_MATCH: 2 files matched");
    }
}

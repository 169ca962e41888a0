//! Content-slot filler.
//!
//! A slot is the span of lines strictly between a line containing
//! `@slot:start <id>` and a later line containing `@slot:end <id>`, in
//! whatever comment syntax the file uses. Only that span is replaced; the
//! marker lines are never touched.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::target::resolve_target;
use super::{MutationOptions, MutationResult, Mutator, Staged, finish, line_ending, read_text};
use crate::atomic::AtomicWriter;
use crate::config::ScanConfig;
use crate::error::{EngineError, Result};

#[allow(clippy::expect_used)] // literal pattern
static START_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@slot:start\s+([A-Za-z0-9_.-]+)").expect("valid slot start regex")
});

#[allow(clippy::expect_used)] // literal pattern
static END_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@slot:end\s+([A-Za-z0-9_.-]+)").expect("valid slot end regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotChange {
    /// Relative path or wildcard pattern.
    pub target: String,
    pub slot: String,
    pub content: String,
}

/// A located, well-formed slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRegion {
    pub id: String,
    /// Zero-based line index of the start marker.
    pub start_line: usize,
    /// Zero-based line index of the end marker.
    pub end_line: usize,
    /// Leading whitespace of the start marker line.
    pub indent: String,
}

/// Find every slot in `text`, rejecting malformed marker layouts.
pub fn scan_slots(text: &str, file: &Path) -> Result<Vec<SlotRegion>> {
    let invalid = |slot: &str, line: usize, reason: &str| EngineError::SlotMarkerInvalid {
        file: file.to_path_buf(),
        slot: slot.to_string(),
        line: line + 1,
        reason: reason.to_string(),
    };

    let mut regions: Vec<SlotRegion> = Vec::new();
    let mut open: Option<(String, usize, String)> = None;

    for (index, line) in text.lines().enumerate() {
        let starts: Vec<&str> = START_MARKER
            .captures_iter(line)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .collect();
        let ends: Vec<&str> = END_MARKER
            .captures_iter(line)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .collect();

        if let (Some(start), Some(_)) = (starts.first(), ends.first()) {
            return Err(invalid(start, index, "start and end markers share a line"));
        }
        if starts.len() > 1 {
            return Err(invalid(starts[1], index, "more than one start marker on a line"));
        }

        if let Some(id) = starts.first() {
            if let Some((outer, _, _)) = &open {
                return Err(invalid(
                    id,
                    index,
                    &format!("starts inside open slot '{outer}'"),
                ));
            }
            if regions.iter().any(|r| r.id == *id) {
                return Err(invalid(id, index, "duplicate start marker"));
            }
            let indent: String = line
                .chars()
                .take_while(|c| *c == ' ' || *c == '\t')
                .collect();
            open = Some((id.to_string(), index, indent));
        }

        for id in ends {
            match open.take() {
                Some((open_id, start_line, indent)) if open_id == id => {
                    regions.push(SlotRegion {
                        id: open_id,
                        start_line,
                        end_line: index,
                        indent,
                    });
                }
                Some((open_id, _, _)) => {
                    return Err(invalid(
                        id,
                        index,
                        &format!("end marker does not match open slot '{open_id}'"),
                    ));
                }
                None => return Err(invalid(id, index, "end marker without a start")),
            }
        }
    }

    if let Some((id, line, _)) = open {
        return Err(invalid(&id, line, "start marker is never closed"));
    }
    Ok(regions)
}

/// Dedent `content`, drop surrounding blank lines and re-indent every
/// non-blank line with `indent`.
pub fn reindent(content: &str, indent: &str) -> Vec<String> {
    let normalized = content.replace("\r\n", "\n");
    let mut lines: Vec<&str> = normalized.split('\n').collect();
    while lines.first().is_some_and(|l| l.trim().is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    let common = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);

    lines
        .iter()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("{indent}{}", &line[common..])
            }
        })
        .collect()
}

/// Replace the body of `slot` in `text`.
pub fn fill(text: &str, file: &Path, slot: &str, content: &str) -> Result<String> {
    let regions = scan_slots(text, file)?;
    let Some(region) = regions.iter().find(|r| r.id == slot) else {
        return Err(EngineError::SlotNotFound {
            file: file.to_path_buf(),
            slot: slot.to_string(),
            available: regions.into_iter().map(|r| r.id).collect(),
        });
    };

    let eol = line_ending(text);
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let mut out = String::with_capacity(text.len() + content.len());
    for line in &lines[..=region.start_line] {
        out.push_str(line);
    }
    for line in reindent(content, &region.indent) {
        out.push_str(&line);
        out.push_str(eol);
    }
    for line in &lines[region.end_line..] {
        out.push_str(line);
    }
    Ok(out)
}

#[derive(Debug, Clone, Default)]
pub struct SlotFiller {
    ignore_dirs: Vec<String>,
    writer: AtomicWriter,
}

impl SlotFiller {
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

impl Mutator for SlotFiller {
    type Change = SlotChange;

    fn name(&self) -> &'static str {
        "fill_slot"
    }

    fn apply(
        &self,
        root: &Path,
        change: &SlotChange,
        options: MutationOptions,
    ) -> Result<MutationResult> {
        let started = Instant::now();
        let target = resolve_target(root, &change.target, &self.ignore_dirs)?;
        let original = read_text(&target.path)?;
        let updated = fill(&original, Path::new(&target.rel), &change.slot, &change.content)?;

        finish(
            &self.writer,
            vec![Staged {
                rel: target.rel,
                path: target.path,
                original,
                updated,
            }],
            target.warnings,
            started,
            options,
        )
    }
}

//! Resolve a mutation target (relative path or wildcard) inside a tree.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use wildmatch::WildMatch;

use super::{Warning, WarningCode};
use crate::archive::validate_entry_path;
use crate::error::{EngineError, Result};

/// The file an operator will work on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// `/`-separated path relative to the root.
    pub rel: String,
    pub path: PathBuf,
    pub warnings: Vec<Warning>,
}

/// `*` and `?` make a target a pattern. `*` also crosses `/`.
pub fn is_pattern(target: &str) -> bool {
    target.contains(['*', '?'])
}

/// Find the file `target` names under `root`.
///
/// A literal path wins even if it contains pattern characters. A pattern
/// is matched against every file outside `ignore_dirs`; the first match in
/// path order is used and any others raise `DUPLICATE_MATCH`.
pub fn resolve_target(root: &Path, target: &str, ignore_dirs: &[String]) -> Result<ResolvedTarget> {
    let literal = validate_entry_path(target)?.ok_or_else(|| EngineError::TargetNotFound {
        pattern: target.to_string(),
    })?;
    let literal_path = join_rel(root, &literal);
    if is_regular_file_within(root, &literal) {
        return Ok(ResolvedTarget {
            rel: literal,
            path: literal_path,
            warnings: Vec::new(),
        });
    }
    if !is_pattern(target) {
        return Err(EngineError::TargetNotFound {
            pattern: target.to_string(),
        });
    }

    let mut matches = matching_files(root, &literal, ignore_dirs);
    if matches.is_empty() {
        return Err(EngineError::TargetNotFound {
            pattern: target.to_string(),
        });
    }
    let mut warnings = Vec::new();
    if matches.len() > 1 {
        tracing::info!(target, matches = matches.len(), "target matched several files");
        warnings.push(Warning::new(
            WarningCode::DuplicateMatch,
            format!(
                "'{target}' matched {} files ({}); using {}",
                matches.len(),
                matches.join(", "),
                matches[0]
            ),
        ));
    }
    let rel = matches.swap_remove(0);
    Ok(ResolvedTarget {
        path: join_rel(root, &rel),
        rel,
        warnings,
    })
}

/// Relative paths of files under `root` matching `pattern`, sorted.
pub fn matching_files(root: &Path, pattern: &str, ignore_dirs: &[String]) -> Vec<String> {
    let matcher = WildMatch::new(pattern);
    let mut found: Vec<String> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !(entry.file_type().is_dir()
                    && ignore_dirs
                        .iter()
                        .any(|ignored| entry.file_name() == ignored.as_str()))
        })
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(root).ok()?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            matcher.matches(&rel).then_some(rel)
        })
        .collect();
    found.sort();
    found
}

/// `rel` is a regular file under `root` and no segment on the way is a
/// symlink.
fn is_regular_file_within(root: &Path, rel: &str) -> bool {
    let mut path = root.to_path_buf();
    let mut segments = rel.split('/').peekable();
    while let Some(segment) = segments.next() {
        path.push(segment);
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            return false;
        };
        let last = segments.peek().is_none();
        if meta.file_type().is_symlink() || (last && !meta.is_file()) {
            return false;
        }
    }
    true
}

pub(crate) fn join_rel(root: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .fold(root.to_path_buf(), |path, segment| path.join(segment))
}

//! Theme-token rewriter.
//!
//! Design tokens live as custom properties inside a variable block of a
//! style sheet, `:root { --primary: …; }` for the default scope and
//! `.dark { … }` for the alternate one. The scanner here is brace-aware and
//! skips comments and strings; it does not try to understand CSS beyond
//! that.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::color::{canonical_value, collapse_whitespace};
use super::target::join_rel;
use super::{
    MutationOptions, MutationResult, Mutator, Staged, Warning, WarningCode, finish, indent_at,
    line_ending, read_text,
};
use crate::archive::validate_entry_path;
use crate::atomic::AtomicWriter;
use crate::config::ThemeConfig;
use crate::error::{EngineError, Result};

#[allow(clippy::expect_used)] // literal pattern
static TOKEN_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^--[A-Za-z0-9_-]+$").expect("valid token name regex"));

#[allow(clippy::expect_used)] // literal pattern
static COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid comment regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThemeScope {
    #[default]
    Default,
    /// Alternate mode, usually dark.
    Alternate,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThemeChange {
    /// Style file relative to the root; probed from config when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub scope: ThemeScope,
    /// Token name (with or without the leading `--`) to value.
    pub tokens: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CssBlock {
    /// Selector text with comments removed and whitespace collapsed.
    selector: String,
    open: usize,
    close: usize,
}

impl CssBlock {
    fn matches(&self, selector: &str) -> bool {
        self.selector.split(',').any(|s| s.trim() == selector)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Declaration {
    name: String,
    name_start: usize,
    value: Range<usize>,
    terminated: bool,
}

fn skip_comment(text: &str, at: usize) -> usize {
    text[at + 2..]
        .find("*/")
        .map_or(text.len(), |end| at + 2 + end + 2)
}

fn skip_string(bytes: &[u8], at: usize) -> usize {
    let quote = bytes[at];
    let mut i = at + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn unbalanced(file: &Path) -> EngineError {
    EngineError::invalid_change(format!("{} has unbalanced braces", file.display()))
}

/// Every `{ … }` block in `text`, nested ones included, in source order.
fn scan_blocks(text: &str, file: &Path) -> Result<Vec<CssBlock>> {
    let bytes = text.as_bytes();
    let mut blocks = Vec::new();
    let mut stack: Vec<(String, usize)> = Vec::new();
    let mut segment = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = skip_comment(text, i);
                continue;
            }
            b'"' | b'\'' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'{' => {
                let selector = collapse_whitespace(&COMMENT.replace_all(&text[segment..i], ""));
                stack.push((selector, i));
                segment = i + 1;
            }
            b'}' => {
                let (selector, open) = stack.pop().ok_or_else(|| unbalanced(file))?;
                blocks.push(CssBlock {
                    selector,
                    open,
                    close: i,
                });
                segment = i + 1;
            }
            b';' => segment = i + 1,
            _ => {}
        }
        i += 1;
    }
    if !stack.is_empty() {
        return Err(unbalanced(file));
    }
    blocks.sort_by_key(|b| b.open);
    Ok(blocks)
}

fn skip_trivia(text: &str, mut at: usize, end: usize) -> usize {
    let bytes = text.as_bytes();
    while at < end {
        if bytes[at].is_ascii_whitespace() {
            at += 1;
        } else if text[at..end].starts_with("/*") {
            at = skip_comment(text, at).min(end);
        } else {
            break;
        }
    }
    at
}

fn parse_declaration(text: &str, start: usize, end: usize, terminated: bool) -> Option<Declaration> {
    let name_start = skip_trivia(text, start, end);
    if name_start >= end {
        return None;
    }
    let colon = name_start + text[name_start..end].find(':')?;
    let name = text[name_start..colon].trim().to_string();
    let value_start = colon + 1 + (text[colon + 1..end].len() - text[colon + 1..end].trim_start().len());
    let value_end = colon + 1 + text[colon + 1..end].trim_end().len();
    Some(Declaration {
        name,
        name_start,
        value: value_start..value_end.max(value_start),
        terminated,
    })
}

/// Top-level declarations of `block`.
fn declarations(text: &str, block: &CssBlock) -> Vec<Declaration> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut depth = 0usize;
    let mut segment = block.open + 1;
    let mut i = segment;

    while i < block.close {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = skip_comment(text, i);
                continue;
            }
            b'"' | b'\'' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    segment = i + 1;
                }
            }
            b';' if depth == 0 => {
                found.extend(parse_declaration(text, segment, i, true));
                segment = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if depth == 0 {
        found.extend(parse_declaration(text, segment, block.close, false));
    }
    found
}

/// Normalize and check the requested tokens.
fn requested_tokens(change: &ThemeChange) -> Result<BTreeMap<String, String>> {
    if change.tokens.is_empty() {
        return Err(EngineError::invalid_change("no theme tokens given"));
    }
    let mut tokens = BTreeMap::new();
    for (raw_name, raw_value) in &change.tokens {
        let trimmed = raw_name.trim();
        let name = if trimmed.starts_with("--") {
            trimmed.to_string()
        } else {
            format!("--{trimmed}")
        };
        if !TOKEN_NAME.is_match(&name) {
            return Err(EngineError::invalid_change(format!(
                "'{raw_name}' is not a valid token name"
            )));
        }
        if raw_value.trim().is_empty() || raw_value.contains([';', '{', '}']) {
            return Err(EngineError::invalid_change(format!(
                "value for '{name}' must be non-empty and free of ';', '{{' and '}}'"
            )));
        }
        if tokens.insert(name.clone(), canonical_value(raw_value)).is_some() {
            return Err(EngineError::invalid_change(format!(
                "token '{name}' is given more than once"
            )));
        }
    }
    Ok(tokens)
}

/// Apply `tokens` to the block selected by `selector`.
fn rewrite(
    text: &str,
    file: &Path,
    selector: &str,
    tokens: &BTreeMap<String, String>,
    warnings: &mut Vec<Warning>,
) -> Result<String> {
    let eol = line_ending(text);
    let blocks = scan_blocks(text, file)?;

    let Some(block) = blocks.iter().find(|b| b.matches(selector)) else {
        let mut out = text.to_string();
        if !out.is_empty() {
            if !out.ends_with('\n') {
                out.push_str(eol);
            }
            out.push_str(eol);
        }
        out.push_str(selector);
        out.push_str(" {");
        out.push_str(eol);
        for (name, value) in tokens {
            out.push_str(&format!("  {name}: {value};{eol}"));
        }
        out.push('}');
        out.push_str(eol);
        warnings.push(Warning::new(
            WarningCode::ThemeBlockCreated,
            format!("no '{selector}' block in {}; appended one", file.display()),
        ));
        return Ok(out);
    };

    let declared = declarations(text, block);
    let mut edits: Vec<(Range<usize>, String)> = Vec::new();
    let mut missing: Vec<(&String, &String)> = Vec::new();

    for (name, value) in tokens {
        let occurrences: Vec<&Declaration> = declared.iter().filter(|d| &d.name == name).collect();
        if occurrences.is_empty() {
            missing.push((name, value));
            continue;
        }
        if occurrences.len() > 1 {
            warnings.push(Warning::new(
                WarningCode::DuplicateToken,
                format!(
                    "'{name}' is declared {} times in '{selector}'; updated every occurrence",
                    occurrences.len()
                ),
            ));
        }
        for declaration in occurrences {
            let current = &text[declaration.value.clone()];
            if canonical_value(current) != *value {
                edits.push((declaration.value.clone(), value.clone()));
            }
        }
    }

    if !missing.is_empty() {
        let last = declared.last();
        if let Some(last) = last.filter(|d| !d.terminated) {
            edits.push((last.value.end..last.value.end, ";".to_string()));
        }
        let indent = match last {
            Some(declaration) => indent_at(text, declaration.name_start).to_string(),
            None => format!("{}  ", indent_at(text, block.open)),
        };

        let content_end = block.open
            + 1
            + text[block.open + 1..block.close].trim_end().len();
        let mut insertion = String::new();
        for (name, value) in &missing {
            insertion.push_str(&format!("{eol}{indent}{name}: {value};"));
        }
        if !text[content_end..block.close].contains('\n') {
            insertion.push_str(eol);
            insertion.push_str(indent_at(text, block.close));
        }
        edits.push((content_end..content_end, insertion));
    }

    tracing::debug!(
        file = %file.display(),
        selector,
        edits = edits.len(),
        appended = missing.len(),
        "theme tokens computed"
    );

    // Back to front; at one offset, later edits go in first so earlier ones
    // end up ahead of them.
    let mut ordered: Vec<_> = edits.into_iter().enumerate().collect();
    ordered.sort_by(|(ia, a), (ib, b)| b.0.start.cmp(&a.0.start).then(ib.cmp(ia)));
    let mut out = text.to_string();
    for (_, (range, replacement)) in ordered {
        out.replace_range(range, &replacement);
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct ThemeRewriter {
    candidates: Vec<String>,
    default_selector: String,
    alternate_selector: String,
    writer: AtomicWriter,
}

impl Default for ThemeRewriter {
    fn default() -> Self {
        Self::new(&ThemeConfig::default())
    }
}

impl ThemeRewriter {
    pub fn new(theme: &ThemeConfig) -> Self {
        Self {
            candidates: theme.style_candidates.clone(),
            default_selector: theme.default_selector.clone(),
            alternate_selector: theme.alternate_selector.clone(),
            writer: AtomicWriter::new(),
        }
    }

    pub fn with_writer(mut self, writer: AtomicWriter) -> Self {
        self.writer = writer;
        self
    }

    fn selector(&self, scope: ThemeScope) -> &str {
        match scope {
            ThemeScope::Default => &self.default_selector,
            ThemeScope::Alternate => &self.alternate_selector,
        }
    }

    /// The style file to edit, as `(relative, absolute)`.
    fn style_file(&self, root: &Path, explicit: Option<&str>) -> Result<(String, PathBuf)> {
        if let Some(file) = explicit {
            let rel = validate_entry_path(file)?.ok_or_else(|| EngineError::StyleFileNotFound {
                candidates: vec![file.to_string()],
            })?;
            let path = join_rel(root, &rel);
            return if path.is_file() {
                Ok((rel, path))
            } else {
                Err(EngineError::StyleFileNotFound {
                    candidates: vec![file.to_string()],
                })
            };
        }
        self.candidates
            .iter()
            .map(|rel| (rel.clone(), join_rel(root, rel)))
            .find(|(_, path)| path.is_file())
            .ok_or_else(|| EngineError::StyleFileNotFound {
                candidates: self.candidates.clone(),
            })
    }
}

impl Mutator for ThemeRewriter {
    type Change = ThemeChange;

    fn name(&self) -> &'static str {
        "rewrite_theme"
    }

    fn apply(
        &self,
        root: &Path,
        change: &ThemeChange,
        options: MutationOptions,
    ) -> Result<MutationResult> {
        let started = Instant::now();
        let tokens = requested_tokens(change)?;
        let (rel, path) = self.style_file(root, change.file.as_deref())?;
        let original = read_text(&path)?;
        let mut warnings = Vec::new();
        let updated = rewrite(
            &original,
            Path::new(&rel),
            self.selector(change.scope),
            &tokens,
            &mut warnings,
        )?;

        finish(
            &self.writer,
            vec![Staged {
                rel,
                path,
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
    use std::fs;
    use tempfile::TempDir;

    const GLOBALS: &str = "@tailwind base;\n\n@layer base {\n  :root {\n    /* brand; keep in sync */\n    --background: 0 0% 100%;\n    --primary: 222.2 47.4% 11.2%;\n    --radius: 0.5rem;\n  }\n\n  .dark {\n    --background: 222.2 84% 4.9%;\n    --primary: 210 40% 98%\n  }\n}\n";

    fn file() -> &'static Path {
        Path::new("app/globals.css")
    }

    fn tokens(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        requested_tokens(&ThemeChange {
            tokens: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn finds_nested_blocks_and_skips_comments() {
        let blocks = scan_blocks(GLOBALS, file()).unwrap();
        let selectors: Vec<_> = blocks.iter().map(|b| b.selector.as_str()).collect();
        assert_eq!(selectors, vec!["@layer base", ":root", ".dark"]);

        let names: Vec<_> = declarations(GLOBALS, &blocks[1])
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["--background", "--primary", "--radius"]);
    }

    #[test]
    fn equal_colour_in_another_notation_is_not_a_change() {
        let mut warnings = Vec::new();
        let out = rewrite(
            GLOBALS,
            file(),
            ":root",
            &tokens(&[("primary", "#0f172a"), ("--background", "white")]),
            &mut warnings,
        )
        .unwrap();
        assert_eq!(out, GLOBALS);
        assert!(warnings.is_empty());
    }

    #[test]
    fn updates_in_place_and_appends_missing() {
        let mut warnings = Vec::new();
        let out = rewrite(
            GLOBALS,
            file(),
            ".dark",
            &tokens(&[("primary", "rgb(255, 0, 0)"), ("accent", "hsl(210, 40%, 96.1%)")]),
            &mut warnings,
        )
        .unwrap();
        assert!(out.contains(
            "  .dark {\n    --background: 222.2 84% 4.9%;\n    --primary: 0 100% 50%;\n    --accent: 210 40% 96.1%;\n  }\n"
        ));
        assert!(out.contains("    --primary: 222.2 47.4% 11.2%;\n"));
    }

    #[test]
    fn missing_block_is_created_with_warning() {
        let mut warnings = Vec::new();
        let out = rewrite(
            "body { margin: 0; }",
            file(),
            ":root",
            &tokens(&[("radius", "0.75rem")]),
            &mut warnings,
        )
        .unwrap();
        assert_eq!(out, "body { margin: 0; }\n\n:root {\n  --radius: 0.75rem;\n}\n");
        assert_eq!(warnings[0].code, WarningCode::ThemeBlockCreated);
    }

    #[test]
    fn duplicate_declarations_are_all_updated() {
        let css = ":root { --a: red; --b: 1px; --a: blue; }\n";
        let mut warnings = Vec::new();
        let out = rewrite(css, file(), ":root", &tokens(&[("a", "#00ff00")]), &mut warnings).unwrap();
        assert_eq!(out, ":root { --a: 120 100% 50%; --b: 1px; --a: 120 100% 50%; }\n");
        assert_eq!(warnings[0].code, WarningCode::DuplicateToken);
    }

    #[test]
    fn empty_block_gets_its_first_token() {
        let mut warnings = Vec::new();
        let out = rewrite(":root {}\n", file(), ":root", &tokens(&[("a", "1px")]), &mut warnings).unwrap();
        assert_eq!(out, ":root {\n  --a: 1px;\n}\n");
    }

    #[test]
    fn rejects_values_that_would_break_the_sheet() {
        let err = requested_tokens(&ThemeChange {
            tokens: BTreeMap::from([("a".to_string(), "red; color: blue".to_string())]),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.code().as_str(), "INVALID_CHANGE");
    }

    #[test]
    fn style_file_probe_reports_candidates() {
        let dir = TempDir::new().unwrap();
        let err = ThemeRewriter::default()
            .apply(
                dir.path(),
                &ThemeChange {
                    tokens: BTreeMap::from([("a".to_string(), "1px".to_string())]),
                    ..Default::default()
                },
                MutationOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.code().as_str(), "STYLE_FILE_NOT_FOUND");
        assert_eq!(err.details()["candidates"][0], "app/globals.css");
    }

    #[test]
    fn rewriting_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("app")).unwrap();
        fs::write(dir.path().join("app/globals.css"), GLOBALS).unwrap();
        let rewriter = ThemeRewriter::default();
        let change = ThemeChange {
            file: None,
            scope: ThemeScope::Alternate,
            tokens: BTreeMap::from([
                ("primary".to_string(), "#ff0000".to_string()),
                ("ring".to_string(), "212.7 26.8% 83.9%".to_string()),
            ]),
        };

        let first = rewriter.apply(dir.path(), &change, MutationOptions::default()).unwrap();
        let after_first = fs::read_to_string(dir.path().join("app/globals.css")).unwrap();
        let second = rewriter.apply(dir.path(), &change, MutationOptions::default()).unwrap();

        assert!(first.changed);
        assert_eq!(first.files_written, vec!["app/globals.css"]);
        assert!(!second.changed);
        assert_eq!(
            fs::read_to_string(dir.path().join("app/globals.css")).unwrap(),
            after_first
        );
    }
}

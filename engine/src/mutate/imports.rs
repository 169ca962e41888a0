//! ES module import statements: parse the bindings a file already has and
//! add the one a new element needs.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use super::component::{ImportKind, ImportSpec};
use super::{Warning, WarningCode, indent_at, line_ending};

#[allow(clippy::expect_used)] // literal pattern
static IMPORT_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^[ \t]*import\s+(?P<type>type\s+)?(?P<clause>[^'";]+?)\s+from\s*(?P<quote>["'])(?P<source>[^"'\n]+)["'][ \t]*(?P<semi>;)?"#,
    )
    .expect("valid import regex")
});

#[allow(clippy::expect_used)] // literal pattern
static IMPORT_BARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*import\s*(?P<quote>["'])(?P<source>[^"'\n]+)["'][ \t]*(?P<semi>;)?"#)
        .expect("valid side-effect import regex")
});

#[allow(clippy::expect_used)] // literal pattern
static DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:"use [A-Za-z ]+"|'use [A-Za-z ]+');?\s*$"#).expect("valid directive regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedBinding {
    pub imported: String,
    pub local: String,
    /// `type ` prefix of an inline type-only binding.
    pub type_prefix: Option<Range<usize>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportStatement {
    pub range: Range<usize>,
    pub source: String,
    pub quote: char,
    pub semicolon: bool,
    /// `type ` keyword of an `import type` statement.
    pub type_keyword: Option<Range<usize>>,
    pub default: Option<String>,
    pub namespace: Option<String>,
    pub named: Vec<NamedBinding>,
    /// Offsets of `{` and `}` of the named list.
    pub braces: Option<(usize, usize)>,
    /// Offset where the import clause starts.
    pub clause_start: usize,
}

impl ImportStatement {
    /// Local names this statement brings into scope.
    pub fn locals(&self) -> impl Iterator<Item = &str> {
        self.default
            .iter()
            .chain(self.namespace.iter())
            .map(String::as_str)
            .chain(self.named.iter().map(|n| n.local.as_str()))
    }

    /// Whether `local` is bound as a value rather than only as a type.
    fn binds_value(&self, local: &str) -> bool {
        if self.type_keyword.is_some() {
            return false;
        }
        self.default.as_deref() == Some(local)
            || self.namespace.as_deref() == Some(local)
            || self
                .named
                .iter()
                .any(|n| n.local == local && n.type_prefix.is_none())
    }
}

fn parse_clause(clause: &str, clause_start: usize, statement: &mut ImportStatement) {
    let (head, named) = match (clause.find('{'), clause.rfind('}')) {
        (Some(open), Some(close)) if open < close => {
            statement.braces = Some((clause_start + open, clause_start + close));
            (&clause[..open], Some((&clause[open + 1..close], clause_start + open + 1)))
        }
        _ => (clause, None),
    };

    for part in head.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.strip_prefix('*') {
            Some(rest) => {
                let local = rest.trim().strip_prefix("as").unwrap_or(rest).trim();
                statement.namespace = Some(local.to_string());
            }
            None => statement.default = Some(part.to_string()),
        }
    }

    if let Some((named, base)) = named {
        let mut offset = base;
        for raw in named.split(',') {
            let start = offset + (raw.len() - raw.trim_start().len());
            offset += raw.len() + 1;
            let n = raw.trim();
            if n.is_empty() {
                continue;
            }
            let (type_prefix, n) = match n.strip_prefix("type ") {
                Some(rest) => {
                    let rest = rest.trim_start();
                    let end = start + (n.len() - rest.len());
                    (Some(start..end), rest)
                }
                None => (None, n),
            };
            let (imported, local) = n.split_once(" as ").unwrap_or((n, n));
            statement.named.push(NamedBinding {
                imported: imported.trim().to_string(),
                local: local.trim().to_string(),
                type_prefix,
            });
        }
    }
}

/// Every import statement in `text`, in source order.
pub fn parse_imports(text: &str) -> Vec<ImportStatement> {
    let mut statements: Vec<ImportStatement> = Vec::new();

    for caps in IMPORT_FROM.captures_iter(text) {
        let (Some(whole), Some(clause), Some(quote), Some(source)) = (
            caps.get(0),
            caps.name("clause"),
            caps.name("quote"),
            caps.name("source"),
        ) else {
            continue;
        };
        let mut statement = ImportStatement {
            range: whole.start()..whole.end(),
            source: source.as_str().to_string(),
            quote: if quote.as_str() == "'" { '\'' } else { '"' },
            semicolon: caps.name("semi").is_some(),
            type_keyword: caps.name("type").map(|m| m.range()),
            default: None,
            namespace: None,
            named: Vec::new(),
            braces: None,
            clause_start: clause.start(),
        };
        parse_clause(clause.as_str(), clause.start(), &mut statement);
        statements.push(statement);
    }

    for caps in IMPORT_BARE.captures_iter(text) {
        let (Some(whole), Some(quote), Some(source)) =
            (caps.get(0), caps.name("quote"), caps.name("source"))
        else {
            continue;
        };
        statements.push(ImportStatement {
            range: whole.start()..whole.end(),
            source: source.as_str().to_string(),
            quote: if quote.as_str() == "'" { '\'' } else { '"' },
            semicolon: caps.name("semi").is_some(),
            type_keyword: None,
            default: None,
            namespace: None,
            named: Vec::new(),
            braces: None,
            clause_start: whole.end(),
        });
    }

    statements.sort_by_key(|s| s.range.start);
    statements
}

/// `Foo` for `Foo.Bar`.
pub fn root_binding(symbol: &str) -> &str {
    symbol.split('.').next().unwrap_or(symbol)
}

/// Add `name` to the `{ … }` list spanning `open..=close`.
fn extend_braces(text: &str, open: usize, close: usize, name: &str) -> String {
    let inner = &text[open + 1..close];
    let mut out = text.to_string();
    let Some(last) = inner.trim_end().len().checked_sub(1) else {
        out.replace_range(open + 1..close, &format!(" {name} "));
        return out;
    };
    let last_at = open + 1 + last;
    let trailing_comma = inner.trim_end().ends_with(',');

    if inner.contains('\n') {
        let eol = line_ending(text);
        let indent = indent_at(text, last_at);
        let insertion = if trailing_comma {
            format!("{eol}{indent}{name},")
        } else {
            format!(",{eol}{indent}{name}")
        };
        out.insert_str(last_at + 1, &insertion);
    } else if trailing_comma {
        out.insert_str(last_at + 1, &format!(" {name}"));
    } else {
        out.insert_str(last_at + 1, &format!(", {name}"));
    }
    out
}

fn render_statement(symbol: &str, spec: &ImportSpec, quote: char, semicolon: bool) -> String {
    let clause = match spec.kind {
        ImportKind::Default => symbol.to_string(),
        ImportKind::Named => format!("{{ {symbol} }}"),
    };
    let semi = if semicolon { ";" } else { "" };
    format!("import {clause} from {quote}{}{quote}{semi}", spec.source)
}

/// Turn the type-only binding `local` of `statement` into a value binding.
/// The other bindings of an `import type` statement keep their type-only
/// meaning through inline `type` prefixes.
fn promote_to_value(text: &str, statement: &ImportStatement, local: &str) -> String {
    let mut out = text.to_string();
    if let Some(keyword) = &statement.type_keyword {
        let names = statement.braces.map_or(0, |(open, _)| open);
        let mut prefixes: Vec<usize> = Vec::new();
        let mut cursor = names;
        for named in &statement.named {
            let Some(found) = text[cursor..statement.range.end].find(named.imported.as_str()) else {
                continue;
            };
            cursor += found;
            if named.local != local && named.type_prefix.is_none() {
                prefixes.push(cursor);
            }
            cursor += named.imported.len();
        }
        for at in prefixes.into_iter().rev() {
            out.insert_str(at, "type ");
        }
        out.replace_range(keyword.clone(), "");
        return out;
    }
    if let Some(prefix) = statement
        .named
        .iter()
        .find(|n| n.local == local)
        .and_then(|n| n.type_prefix.clone())
    {
        out.replace_range(prefix, "");
    }
    out
}

/// Make `symbol` available in `text` via `spec`.
pub fn ensure_import(text: &str, symbol: &str, spec: &ImportSpec, warnings: &mut Vec<Warning>) -> String {
    let binding = root_binding(symbol);
    let statements = parse_imports(text);

    if let Some(existing) = statements.iter().find(|s| s.locals().any(|l| l == binding)) {
        if existing.source == spec.source && !existing.binds_value(binding) {
            return promote_to_value(text, existing, binding);
        }
        if existing.source != spec.source {
            warnings.push(Warning::new(
                WarningCode::ImportConflict,
                format!(
                    "'{binding}' is already imported from '{}'; not importing it from '{}'",
                    existing.source, spec.source
                ),
            ));
        }
        return text.to_string();
    }

    let same_source = statements
        .iter()
        .filter(|s| s.source == spec.source && s.type_keyword.is_none() && s.namespace.is_none())
        .find(|s| s.braces.is_some() || s.default.is_some());
    if let Some(statement) = same_source {
        match (spec.kind, statement.braces, statement.default.as_ref()) {
            (ImportKind::Named, Some((open, close)), _) => {
                return extend_braces(text, open, close, binding);
            }
            (ImportKind::Named, None, Some(default)) => {
                let mut out = text.to_string();
                let at = statement.clause_start + default.len();
                out.insert_str(at, &format!(", {{ {binding} }}"));
                return out;
            }
            (ImportKind::Default, Some(_), None) => {
                let mut out = text.to_string();
                out.insert_str(statement.clause_start, &format!("{binding}, "));
                return out;
            }
            _ => {}
        }
    }

    let eol = line_ending(text);
    let (quote, semicolon) = statements
        .first()
        .map_or(('"', true), |s| (s.quote, s.semicolon));
    let statement = render_statement(binding, spec, quote, semicolon);
    let mut out = text.to_string();

    if let Some(last) = statements.last() {
        out.insert_str(last.range.end, &format!("{eol}{statement}"));
        return out;
    }

    let mut offset = 0;
    let mut after_directive = None;
    for line in text.split_inclusive('\n') {
        if DIRECTIVE.is_match(line) {
            after_directive = Some(offset + line.len());
        } else if !line.trim().is_empty() {
            break;
        }
        offset += line.len();
    }
    match after_directive {
        Some(at) if !text[..at].ends_with('\n') => {
            out.insert_str(at, &format!("{eol}{statement}{eol}"));
        }
        Some(at) => out.insert_str(at, &format!("{statement}{eol}")),
        None => out.insert_str(0, &format!("{statement}{eol}")),
    }
    out
}

//! Just enough of a JSX/HTML tag scanner to find anchor elements and
//! measure their extent, plus the deterministic element serializer.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{EngineError, Result};

pub const ANCHOR_ATTRIBUTE: &str = "data-anchor";

#[allow(clippy::expect_used)] // literal pattern
static ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|\s)data-anchor\s*=\s*(?:"([^"]*)"|'([^']*)'|\{\s*"([^"]*)"\s*\})"#)
        .expect("valid anchor regex")
});

#[allow(clippy::expect_used)] // literal pattern
static SYMBOL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*(?:\.[A-Za-z_$][A-Za-z0-9_$]*)*$")
        .expect("valid symbol regex")
});

#[allow(clippy::expect_used)] // literal pattern
static ATTRIBUTE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_:.-]*$").expect("valid attribute key regex")
});

#[allow(clippy::expect_used)] // literal pattern
static ANCHOR_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.:-]+$").expect("valid anchor id regex"));

/// One opening, closing or self-closing tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    /// Offset of `<`.
    pub start: usize,
    /// Offset just past `>`.
    pub end: usize,
    pub closing: bool,
    pub self_closing: bool,
    /// Value of `data-anchor`, if the tag carries one.
    pub anchor: Option<String>,
}

/// An element carrying `data-anchor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorElement {
    pub id: String,
    pub name: String,
    pub start: usize,
    /// Offset just past the element's last byte; `None` when the element
    /// is never closed.
    pub end: Option<usize>,
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b':' | b'-' | b'$')
}

/// Parse a tag starting at `start` (which holds `<`).
fn parse_tag(text: &str, start: usize) -> Option<Tag> {
    let bytes = text.as_bytes();
    let mut i = start + 1;
    let closing = bytes.get(i) == Some(&b'/');
    if closing {
        i += 1;
    }
    if !bytes.get(i).is_some_and(u8::is_ascii_alphabetic) {
        return None;
    }
    let name_start = i;
    while i < bytes.len() && is_name_byte(bytes[i]) {
        i += 1;
    }
    let name = text[name_start..i].to_string();

    let mut braces = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' | b'`' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'{' => braces += 1,
            b'}' => braces = braces.saturating_sub(1),
            b'<' if braces == 0 => return None,
            b'>' if braces == 0 => {
                let self_closing = !closing && text[..i].trim_end().ends_with('/');
                let end = i + 1;
                let anchor = if closing {
                    None
                } else {
                    ANCHOR.captures(&text[name_start..end]).and_then(|c| {
                        c.get(1)
                            .or_else(|| c.get(2))
                            .or_else(|| c.get(3))
                            .map(|m| m.as_str().to_string())
                    })
                };
                return Some(Tag {
                    name,
                    start,
                    end,
                    closing,
                    self_closing,
                    anchor,
                });
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// All tags in `text`, in order.
pub fn scan_tags(text: &str) -> Vec<Tag> {
    let mut tags = Vec::new();
    let mut from = 0;
    while let Some(found) = text[from..].find('<') {
        let start = from + found;
        match parse_tag(text, start) {
            Some(tag) => {
                from = tag.end;
                tags.push(tag);
            }
            None => from = start + 1,
        }
    }
    tags
}

/// End offset of the element opened by `tags[index]`.
pub fn element_end(tags: &[Tag], index: usize) -> Option<usize> {
    let open = tags.get(index)?;
    if open.closing {
        return None;
    }
    if open.self_closing {
        return Some(open.end);
    }
    let mut depth = 1usize;
    for tag in &tags[index + 1..] {
        if tag.name != open.name || tag.self_closing {
            continue;
        }
        if tag.closing {
            depth -= 1;
            if depth == 0 {
                return Some(tag.end);
            }
        } else {
            depth += 1;
        }
    }
    None
}

/// Every anchored element, in source order.
pub fn find_anchors(text: &str) -> Vec<AnchorElement> {
    let tags = scan_tags(text);
    tags.iter()
        .enumerate()
        .filter_map(|(index, tag)| {
            let id = tag.anchor.clone()?;
            Some(AnchorElement {
                id,
                name: tag.name.clone(),
                start: tag.start,
                end: element_end(&tags, index),
            })
        })
        .collect()
}

pub fn validate_symbol(symbol: &str) -> Result<()> {
    if SYMBOL.is_match(symbol) {
        Ok(())
    } else {
        Err(EngineError::invalid_change(format!(
            "'{symbol}' is not a valid element symbol"
        )))
    }
}

/// Object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let fields: Vec<String> = sorted
                .into_iter()
                .map(|(key, value)| {
                    format!("{}:{}", Value::String(key.clone()), canonical_json(value))
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        scalar => scalar.to_string(),
    }
}

fn render_attribute(key: &str, value: &Value) -> String {
    match value {
        Value::String(s) if s.contains('"') => format!("{key}={{{}}}", Value::String(s.clone())),
        Value::String(s) => format!("{key}=\"{s}\""),
        Value::Bool(true) => key.to_string(),
        Value::Bool(false) => format!("{key}={{false}}"),
        other => format!("{key}={{{}}}", canonical_json(other)),
    }
}

/// Serialize a new element: `data-anchor` first, then the attributes in
/// key order.
pub fn render_element(
    symbol: &str,
    id: Option<&str>,
    attributes: &BTreeMap<String, Value>,
    children: Option<&str>,
) -> Result<String> {
    validate_symbol(symbol)?;
    let mut parts = vec![symbol.to_string()];
    if let Some(id) = id {
        if !ANCHOR_ID.is_match(id) {
            return Err(EngineError::invalid_change(format!(
                "'{id}' is not a valid element id"
            )));
        }
        parts.push(format!("{ANCHOR_ATTRIBUTE}=\"{id}\""));
    }
    for (key, value) in attributes {
        if !ATTRIBUTE_KEY.is_match(key) || key == ANCHOR_ATTRIBUTE {
            return Err(EngineError::invalid_change(format!(
                "'{key}' is not an allowed attribute name"
            )));
        }
        parts.push(render_attribute(key, value));
    }

    let open = parts.join(" ");
    Ok(match children {
        Some(children) => format!("<{open}>{children}</{symbol}>"),
        None => format!("<{open} />"),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const PAGE: &str = r#"export default function Page() {
  const ok = items.length > 0 && a < b;
  return (
    <main className="page">
      <section data-anchor="hero" onClick={() => go(1 > 0)}>
        <h1>Title</h1>
        <section>nested</section>
      </section>
      <Divider data-anchor='divider' />
      <Footer data-anchor={"footer"}></Footer>
    </main>
  );
}
"#;

    #[test]
    fn finds_anchors_in_every_quoting_form() {
        let anchors = find_anchors(PAGE);
        let ids: Vec<_> = anchors.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["hero", "divider", "footer"]);
    }

    #[test]
    fn element_extent_follows_nesting() {
        let anchors = find_anchors(PAGE);
        let hero = &anchors[0];
        let body = &PAGE[hero.start..hero.end.unwrap()];
        assert!(body.starts_with("<section data-anchor=\"hero\""));
        assert!(body.ends_with("nested</section>\n      </section>"));

        let divider = &anchors[1];
        assert_eq!(
            &PAGE[divider.start..divider.end.unwrap()],
            "<Divider data-anchor='divider' />"
        );
    }

    #[test]
    fn unclosed_element_has_no_end() {
        let anchors = find_anchors("<div data-anchor=\"x\">\n<p>text</p>\n");
        assert_eq!(anchors[0].end, None);
    }

    #[test]
    fn attributes_serialize_deterministically() {
        let attributes = BTreeMap::from([
            ("title".to_string(), json!("Hello")),
            ("quote".to_string(), json!("say \"hi\"")),
            ("visible".to_string(), json!(true)),
            ("muted".to_string(), json!(false)),
            ("count".to_string(), json!(3)),
            ("style".to_string(), json!({"z": 1, "a": [true, null]})),
        ]);
        let rendered = render_element("Hero", Some("hero-2"), &attributes, None).unwrap();
        assert_eq!(
            rendered,
            r#"<Hero data-anchor="hero-2" count={3} muted={false} quote={"say \"hi\""} style={{"a":[true,null],"z":1}} title="Hello" visible />"#
        );
    }

    #[test]
    fn children_close_the_element() {
        let rendered = render_element("Ui.Badge", None, &BTreeMap::new(), Some("New")).unwrap();
        assert_eq!(rendered, "<Ui.Badge>New</Ui.Badge>");
    }

    #[test]
    fn rejects_bad_symbols_and_keys() {
        assert!(render_element("<script>", None, &BTreeMap::new(), None).is_err());
        let attributes = BTreeMap::from([("on click".to_string(), json!("x"))]);
        assert!(render_element("Hero", None, &attributes, None).is_err());
        let attributes = BTreeMap::from([(ANCHOR_ATTRIBUTE.to_string(), json!("x"))]);
        assert!(render_element("Hero", None, &attributes, None).is_err());
    }
}

//! Ranked selector candidates for a DOM element.
//!
//! | source                                   | score |
//! |------------------------------------------|-------|
//! | `id`                                     | 100   |
//! | `name`                                   | 90    |
//! | `data-testid` / `data-test` / `data-cy`  | 85    |
//! | visible text (a, button, span, div, label) | 70  |
//! | visible text, contains variant           | 65    |
//! | `placeholder`                            | 60    |
//! | `href`                                   | 55    |
//! | `type` other than `text`                 | 50    |
//! | structural CSS path                      | 30    |
//!
//! Output is a stable sort by descending score, so equal scores keep the order
//! of the table. Nothing here is cached: the DOM mutates between events.
//!
//! Attribute values and text are written as CSS strings (`\` and `"` escaped,
//! control characters as hex escapes). Ids are written as CSS identifiers using
//! the `CSS.escape` rules.

use std::fmt::Write as _;

use crate::dom::{Document, NodeId};
use crate::types::{
    ElementSnapshot, SNAPSHOT_TEXT_MAX_CHARS, SelectorCandidate, SelectorKind,
    TEXT_SELECTOR_MAX_CHARS,
};

pub const ID_SCORE: u32 = 100;
pub const NAME_SCORE: u32 = 90;
pub const TEST_ATTRIBUTE_SCORE: u32 = 85;
pub const TEXT_SCORE: u32 = 70;
pub const TEXT_CONTAINS_SCORE: u32 = 65;
pub const PLACEHOLDER_SCORE: u32 = 60;
pub const HREF_SCORE: u32 = 55;
pub const INPUT_TYPE_SCORE: u32 = 50;
pub const CSS_PATH_SCORE: u32 = 30;

const TEST_ATTRIBUTES: [&str; 3] = ["data-testid", "data-test", "data-cy"];
const TEXT_TAGS: [&str; 5] = ["a", "button", "span", "div", "label"];

/// Candidates for `node`, best first. Empty when `node` is not an element.
pub fn generate_candidates(doc: &Document, node: NodeId) -> Vec<SelectorCandidate> {
    let Some(el) = doc.element(node) else {
        return Vec::new();
    };
    let tag = el.tag();
    let mut candidates = Vec::new();
    let mut push = |kind, value: String, score| {
        candidates.push(SelectorCandidate { kind, value, score });
    };

    if let Some(id) = el.non_empty_attribute("id") {
        push(SelectorKind::Id, format!("#{}", escape_css_ident(id)), ID_SCORE);
    }
    if let Some(name) = el.non_empty_attribute("name") {
        push(SelectorKind::Name, attribute_selector("", "name", name), NAME_SCORE);
    }
    for attr in TEST_ATTRIBUTES {
        if let Some(value) = el.non_empty_attribute(attr) {
            push(
                SelectorKind::TestAttribute,
                attribute_selector("", attr, value),
                TEST_ATTRIBUTE_SCORE,
            );
        }
    }
    if TEXT_TAGS.contains(&tag) {
        let text = doc.text_content(node);
        let text: String = text.trim().chars().take(TEXT_SELECTOR_MAX_CHARS).collect();
        if !text.is_empty() {
            let quoted = escape_css_string(&text);
            push(SelectorKind::Text, format!("{tag}:text(\"{quoted}\")"), TEXT_SCORE);
            push(
                SelectorKind::Text,
                format!("{tag}:has-text(\"{quoted}\")"),
                TEXT_CONTAINS_SCORE,
            );
        }
    }
    if let Some(placeholder) = el.non_empty_attribute("placeholder") {
        push(
            SelectorKind::Placeholder,
            attribute_selector("", "placeholder", placeholder),
            PLACEHOLDER_SCORE,
        );
    }
    if let Some(href) = el.non_empty_attribute("href") {
        push(SelectorKind::Href, attribute_selector(tag, "href", href), HREF_SCORE);
    }
    if let Some(kind) = el.non_empty_attribute("type") {
        if !kind.trim().eq_ignore_ascii_case("text") {
            push(
                SelectorKind::InputType,
                attribute_selector(tag, "type", kind),
                INPUT_TYPE_SCORE,
            );
        }
    }
    push(SelectorKind::CssPath, css_path(doc, node), CSS_PATH_SCORE);

    // Vec::sort_by is stable: equal scores keep declaration order.
    candidates.sort_by(|a, b| b.score.cmp(&a.score));
    candidates
}

/// Structural path from the nearest id-pinned ancestor (or the root) down to `node`.
pub fn css_path(doc: &Document, node: NodeId) -> String {
    let mut segments = Vec::new();
    let mut current = Some(node);

    while let Some(at) = current {
        let Some(el) = doc.element(at) else {
            current = doc.parent(at);
            continue;
        };
        if let Some(id) = el.non_empty_attribute("id") {
            segments.push(format!("{}#{}", el.tag(), escape_css_ident(id)));
            break;
        }
        let same_tag_before = doc
            .preceding_element_siblings(at)
            .filter(|&s| doc.element(s).is_some_and(|sib| sib.tag() == el.tag()))
            .count();
        let nth = same_tag_before + 1;
        if nth > 1 {
            segments.push(format!("{}:nth-of-type({nth})", el.tag()));
        } else {
            segments.push(el.tag().to_string());
        }
        current = doc.parent(at);
    }

    segments.reverse();
    segments.join(" > ")
}

/// Everything a Step keeps about its target element.
pub fn capture_snapshot(doc: &Document, node: NodeId) -> Option<ElementSnapshot> {
    let el = doc.element(node)?;
    let attr = |name: &str| el.attribute(name).unwrap_or_default().to_string();
    Some(ElementSnapshot {
        tag: el.tag().to_string(),
        visible_text: doc
            .text_content(node)
            .trim()
            .chars()
            .take(SNAPSHOT_TEXT_MAX_CHARS)
            .collect(),
        id: attr("id"),
        name: attr("name"),
        class_name: attr("class"),
        placeholder: attr("placeholder"),
        href: attr("href"),
        value: el.current_value().to_string(),
        bounding_box: el.rect,
        candidates: generate_candidates(doc, node),
    })
}

fn attribute_selector(tag: &str, attr: &str, value: &str) -> String {
    format!("{tag}[{attr}=\"{}\"]", escape_css_string(value))
}

/// Body of a double-quoted CSS string.
pub fn escape_css_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push('\u{FFFD}'),
            c if c.is_control() => {
                let _ = write!(out, "\\{:x} ", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// CSS identifier escaping, as `CSS.escape` does it.
pub fn escape_css_ident(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let mut out = String::with_capacity(value.len());
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '\0' => out.push('\u{FFFD}'),
            '\u{1}'..='\u{1f}' | '\u{7f}' => {
                let _ = write!(out, "\\{:x} ", c as u32);
            }
            '0'..='9' if i == 0 || (i == 1 && chars[0] == '-') => {
                let _ = write!(out, "\\{:x} ", c as u32);
            }
            '-' if i == 0 && chars.len() == 1 => out.push_str("\\-"),
            c if c >= '\u{80}' || c == '-' || c == '_' || c.is_ascii_alphanumeric() => out.push(c),
            c => {
                out.push('\\');
                out.push(c);
            }
        }
    }
    out
}

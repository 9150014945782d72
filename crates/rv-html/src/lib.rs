//! Markup to element tree.
//!
//! A forgiving tokenizer, not a standards-compliant HTML parser: it keeps the
//! element structure and attributes that link matching needs and drops
//! text, comments and doctype declarations.

use rv_core::RevisitResult;
use rv_dom::Document;
use rv_dom::NodeId;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

/// Elements whose content is text, never markup.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title"];

/// Parses raw HTML into a DOM document.
#[derive(Debug, Default)]
pub struct HtmlParser;

impl HtmlParser {
    pub fn parse(&self, page_url: &str, input: &str) -> RevisitResult<Document> {
        let mut doc = Document::new(page_url);
        let bytes = input.as_bytes();
        let mut open: Vec<NodeId> = vec![doc.root()];
        let mut idx = 0_usize;

        while idx < bytes.len() {
            if bytes[idx] != b'<' {
                idx = find_byte(bytes, idx, b'<').unwrap_or(bytes.len());
                continue;
            }

            if starts_with(bytes, idx, b"<!--") {
                idx = skip_comment(bytes, idx);
                continue;
            }

            if starts_with(bytes, idx, b"<!") {
                idx = skip_to_gt(bytes, idx.saturating_add(2));
                continue;
            }

            if starts_with(bytes, idx, b"<?") {
                idx = skip_processing_instruction(bytes, idx);
                continue;
            }

            let Some((tag, next_idx)) = parse_tag(bytes, idx) else {
                idx = idx.saturating_add(1);
                continue;
            };
            idx = next_idx;

            if tag.is_end {
                close_element(&doc, &mut open, &tag.name);
                continue;
            }

            if tag.name == "html" {
                for (name, value) in &tag.attributes {
                    doc.set_attribute(doc.root(), name, value)?;
                }
                continue;
            }

            let parent = open.last().copied().unwrap_or(doc.root());
            let element = doc.append_element(parent, &tag.name)?;
            for (name, value) in &tag.attributes {
                doc.set_attribute(element, name, value)?;
            }

            if tag.self_closing || VOID_ELEMENTS.contains(&tag.name.as_str()) {
                continue;
            }

            if RAW_TEXT_ELEMENTS.contains(&tag.name.as_str()) {
                idx = skip_raw_text(bytes, idx, &tag.name);
            } else {
                open.push(element);
            }
        }

        Ok(doc)
    }
}

/// Pops open elements up to and including the nearest `name`. Stray end tags
/// are ignored; the root is never popped.
fn close_element(doc: &Document, open: &mut Vec<NodeId>, name: &str) {
    let matching = open.iter().rposition(|id| {
        *id != doc.root()
            && doc
                .element(*id)
                .is_some_and(|element| element.tag() == name)
    });

    if let Some(position) = matching {
        open.truncate(position);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedTag {
    name: String,
    is_end: bool,
    self_closing: bool,
    attributes: Vec<(String, String)>,
}

fn parse_tag(bytes: &[u8], start: usize) -> Option<(ParsedTag, usize)> {
    if bytes.get(start).copied() != Some(b'<') {
        return None;
    }

    let mut idx = start.saturating_add(1);
    let mut is_end = false;
    if bytes.get(idx).copied() == Some(b'/') {
        is_end = true;
        idx = idx.saturating_add(1);
    }

    let name_start = idx;
    while idx < bytes.len() && is_tag_name_char(bytes[idx]) {
        idx = idx.saturating_add(1);
    }

    if idx == name_start {
        return None;
    }

    let name = String::from_utf8_lossy(&bytes[name_start..idx]).to_ascii_lowercase();
    let mut attributes = Vec::new();

    loop {
        idx = skip_spaces(bytes, idx);
        match bytes.get(idx).copied() {
            None => return None,
            Some(b'>') => {
                return Some((
                    ParsedTag {
                        name,
                        is_end,
                        self_closing: false,
                        attributes,
                    },
                    idx.saturating_add(1),
                ));
            }
            Some(b'/') if bytes.get(idx.saturating_add(1)).copied() == Some(b'>') => {
                return Some((
                    ParsedTag {
                        name,
                        is_end,
                        self_closing: true,
                        attributes,
                    },
                    idx.saturating_add(2),
                ));
            }
            Some(b'/') => idx = idx.saturating_add(1),
            Some(_) => {
                let (attribute, next) = parse_attribute(bytes, idx);
                if let Some(attribute) = attribute {
                    attributes.push(attribute);
                }
                idx = next.max(idx.saturating_add(1));
            }
        }
    }
}

fn parse_attribute(bytes: &[u8], start: usize) -> (Option<(String, String)>, usize) {
    let mut idx = start;
    while idx < bytes.len() && !is_attribute_name_end(bytes[idx]) {
        idx = idx.saturating_add(1);
    }

    if idx == start {
        return (None, idx);
    }

    let name = String::from_utf8_lossy(&bytes[start..idx]).to_ascii_lowercase();
    let after_name = skip_spaces(bytes, idx);
    if bytes.get(after_name).copied() != Some(b'=') {
        return (Some((name, String::new())), idx);
    }

    let value_start = skip_spaces(bytes, after_name.saturating_add(1));
    let (raw, next) = match bytes.get(value_start).copied() {
        Some(quote @ (b'"' | b'\'')) => {
            let body = value_start.saturating_add(1);
            let end = find_byte(bytes, body, quote).unwrap_or(bytes.len());
            (&bytes[body..end], end.saturating_add(1).min(bytes.len()))
        }
        _ => {
            let mut end = value_start;
            while end < bytes.len() && !bytes[end].is_ascii_whitespace() && bytes[end] != b'>' {
                end = end.saturating_add(1);
            }
            (&bytes[value_start..end], end)
        }
    };

    let value = decode_entities(&String::from_utf8_lossy(raw));
    (Some((name, value)), next)
}

/// Decodes the character references that commonly appear inside `href`.
fn decode_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_owned();
    }

    const ENTITIES: &[(&str, &str)] = &[
        ("&amp;", "&"),
        ("&quot;", "\""),
        ("&apos;", "'"),
        ("&#39;", "'"),
        ("&lt;", "<"),
        ("&gt;", ">"),
    ];

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(position) = rest.find('&') {
        out.push_str(&rest[..position]);
        rest = &rest[position..];
        match ENTITIES.iter().find(|(entity, _)| rest.starts_with(entity)) {
            Some((entity, replacement)) => {
                out.push_str(replacement);
                rest = &rest[entity.len()..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Index just past the end tag closing a raw-text element.
fn skip_raw_text(bytes: &[u8], start: usize, tag_name: &str) -> usize {
    let tag_bytes = tag_name.as_bytes();
    let mut idx = start;

    while idx < bytes.len() {
        if bytes[idx] == b'<'
            && bytes.get(idx.saturating_add(1)).copied() == Some(b'/')
            && starts_with_ignore_ascii_case(bytes, idx.saturating_add(2), tag_bytes)
            && tag_name_boundary(bytes, idx.saturating_add(2 + tag_bytes.len()))
        {
            if let Some((_, end_idx)) = parse_tag(bytes, idx) {
                return end_idx;
            }
        }

        idx = idx.saturating_add(1);
    }

    bytes.len()
}

fn skip_comment(bytes: &[u8], start: usize) -> usize {
    find_subslice(bytes, start.saturating_add(4), b"-->")
        .map(|end| end.saturating_add(3))
        .unwrap_or(bytes.len())
}

fn skip_processing_instruction(bytes: &[u8], start: usize) -> usize {
    if let Some(end) = find_subslice(bytes, start.saturating_add(2), b"?>") {
        return end.saturating_add(2);
    }

    skip_to_gt(bytes, start.saturating_add(2))
}

fn skip_to_gt(bytes: &[u8], start: usize) -> usize {
    find_byte(bytes, start, b'>')
        .map(|end| end.saturating_add(1))
        .unwrap_or(bytes.len())
}

fn tag_name_boundary(bytes: &[u8], idx: usize) -> bool {
    match bytes.get(idx).copied() {
        None => true,
        Some(byte) => byte.is_ascii_whitespace() || byte == b'>' || byte == b'/',
    }
}

fn skip_spaces(bytes: &[u8], mut idx: usize) -> usize {
    while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
        idx = idx.saturating_add(1);
    }
    idx
}

fn is_tag_name_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b':')
}

fn is_attribute_name_end(byte: u8) -> bool {
    byte.is_ascii_whitespace() || matches!(byte, b'=' | b'>' | b'/')
}

fn starts_with(bytes: &[u8], idx: usize, pattern: &[u8]) -> bool {
    bytes
        .get(idx..idx.saturating_add(pattern.len()))
        .is_some_and(|window| window == pattern)
}

fn starts_with_ignore_ascii_case(bytes: &[u8], idx: usize, pattern: &[u8]) -> bool {
    bytes
        .get(idx..idx.saturating_add(pattern.len()))
        .is_some_and(|window| window.eq_ignore_ascii_case(pattern))
}

fn find_subslice(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }

    bytes[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

fn find_byte(bytes: &[u8], from: usize, byte: u8) -> Option<usize> {
    bytes
        .get(from..)?
        .iter()
        .position(|candidate| *candidate == byte)
        .map(|offset| from + offset)
}

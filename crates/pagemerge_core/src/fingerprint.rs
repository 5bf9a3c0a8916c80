use std::fmt;

use quick_xml::escape::partial_escape;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::markup::{DocumentTree, Node, TextForm};
use crate::textindex::{NodeClass, classify_element};

/// Page property holding the fingerprint of the last published fragment.
pub const FINGERPRINT_PROPERTY_KEY: &str = "foliant_hash";

/// Attributes the editor regenerates on every save.
const VOLATILE_ATTRIBUTES: &[&str] = &["ac:macro-id", "ac:local-id", "local-id", "ac:schema-version"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(title: &str, fragment: &DocumentTree) -> Self {
        let mut input = collapse_whitespace(title);
        input.push('\n');
        input.push_str(&canonical_form(fragment));
        Self(compute_hash(&input))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the stored property value names this fingerprint.
    pub fn matches(&self, stored: Option<&str>) -> bool {
        stored.is_some_and(|value| value.trim() == self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

/// Serialization that ignores attribute order, volatile ids and insignificant whitespace.
///
/// Whitespace inside text collapses to one space. Whitespace-only runs are
/// dropped only when no inline content sits next to them, which covers the
/// indentation between blocks.
pub fn canonical_form(tree: &DocumentTree) -> String {
    let mut out = String::new();
    write_siblings(tree.nodes(), &mut out);
    out
}

fn write_siblings(nodes: &[Node], out: &mut String) {
    for (index, node) in nodes.iter().enumerate() {
        if !is_layout_whitespace(nodes, index) {
            write_canonical(node, out);
        }
    }
}

fn is_layout_whitespace(siblings: &[Node], index: usize) -> bool {
    let Some(Node::Text(run)) = siblings.get(index) else {
        return false;
    };
    if run.form() != TextForm::Plain || !run.text().chars().all(|ch| ch.is_ascii_whitespace()) {
        return false;
    }
    let before = index.checked_sub(1).and_then(|previous| siblings.get(previous));
    let after = siblings.get(index + 1);
    !before.is_some_and(is_inline) && !after.is_some_and(is_inline)
}

fn is_inline(node: &Node) -> bool {
    match node {
        Node::Text(run) => run.contributes_text(),
        Node::Element(element) => matches!(
            classify_element(&element.name),
            NodeClass::Inline | NodeClass::Opaque
        ),
        Node::Marker(marker) => marker.is_comment(),
    }
}

fn write_canonical(node: &Node, out: &mut String) {
    let (name, attributes, children) = match node {
        Node::Text(run) => {
            match run.form() {
                TextForm::Plain | TextForm::CData => {
                    let collapsed = collapse_whitespace(run.text());
                    if run.is_undecoded() {
                        out.push_str(&collapsed);
                    } else {
                        out.push_str(&partial_escape(&collapsed));
                    }
                }
                TextForm::Directive => out.push_str(run.text().trim()),
                TextForm::Comment => {}
            }
            return;
        }
        Node::Element(element) => (&element.name, &element.attributes, &element.children),
        Node::Marker(marker) => (&marker.name, &marker.attributes, &marker.children),
    };

    let mut sorted = attributes
        .iter()
        .filter(|(key, _)| !VOLATILE_ATTRIBUTES.contains(&key.as_str()))
        .collect::<Vec<_>>();
    sorted.sort();

    out.push('<');
    out.push_str(name);
    for (key, value) in sorted {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(value);
        out.push('"');
    }
    out.push('>');
    write_siblings(children, out);
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn collapse_whitespace(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_space = false;
    for ch in value.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(ch);
            in_space = false;
        }
    }
    out
}

fn compute_hash(content: &str) -> String {
    sha256_hex(content.as_bytes())
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

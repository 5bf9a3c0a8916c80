//! In-memory model of Confluence storage markup.
//!
//! Storage markup is an XHTML fragment: any number of top-level nodes, with
//! `ac:`/`ri:` prefixed elements whose namespaces are never declared. The tree
//! keeps enough of the source form (raw text, attribute order, self-closing
//! tags) to serialize untouched subtrees back byte-for-byte.

use std::borrow::Cow;

use quick_xml::Reader;
use quick_xml::escape::{partial_escape, unescape_with};
use quick_xml::events::{BytesStart, Event};
use serde::Serialize;
use tracing::debug;

use crate::error::MergeError;

pub const COMMENT_MARKER_TAG: &str = "ac:inline-comment-marker";
pub const COMMENT_REF_ATTR: &str = "ac:ref";
pub const MACRO_TAG: &str = "ac:structured-macro";
pub const MACRO_NAME_ATTR: &str = "ac:name";
pub const PARAMETER_TAG: &str = "ac:parameter";
pub const ANCHOR_MACRO_NAME: &str = "anchor";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(TextRun),
    Marker(InlineMarker),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    /// Attribute values are kept in their escaped source form.
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
    pub self_closing: bool,
    /// Start tag exactly as parsed, reused on output so untouched nodes keep their bytes.
    pub source_tag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextForm {
    Plain,
    CData,
    Comment,
    /// XML declarations, processing instructions and doctypes, kept verbatim.
    Directive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRun {
    form: TextForm,
    text: String,
    raw: Option<String>,
    /// `text` is still in escaped source form because an entity did not resolve.
    undecoded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorKind {
    Single,
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    Comment,
    Anchor(AnchorKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineMarker {
    pub kind: MarkerKind,
    /// `ac:ref` for comments, the lowercased anchor name for anchors.
    pub ref_id: String,
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
    pub self_closing: bool,
    pub source_tag: Option<String>,
}

/// Position of a node as child indices from the document root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodePath(Vec<usize>);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentTree {
    nodes: Vec<Node>,
}

impl AnchorKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "foliant" => Some(Self::Single),
            "foliant_start" => Some(Self::Start),
            "foliant_end" | "foliant_finish" | "foliant_close" => Some(Self::End),
            _ => None,
        }
    }

    pub fn canonical_name(self) -> &'static str {
        match self {
            Self::Single => "foliant",
            Self::Start => "foliant_start",
            Self::End => "foliant_end",
        }
    }
}

impl TextRun {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            form: TextForm::Plain,
            text: text.into(),
            raw: None,
            undecoded: false,
        }
    }

    pub fn cdata(text: impl Into<String>) -> Self {
        Self {
            form: TextForm::CData,
            text: text.into(),
            raw: None,
            undecoded: false,
        }
    }

    pub fn comment(text: impl Into<String>) -> Self {
        Self {
            form: TextForm::Comment,
            text: text.into(),
            raw: None,
            undecoded: false,
        }
    }

    pub fn directive(text: impl Into<String>) -> Self {
        Self {
            form: TextForm::Directive,
            text: text.into(),
            raw: None,
            undecoded: false,
        }
    }

    fn from_raw(raw: String) -> Self {
        let (text, undecoded) = match unescape_with(&raw, resolve_entity) {
            Ok(decoded) => (decoded.into_owned(), false),
            Err(error) => {
                debug!("keeping text run undecoded: {error}");
                (raw.clone(), true)
            }
        };
        Self {
            form: TextForm::Plain,
            text,
            raw: Some(raw),
            undecoded,
        }
    }

    pub fn form(&self) -> TextForm {
        self.form
    }

    /// Decoded text for plain runs, the literal content for the other forms.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// True when [`TextRun::text`] holds entity references that could not be resolved.
    pub fn is_undecoded(&self) -> bool {
        self.undecoded
    }

    pub fn contributes_text(&self) -> bool {
        matches!(self.form, TextForm::Plain | TextForm::CData)
    }

    /// Split a plain run at a byte offset of its decoded text.
    ///
    /// Undecoded runs keep their source form in both halves and cannot be
    /// split inside an entity reference.
    pub fn split_at(&self, at: usize) -> Option<(TextRun, TextRun)> {
        if self.form != TextForm::Plain || at == 0 || at >= self.text.len() {
            return None;
        }
        if !self.text.is_char_boundary(at) {
            return None;
        }
        let (left, right) = self.text.split_at(at);
        if self.undecoded && inside_reference(left) {
            return None;
        }
        let part = |text: &str| Self {
            form: TextForm::Plain,
            text: text.to_string(),
            raw: None,
            undecoded: self.undecoded,
        };
        Some((part(left), part(right)))
    }

    fn write_to(&self, out: &mut String) {
        match self.form {
            TextForm::Plain => match &self.raw {
                Some(raw) => out.push_str(raw),
                None if self.undecoded => out.push_str(&self.text),
                None => out.push_str(&partial_escape(&self.text)),
            },
            TextForm::CData => {
                out.push_str("<![CDATA[");
                out.push_str(&self.text);
                out.push_str("]]>");
            }
            TextForm::Comment => {
                out.push_str("<!--");
                out.push_str(&self.text);
                out.push_str("-->");
            }
            TextForm::Directive => out.push_str(&self.text),
        }
    }
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            self_closing: false,
            source_tag: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.children = children;
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        find_attribute(&self.attributes, key)
    }

    /// Same tag and attributes, different children. Used when splitting inline formatting.
    pub fn shell(&self, children: Vec<Node>) -> Self {
        Self {
            name: self.name.clone(),
            attributes: self.attributes.clone(),
            children,
            self_closing: false,
            source_tag: None,
        }
    }
}

impl InlineMarker {
    pub fn comment(ref_id: &str, attributes: Vec<(String, String)>, children: Vec<Node>) -> Self {
        let mut attributes = attributes;
        if find_attribute(&attributes, COMMENT_REF_ATTR).is_none() {
            attributes.push((COMMENT_REF_ATTR.to_string(), ref_id.to_string()));
        }
        Self {
            kind: MarkerKind::Comment,
            ref_id: ref_id.to_string(),
            name: COMMENT_MARKER_TAG.to_string(),
            attributes,
            children,
            self_closing: false,
            source_tag: None,
        }
    }

    /// Fresh anchor macro as the wiki editor would insert it.
    pub fn anchor(kind: AnchorKind) -> Self {
        let name = kind.canonical_name();
        let parameter = Element::new(PARAMETER_TAG)
            .with_attribute(MACRO_NAME_ATTR, "")
            .with_children(vec![Node::Text(TextRun::plain(name))]);
        Self {
            kind: MarkerKind::Anchor(kind),
            ref_id: name.to_string(),
            name: MACRO_TAG.to_string(),
            attributes: vec![
                (MACRO_NAME_ATTR.to_string(), ANCHOR_MACRO_NAME.to_string()),
                ("ac:schema-version".to_string(), "1".to_string()),
            ],
            children: vec![Node::Element(parameter)],
            self_closing: false,
            source_tag: None,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        find_attribute(&self.attributes, key)
    }

    pub fn is_comment(&self) -> bool {
        self.kind == MarkerKind::Comment
    }
}

impl Node {
    pub fn children(&self) -> &[Node] {
        match self {
            Node::Element(element) => &element.children,
            Node::Marker(marker) => &marker.children,
            Node::Text(_) => &[],
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Node>> {
        match self {
            Node::Element(element) => Some(&mut element.children),
            Node::Marker(marker) => Some(&mut marker.children),
            Node::Text(_) => None,
        }
    }

    pub fn as_marker(&self) -> Option<&InlineMarker> {
        match self {
            Node::Marker(marker) => Some(marker),
            _ => None,
        }
    }

    /// Concatenated text of all runs below this node, marker boundaries ignored.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.append_text(&mut out);
        out
    }

    fn append_text(&self, out: &mut String) {
        match self {
            Node::Text(run) => {
                if run.contributes_text() {
                    out.push_str(run.text());
                }
            }
            Node::Element(_) | Node::Marker(_) => {
                for child in self.children() {
                    child.append_text(out);
                }
            }
        }
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        write_node(self, &mut out);
        out
    }

    pub fn contains_comment_marker(&self) -> bool {
        self.children().iter().any(|child| {
            matches!(child, Node::Marker(marker) if marker.is_comment())
                || child.contains_comment_marker()
        })
    }
}

impl NodePath {
    pub fn new(indices: Vec<usize>) -> Self {
        Self(indices)
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    /// Index of the top-level node this path lives under.
    pub fn top_level(&self) -> usize {
        self.0.first().copied().unwrap_or(0)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }
}

impl DocumentTree {
    pub fn parse(source: &str) -> Result<Self, MergeError> {
        let mut reader = Reader::from_str(source);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<OpenTag> = Vec::new();
        let mut root: Vec<Node> = Vec::new();
        let mut pending = String::new();

        loop {
            let start = reader.buffer_position() as usize;
            let event = reader.read_event().map_err(|error| {
                MergeError::malformed(reader.error_position(), error.to_string())
            })?;
            let end = reader.buffer_position() as usize;
            let raw = source.get(start..end).ok_or_else(|| {
                MergeError::malformed(start as u64, "event does not fall on a character boundary")
            })?;

            let is_text = matches!(event, Event::Text(_) | Event::GeneralRef(_));
            if !is_text && !pending.is_empty() {
                let run = TextRun::from_raw(std::mem::take(&mut pending));
                append_node(&mut stack, &mut root, Node::Text(run));
            }

            match event {
                Event::Text(_) | Event::GeneralRef(_) => pending.push_str(raw),
                Event::Start(tag) => stack.push(OpenTag::from_start(&tag, raw, start)?),
                Event::Empty(tag) => {
                    let node = OpenTag::from_start(&tag, raw, start)?.finish(true);
                    append_node(&mut stack, &mut root, node);
                }
                Event::End(tag) => {
                    let qname = tag.name();
                    let name = utf8(qname.as_ref(), start)?;
                    let open = stack.pop().ok_or_else(|| {
                        MergeError::malformed(start as u64, format!("unexpected closing tag </{name}>"))
                    })?;
                    if open.name != name {
                        return Err(MergeError::malformed(
                            start as u64,
                            format!("expected </{}>, found </{name}>", open.name),
                        ));
                    }
                    let node = open.finish(false);
                    append_node(&mut stack, &mut root, node);
                }
                Event::CData(_) => {
                    let text = strip_delimiters(raw, "<![CDATA[", "]]>");
                    append_node(&mut stack, &mut root, Node::Text(TextRun::cdata(text)));
                }
                Event::Comment(_) => {
                    let text = strip_delimiters(raw, "<!--", "-->");
                    append_node(&mut stack, &mut root, Node::Text(TextRun::comment(text)));
                }
                Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {
                    append_node(&mut stack, &mut root, Node::Text(TextRun::directive(raw)));
                }
                Event::Eof => break,
            }
        }

        if let Some(open) = stack.last() {
            return Err(MergeError::malformed(
                open.position as u64,
                format!("<{}> is never closed", open.name),
            ));
        }

        Ok(Self { nodes: root })
    }

    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            write_node(node, &mut out);
        }
        out
    }

    pub fn text_content(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            node.append_text(&mut out);
        }
        out
    }

    /// Depth-first, document-order traversal of every node.
    pub fn walk(&self) -> DepthFirst<'_> {
        DepthFirst::new(&self.nodes)
    }

    pub fn get(&self, path: &NodePath) -> Option<&Node> {
        let (last, parents) = path.indices().split_last()?;
        let mut container: &[Node] = &self.nodes;
        for &index in parents {
            container = container.get(index)?.children();
        }
        container.get(*last)
    }

    /// Replace the node at `path` with `replacement`, returning the removed node.
    pub fn replace(&mut self, path: &NodePath, replacement: Vec<Node>) -> Option<Node> {
        let (last, parents) = path.indices().split_last()?;
        let mut container = &mut self.nodes;
        for &index in parents {
            container = container.get_mut(index)?.children_mut()?;
        }
        if *last >= container.len() {
            return None;
        }
        container.splice(*last..*last + 1, replacement).next()
    }

    pub fn find_marker(&self, ref_id: &str) -> Option<NodePath> {
        self.walk()
            .find(|(_, node)| matches!(node, Node::Marker(marker) if marker.ref_id == ref_id))
            .map(|(path, _)| path)
    }

    /// Replace the first marker carrying `ref_id`. Returns false when absent.
    pub fn replace_marker(&mut self, ref_id: &str, replacement: Vec<Node>) -> bool {
        match self.find_marker(ref_id) {
            Some(path) => self.replace(&path, replacement).is_some(),
            None => false,
        }
    }
}

pub struct DepthFirst<'a> {
    stack: Vec<(NodePath, &'a Node)>,
}

impl<'a> DepthFirst<'a> {
    pub fn new(nodes: &'a [Node]) -> Self {
        let stack = nodes
            .iter()
            .enumerate()
            .rev()
            .map(|(index, node)| (NodePath(vec![index]), node))
            .collect();
        Self { stack }
    }
}

impl<'a> Iterator for DepthFirst<'a> {
    type Item = (NodePath, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        let (path, node) = self.stack.pop()?;
        for (index, child) in node.children().iter().enumerate().rev() {
            self.stack.push((path.child(index), child));
        }
        Some((path, node))
    }
}

struct OpenTag {
    name: String,
    source_tag: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
    position: usize,
}

impl OpenTag {
    fn from_start(tag: &BytesStart<'_>, raw: &str, position: usize) -> Result<Self, MergeError> {
        let name = utf8(tag.name().as_ref(), position)?.to_string();
        let mut attributes = Vec::new();
        for attribute in tag.attributes() {
            let attribute = attribute
                .map_err(|error| MergeError::malformed(position as u64, error.to_string()))?;
            let key = utf8(attribute.key.as_ref(), position)?.to_string();
            let value = utf8(&attribute.value, position)?.to_string();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            source_tag: raw.to_string(),
            attributes,
            children: Vec::new(),
            position,
        })
    }

    fn finish(self, self_closing: bool) -> Node {
        classify(Element {
            name: self.name,
            attributes: self.attributes,
            children: self.children,
            self_closing,
            source_tag: Some(self.source_tag),
        })
    }
}

/// Turn comment markers and foliant anchor macros into [`InlineMarker`]s.
fn classify(element: Element) -> Node {
    if element.name == COMMENT_MARKER_TAG
        && let Some(ref_id) = element.attribute(COMMENT_REF_ATTR)
    {
        let ref_id = ref_id.to_string();
        return Node::Marker(InlineMarker {
            kind: MarkerKind::Comment,
            ref_id,
            name: element.name,
            attributes: element.attributes,
            children: element.children,
            self_closing: element.self_closing,
            source_tag: element.source_tag,
        });
    }

    if element.name == MACRO_TAG
        && element.attribute(MACRO_NAME_ATTR) == Some(ANCHOR_MACRO_NAME)
        && let Some(anchor_name) = anchor_parameter(&element)
        && let Some(kind) = AnchorKind::from_name(&anchor_name)
    {
        return Node::Marker(InlineMarker {
            kind: MarkerKind::Anchor(kind),
            ref_id: anchor_name,
            name: element.name,
            attributes: element.attributes,
            children: element.children,
            self_closing: element.self_closing,
            source_tag: element.source_tag,
        });
    }

    Node::Element(element)
}

fn anchor_parameter(element: &Element) -> Option<String> {
    element.children.iter().find_map(|child| match child {
        Node::Element(parameter) if parameter.name == PARAMETER_TAG => {
            let mut text = String::new();
            for node in &parameter.children {
                node.append_text(&mut text);
            }
            Some(text.trim().to_lowercase())
        }
        _ => None,
    })
}

fn append_node(stack: &mut [OpenTag], root: &mut Vec<Node>, node: Node) {
    match stack.last_mut() {
        Some(open) => open.children.push(node),
        None => root.push(node),
    }
}

fn write_node(node: &Node, out: &mut String) {
    match node {
        Node::Text(run) => run.write_to(out),
        Node::Element(element) => write_tag(
            &element.name,
            &element.attributes,
            &element.children,
            element.self_closing,
            element.source_tag.as_deref(),
            out,
        ),
        Node::Marker(marker) => write_tag(
            &marker.name,
            &marker.attributes,
            &marker.children,
            marker.self_closing,
            marker.source_tag.as_deref(),
            out,
        ),
    }
}

fn write_tag(
    name: &str,
    attributes: &[(String, String)],
    children: &[Node],
    self_closing: bool,
    source_tag: Option<&str>,
    out: &mut String,
) {
    let self_closing = self_closing && children.is_empty();
    if let Some(tag) = source_tag.filter(|tag| tag.ends_with("/>") == self_closing) {
        out.push_str(tag);
        if !self_closing {
            write_children(name, children, out);
        }
        return;
    }

    out.push('<');
    out.push_str(name);
    for (key, value) in attributes {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(value);
        out.push('"');
    }
    if self_closing {
        out.push_str("/>");
        return;
    }
    out.push('>');
    write_children(name, children, out);
}

fn write_children(name: &str, children: &[Node], out: &mut String) {
    for child in children {
        write_node(child, out);
    }
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn find_attribute<'a>(attributes: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

fn strip_delimiters<'a>(raw: &'a str, prefix: &str, suffix: &str) -> &'a str {
    raw.strip_prefix(prefix)
        .and_then(|inner| inner.strip_suffix(suffix))
        .unwrap_or(raw)
}

/// True when `head` ends in the middle of an `&name;` reference.
fn inside_reference(head: &str) -> bool {
    head.rfind('&')
        .is_some_and(|amp| !head[amp..].contains(';'))
}

fn utf8(bytes: &[u8], position: usize) -> Result<&str, MergeError> {
    std::str::from_utf8(bytes)
        .map_err(|error| MergeError::malformed(position as u64, format!("invalid UTF-8: {error}")))
}

/// Predefined XML entities plus the HTML ones the wiki editor emits.
fn resolve_entity(name: &str) -> Option<&'static str> {
    let resolved = match name {
        "lt" => "<",
        "gt" => ">",
        "amp" => "&",
        "apos" => "'",
        "quot" => "\"",
        "nbsp" => "\u{a0}",
        "ensp" => "\u{2002}",
        "emsp" => "\u{2003}",
        "thinsp" => "\u{2009}",
        "shy" => "\u{ad}",
        "ndash" => "\u{2013}",
        "mdash" => "\u{2014}",
        "lsquo" => "\u{2018}",
        "rsquo" => "\u{2019}",
        "ldquo" => "\u{201c}",
        "rdquo" => "\u{201d}",
        "laquo" => "\u{ab}",
        "raquo" => "\u{bb}",
        "hellip" => "\u{2026}",
        "bull" => "\u{2022}",
        "middot" => "\u{b7}",
        "times" => "\u{d7}",
        "deg" => "\u{b0}",
        "copy" => "\u{a9}",
        "reg" => "\u{ae}",
        "trade" => "\u{2122}",
        "rarr" => "\u{2192}",
        "larr" => "\u{2190}",
        _ => return None,
    };
    Some(resolved)
}

/// Cow-returning helper used by callers that need decoded attribute values.
pub fn decode_attribute(value: &str) -> Cow<'_, str> {
    unescape_with(value, resolve_entity).unwrap_or(Cow::Borrowed(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = concat!(
        r#"<h1>Intro</h1><p>Hand <strong>written</strong>&nbsp;text &amp; more</p>"#,
        r#"<ac:structured-macro ac:name="anchor" ac:schema-version="1" ac:macro-id="a1">"#,
        r#"<ac:parameter ac:name="">foliant_start</ac:parameter></ac:structured-macro>"#,
        r#"<p>Install <ac:inline-comment-marker ac:ref="c-1">the driver</ac:inline-comment-marker>.</p>"#,
        r#"<br/><ac:structured-macro ac:name="code"><ac:plain-text-body><![CDATA[x < y]]></ac:plain-text-body></ac:structured-macro>"#,
        r#"<ac:structured-macro ac:name="anchor"><ac:parameter ac:name="">Foliant_End</ac:parameter></ac:structured-macro>"#,
    );

    #[test]
    fn parse_and_serialize_round_trips_storage_markup() {
        let tree = DocumentTree::parse(PAGE).expect("parse");
        assert_eq!(tree.serialize(), PAGE);
    }

    #[test]
    fn parse_keeps_attribute_order_and_self_closing_form() {
        let source = r#"<p><img src="a.png" alt="A" width="10"/><br></br></p>"#;
        let tree = DocumentTree::parse(source).expect("parse");
        assert_eq!(tree.serialize(), source);
        let Node::Element(paragraph) = &tree.nodes()[0] else {
            panic!("expected element");
        };
        let Node::Element(image) = &paragraph.children[0] else {
            panic!("expected image");
        };
        assert!(image.self_closing);
        assert_eq!(
            image.attributes,
            vec![
                ("src".to_string(), "a.png".to_string()),
                ("alt".to_string(), "A".to_string()),
                ("width".to_string(), "10".to_string()),
            ]
        );
    }

    #[test]
    fn text_content_decodes_entities_and_ignores_markers() {
        let tree = DocumentTree::parse(PAGE).expect("parse");
        let text = tree.text_content();
        assert!(text.contains("Hand written\u{a0}text & more"));
        assert!(text.contains("Install the driver."));
        assert!(text.contains("x < y"));
    }

    #[test]
    fn parse_classifies_comment_and_anchor_markers() {
        let tree = DocumentTree::parse(PAGE).expect("parse");
        let markers = tree
            .walk()
            .filter_map(|(_, node)| node.as_marker().map(|marker| (marker.kind, marker.ref_id.clone())))
            .collect::<Vec<_>>();
        assert_eq!(
            markers,
            vec![
                (MarkerKind::Anchor(AnchorKind::Start), "foliant_start".to_string()),
                (MarkerKind::Comment, "c-1".to_string()),
                (MarkerKind::Anchor(AnchorKind::End), "foliant_end".to_string()),
            ]
        );
    }

    #[test]
    fn other_anchor_macros_stay_plain_elements() {
        let source = r#"<ac:structured-macro ac:name="anchor"><ac:parameter ac:name="">section-2</ac:parameter></ac:structured-macro>"#;
        let tree = DocumentTree::parse(source).expect("parse");
        assert!(matches!(tree.nodes()[0], Node::Element(_)));
    }

    #[test]
    fn malformed_markup_is_rejected() {
        for source in ["<p>open", "<p><b>x</p></b>", "text</p>"] {
            let error = DocumentTree::parse(source).expect_err("must fail");
            assert!(matches!(error, MergeError::MalformedMarkup { .. }), "{source}");
        }
    }

    #[test]
    fn walk_visits_nodes_in_document_order() {
        let tree = DocumentTree::parse("<p>a<b>b</b></p><p>c</p>").expect("parse");
        let paths = tree
            .walk()
            .map(|(path, _)| path.indices().to_vec())
            .collect::<Vec<_>>();
        assert_eq!(
            paths,
            vec![
                vec![0],
                vec![0, 0],
                vec![0, 1],
                vec![0, 1, 0],
                vec![1],
                vec![1, 0],
            ]
        );
    }

    #[test]
    fn replace_marker_swaps_the_marked_subtree() {
        let mut tree = DocumentTree::parse(
            r#"<p>a <ac:inline-comment-marker ac:ref="x">b</ac:inline-comment-marker> c</p>"#,
        )
        .expect("parse");
        assert!(tree.replace_marker("x", vec![Node::Text(TextRun::plain("B"))]));
        assert_eq!(tree.serialize(), "<p>a B c</p>");
        assert!(!tree.replace_marker("x", Vec::new()));
    }

    #[test]
    fn split_text_is_reescaped_on_serialization() {
        let tree = DocumentTree::parse("<p>a &lt; b</p>").expect("parse");
        let Node::Element(paragraph) = &tree.nodes()[0] else {
            panic!("expected element");
        };
        let Node::Text(run) = &paragraph.children[0] else {
            panic!("expected text");
        };
        let (left, right) = run.split_at(2).expect("split");
        assert_eq!(left.text(), "a ");
        assert_eq!(right.text(), "< b");
        assert_eq!(Node::Text(right).serialize(), "&lt; b");
    }

    #[test]
    fn split_keeps_unknown_entities_in_source_form() {
        let tree = DocumentTree::parse("<p>for caf&eacute; mode</p>").expect("parse");
        let Node::Element(paragraph) = &tree.nodes()[0] else {
            panic!("expected element");
        };
        let Node::Text(run) = &paragraph.children[0] else {
            panic!("expected text");
        };
        assert!(run.is_undecoded());
        let (left, right) = run.split_at(4).expect("split");
        assert_eq!(Node::Text(left).serialize(), "for ");
        assert_eq!(Node::Text(right).serialize(), "caf&eacute; mode");
        assert!(run.split_at(9).is_none(), "split inside &eacute; must be refused");
    }

    #[test]
    fn fresh_anchor_serializes_like_the_editor() {
        let marker = InlineMarker::anchor(AnchorKind::Start);
        assert_eq!(
            Node::Marker(marker).serialize(),
            r#"<ac:structured-macro ac:name="anchor" ac:schema-version="1"><ac:parameter ac:name="">foliant_start</ac:parameter></ac:structured-macro>"#
        );
    }
}

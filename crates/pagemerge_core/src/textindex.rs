//! Plain-text view of a fragment, used to place comment anchors.
//!
//! Only text a reader sees as running prose is indexed. Macro bodies and
//! other `ac:` structures are skipped and act as hard boundaries, so a
//! comment span can never straddle them.

use serde::Serialize;

use crate::markup::{MarkerKind, Node, TextForm};

/// Tags that flow inside a paragraph. Anything else unprefixed is a block.
const INLINE_TAGS: &[&str] = &[
    "a", "abbr", "b", "bdi", "bdo", "br", "cite", "code", "del", "dfn", "em", "font", "i", "ins",
    "kbd", "mark", "q", "s", "samp", "small", "span", "strike", "strong", "sub", "sup", "time", "u",
    "var",
];

/// `ac:` tags that sit inline in text without contributing any of it.
const OPAQUE_TAGS: &[&str] = &["ac:link", "ac:image", "ac:emoticon", "ac:placeholder"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    Inline,
    Block,
    Opaque,
    Excluded,
}

pub fn classify_element(name: &str) -> NodeClass {
    if OPAQUE_TAGS.contains(&name) || name.starts_with("ri:") {
        return NodeClass::Opaque;
    }
    if name.starts_with("ac:") {
        return NodeClass::Excluded;
    }
    let lowered = name.to_ascii_lowercase();
    if INLINE_TAGS.contains(&lowered.as_str()) {
        NodeClass::Inline
    } else {
        NodeClass::Block
    }
}

/// Number of indexed bytes a node contributes.
pub fn indexed_len(node: &Node) -> usize {
    match node {
        Node::Text(run) if run.form() == TextForm::Plain => run.text().len(),
        Node::Text(_) => 0,
        Node::Element(element) => match classify_element(&element.name) {
            NodeClass::Inline | NodeClass::Block => element.children.iter().map(indexed_len).sum(),
            NodeClass::Opaque | NodeClass::Excluded => 0,
        },
        Node::Marker(marker) => match marker.kind {
            MarkerKind::Comment => marker.children.iter().map(indexed_len).sum(),
            MarkerKind::Anchor(_) => 0,
        },
    }
}

/// Text a node contributes to the index, in document order.
pub fn indexed_text(node: &Node) -> String {
    let mut out = String::new();
    append_indexed(node, &mut out);
    out
}

fn append_indexed(node: &Node, out: &mut String) {
    match node {
        Node::Text(run) if run.form() == TextForm::Plain => out.push_str(run.text()),
        Node::Text(_) => {}
        Node::Element(element) => match classify_element(&element.name) {
            NodeClass::Inline | NodeClass::Block => {
                element.children.iter().for_each(|child| append_indexed(child, out));
            }
            NodeClass::Opaque | NodeClass::Excluded => {}
        },
        Node::Marker(marker) => match marker.kind {
            MarkerKind::Comment => marker.children.iter().for_each(|child| append_indexed(child, out)),
            MarkerKind::Anchor(_) => {}
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

impl TextSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &TextSpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    start: usize,
    end: usize,
    block: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TextIndex {
    text: String,
    segments: Vec<Segment>,
}

impl TextIndex {
    pub fn build(nodes: &[Node]) -> Self {
        let mut builder = Builder::default();
        for node in nodes {
            builder.visit(node);
        }
        Self {
            text: builder.text,
            segments: builder.segments,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// A span can carry a comment marker when it starts and ends inside the same block.
    pub fn is_placeable(&self, span: &TextSpan) -> bool {
        if span.is_empty() || span.end > self.text.len() {
            return false;
        }
        match (self.block_at(span.start), self.block_at(span.end - 1)) {
            (Some(first), Some(last)) => first == last,
            _ => false,
        }
    }

    fn block_at(&self, offset: usize) -> Option<usize> {
        let index = self
            .segments
            .partition_point(|segment| segment.end <= offset);
        self.segments
            .get(index)
            .filter(|segment| segment.start <= offset)
            .map(|segment| segment.block)
    }
}

#[derive(Default)]
struct Builder {
    text: String,
    segments: Vec<Segment>,
    block: usize,
}

impl Builder {
    fn visit(&mut self, node: &Node) {
        match node {
            Node::Text(run) => match run.form() {
                TextForm::Plain => self.push_text(run.text()),
                TextForm::CData => self.block += 1,
                TextForm::Comment | TextForm::Directive => {}
            },
            Node::Element(element) => match classify_element(&element.name) {
                NodeClass::Inline => element.children.iter().for_each(|child| self.visit(child)),
                NodeClass::Block => {
                    self.block += 1;
                    element.children.iter().for_each(|child| self.visit(child));
                    self.block += 1;
                }
                NodeClass::Opaque => {}
                NodeClass::Excluded => self.block += 1,
            },
            Node::Marker(marker) => match marker.kind {
                MarkerKind::Comment => marker.children.iter().for_each(|child| self.visit(child)),
                MarkerKind::Anchor(_) => self.block += 1,
            },
        }
    }

    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let start = self.text.len();
        self.text.push_str(text);
        self.segments.push(Segment {
            start,
            end: self.text.len(),
            block: self.block,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::DocumentTree;

    fn index(source: &str) -> TextIndex {
        let tree = DocumentTree::parse(source).expect("parse");
        TextIndex::build(tree.nodes())
    }

    #[test]
    fn macro_bodies_are_not_indexed() {
        let index = index(concat!(
            "<p>Run <code>make</code> then ",
            r#"<ac:link><ri:page ri:content-title="Setup"/></ac:link> again.</p>"#,
            r#"<ac:structured-macro ac:name="info"><ac:rich-text-body><p>hidden</p></ac:rich-text-body></ac:structured-macro>"#,
        ));
        assert_eq!(index.text(), "Run make then  again.");
    }

    #[test]
    fn spans_across_inline_formatting_are_placeable() {
        let index = index("<p>Install <strong>the</strong> driver</p>");
        let start = index.text().find("the driver").expect("find");
        assert!(index.is_placeable(&TextSpan::new(start, start + "the driver".len())));
    }

    #[test]
    fn spans_across_blocks_are_not_placeable() {
        let index = index("<p>first</p><p>second</p>");
        assert_eq!(index.text(), "firstsecond");
        assert!(index.is_placeable(&TextSpan::new(0, 5)));
        assert!(!index.is_placeable(&TextSpan::new(3, 8)));
    }

    #[test]
    fn spans_across_macros_are_not_placeable() {
        let index = index(concat!(
            "<p>before ",
            r#"<ac:structured-macro ac:name="status"><ac:parameter ac:name="title">x</ac:parameter></ac:structured-macro>"#,
            " after</p>",
        ));
        assert_eq!(index.text(), "before  after");
        assert!(!index.is_placeable(&TextSpan::new(0, 13)));
        assert!(index.is_placeable(&TextSpan::new(8, 13)));
    }

    #[test]
    fn indexed_len_matches_index_text() {
        let tree = DocumentTree::parse("<p>a <em>b</em><ac:emoticon ac:name=\"smile\"/></p><ul><li>c</li></ul>")
            .expect("parse");
        let total = tree.nodes().iter().map(indexed_len).sum::<usize>();
        assert_eq!(total, TextIndex::build(tree.nodes()).text().len());
    }

    #[test]
    fn indexed_text_skips_link_bodies() {
        let tree = DocumentTree::parse(concat!(
            r#"<p>the <ac:link><ri:page ri:content-title="Setup"/>"#,
            r#"<ac:plain-text-link-body><![CDATA[setup page]]></ac:plain-text-link-body></ac:link> first</p>"#,
        ))
        .expect("parse");
        assert_eq!(indexed_text(&tree.nodes()[0]), "the  first");
        assert_eq!(tree.text_content(), "the setup page first");
        assert_eq!(
            indexed_text(&tree.nodes()[0]),
            TextIndex::build(tree.nodes()).text()
        );
    }

    #[test]
    fn spans_overlap_only_when_they_share_bytes() {
        let left = TextSpan::new(0, 5);
        assert!(left.overlaps(&TextSpan::new(4, 8)));
        assert!(!left.overlaps(&TextSpan::new(5, 8)));
    }
}

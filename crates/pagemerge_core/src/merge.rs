//! Assembly of the final page body.
//!
//! Comment markers are woven into the rendered fragment first, then the
//! fragment is spliced into the remote tree at the resolved anchor region.
//! Top-level nodes outside that region are moved over untouched.

use serde::Serialize;
use tracing::{debug, warn};

use crate::anchor::{AnchorRegion, AnchorResolution};
use crate::comments::InlineComment;
use crate::error::{CommentMatchFailure, MergeWarning};
use crate::markup::{AnchorKind, DocumentTree, InlineMarker, Node};
use crate::matcher::{MatchOutcome, MatchReport};
use crate::textindex::{NodeClass, TextSpan, classify_element, indexed_len};

/// What the caller must do about each extracted comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CommentOp {
    Relocated { ref_id: String, span: TextSpan },
    Orphaned { ref_id: String },
    Delete { ref_id: String, comment_id: Option<String> },
}

#[derive(Debug, Clone)]
pub struct MergedTree {
    pub tree: DocumentTree,
    pub comment_ops: Vec<CommentOp>,
    pub warnings: Vec<MergeWarning>,
}

pub fn merge_tree(
    remote: &DocumentTree,
    resolution: &AnchorResolution,
    fragment: &DocumentTree,
    comments: &[InlineComment],
    report: &MatchReport,
) -> MergedTree {
    let mut warnings = Vec::new();
    if let Some(warning) = resolution.warning {
        warnings.push(MergeWarning::AnchorAmbiguity(warning));
    }
    warnings.extend(
        report
            .failures
            .iter()
            .cloned()
            .map(MergeWarning::CommentMatchFailure),
    );

    let mut content = fragment.nodes().to_vec();
    let mut comment_ops = Vec::with_capacity(report.matches.len());
    for entry in &report.matches {
        let comment = comments.iter().find(|comment| comment.ref_id == entry.ref_id);
        let op = match entry.outcome {
            MatchOutcome::Relocated { span, .. } => {
                let attributes = comment
                    .map(|comment| comment.marker_attributes.clone())
                    .unwrap_or_default();
                let marker = InlineMarker::comment(&entry.ref_id, attributes, Vec::new());
                match wrap_span(&mut content, span.start, span.end, marker) {
                    Ok(()) => CommentOp::Relocated {
                        ref_id: entry.ref_id.clone(),
                        span,
                    },
                    Err(detail) => {
                        warn!(ref_id = %entry.ref_id, "comment marker not placed: {detail}");
                        warnings.push(MergeWarning::CommentMatchFailure(CommentMatchFailure {
                            ref_id: entry.ref_id.clone(),
                            anchor_text: comment
                                .map(|comment| comment.anchor_text.clone())
                                .unwrap_or_default(),
                            detail: detail.to_string(),
                        }));
                        CommentOp::Orphaned {
                            ref_id: entry.ref_id.clone(),
                        }
                    }
                }
            }
            MatchOutcome::Orphaned => CommentOp::Orphaned {
                ref_id: entry.ref_id.clone(),
            },
            MatchOutcome::Resolve => CommentOp::Delete {
                ref_id: entry.ref_id.clone(),
                comment_id: comment.and_then(|comment| comment.comment_id.clone()),
            },
        };
        comment_ops.push(op);
    }

    let tree = splice(remote, &resolution.region, content);
    MergedTree {
        tree,
        comment_ops,
        warnings,
    }
}

/// Replace the region in `remote` with `content` framed by boundary anchors.
pub fn splice(remote: &DocumentTree, region: &AnchorRegion, content: Vec<Node>) -> DocumentTree {
    let nodes = remote.nodes();
    let range = region.replaced_range(nodes.len());

    let (start_anchor, end_anchor) = match region {
        AnchorRegion::Bounded { start, end }
            if start.depth() == 1 && end.depth() == 1 && start.top_level() != end.top_level() =>
        {
            match (remote.get(start), remote.get(end)) {
                (Some(start), Some(end)) => (start.clone(), end.clone()),
                _ => fresh_boundary(),
            }
        }
        _ => fresh_boundary(),
    };
    debug!(?region, replaced = ?range, "splicing fragment");

    let mut merged = Vec::with_capacity(nodes.len() + content.len() + 2);
    merged.extend(nodes[..range.start].iter().cloned());
    merged.push(start_anchor);
    merged.extend(content);
    merged.push(end_anchor);
    merged.extend(nodes[range.end..].iter().cloned());
    DocumentTree::from_nodes(merged)
}

fn fresh_boundary() -> (Node, Node) {
    (
        Node::Marker(InlineMarker::anchor(AnchorKind::Start)),
        Node::Marker(InlineMarker::anchor(AnchorKind::End)),
    )
}

/// Wrap the indexed text range `start..end` of `nodes` in `marker`.
///
/// Descends into the block or inline element holding the whole range and
/// splits text runs and inline formatting at the edges. Refuses to split
/// anything else.
fn wrap_span(
    nodes: &mut Vec<Node>,
    start: usize,
    end: usize,
    mut marker: InlineMarker,
) -> Result<(), &'static str> {
    let lengths = nodes.iter().map(indexed_len).collect::<Vec<_>>();
    let mut first: Option<(usize, usize)> = None;
    let mut last: Option<(usize, usize)> = None;
    let mut offset = 0;
    for (index, &len) in lengths.iter().enumerate() {
        if len > 0 {
            if first.is_none() && offset + len > start {
                first = Some((index, offset));
            }
            if offset < end {
                last = Some((index, offset));
            }
        }
        offset += len;
    }
    let (Some((mut first, first_offset)), Some((mut last, last_offset))) = (first, last) else {
        return Err("span lies outside the rendered text");
    };
    if first > last || end > offset {
        return Err("span lies outside the rendered text");
    }

    if first == last {
        let inner_start = start - first_offset;
        let inner_end = end - first_offset;
        let covers_node = inner_start == 0 && inner_end == lengths[first];
        match &mut nodes[first] {
            Node::Element(element) => match classify_element(&element.name) {
                NodeClass::Block => {
                    return wrap_span(&mut element.children, inner_start, inner_end, marker);
                }
                NodeClass::Inline if !covers_node => {
                    return wrap_span(&mut element.children, inner_start, inner_end, marker);
                }
                _ => {}
            },
            Node::Marker(existing) if existing.is_comment() && !covers_node => {
                return Err("span falls inside another comment");
            }
            _ => {}
        }
    }

    let end_in_last = end - last_offset;
    if end_in_last < lengths[last] {
        let (left, right) = split_node(&nodes[last], end_in_last)?;
        nodes.splice(last..=last, [left, right]);
    }
    let start_in_first = start - first_offset;
    if start_in_first > 0 {
        let (left, right) = split_node(&nodes[first], start_in_first)?;
        nodes.splice(first..=first, [left, right]);
        first += 1;
        last += 1;
    }

    marker.children = nodes.drain(first..=last).collect();
    nodes.insert(first, Node::Marker(marker));
    Ok(())
}

fn split_node(node: &Node, at: usize) -> Result<(Node, Node), &'static str> {
    match node {
        Node::Text(run) => run
            .split_at(at)
            .map(|(left, right)| (Node::Text(left), Node::Text(right)))
            .ok_or("text run cannot be split there"),
        Node::Element(element) if classify_element(&element.name) == NodeClass::Inline => {
            let (left, right) = split_children(&element.children, at)?;
            Ok((
                Node::Element(element.shell(left)),
                Node::Element(element.shell(right)),
            ))
        }
        Node::Element(_) => Err("span would split a block or macro"),
        Node::Marker(_) => Err("span would split an existing marker"),
    }
}

fn split_children(children: &[Node], at: usize) -> Result<(Vec<Node>, Vec<Node>), &'static str> {
    let mut offset = 0;
    for (index, child) in children.iter().enumerate() {
        let len = indexed_len(child);
        if len > 0 && offset + len > at {
            if offset == at {
                return Ok((children[..index].to_vec(), children[index..].to_vec()));
            }
            let (left, right) = split_node(child, at - offset)?;
            let mut head = children[..index].to_vec();
            head.push(left);
            let mut tail = vec![right];
            tail.extend_from_slice(&children[index + 1..]);
            return Ok((head, tail));
        }
        offset += len;
    }
    Err("split point lies outside the element")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::locate_region;
    use crate::comments::extract_comments;
    use crate::matcher::{MatchPolicy, match_comments};
    use crate::textindex::TextIndex;

    const START: &str = r#"<ac:structured-macro ac:name="anchor" ac:schema-version="1"><ac:parameter ac:name="">foliant_start</ac:parameter></ac:structured-macro>"#;
    const END: &str = r#"<ac:structured-macro ac:name="anchor" ac:schema-version="1"><ac:parameter ac:name="">foliant_end</ac:parameter></ac:structured-macro>"#;

    fn merge(remote: &str, fragment: &str) -> MergedTree {
        let remote = DocumentTree::parse(remote).expect("remote");
        let fragment = DocumentTree::parse(fragment).expect("fragment");
        let resolution = locate_region(&remote);
        let range = resolution.region.replaced_range(remote.nodes().len());
        let comments = extract_comments(&remote.nodes()[range], &[]);
        let report = match_comments(
            &comments,
            &TextIndex::build(fragment.nodes()),
            MatchPolicy::default(),
        );
        merge_tree(&remote, &resolution, &fragment, &comments, &report)
    }

    fn marker(ref_id: &str, text: &str) -> String {
        format!(r#"<ac:inline-comment-marker ac:ref="{ref_id}">{text}</ac:inline-comment-marker>"#)
    }

    #[test]
    fn whole_region_wraps_fragment_in_fresh_anchors() {
        let merged = merge("<p>old</p>", "<p>new</p>");
        assert_eq!(merged.tree.serialize(), format!("{START}<p>new</p>{END}"));
        assert!(merged.warnings.is_empty());
    }

    #[test]
    fn bounded_region_keeps_outside_nodes_byte_identical() {
        let header = r#"<h1 class="a"  id="x">Hand written</h1>"#;
        let footer = r#"<p>Footer <ac:inline-comment-marker ac:ref="keep">note</ac:inline-comment-marker></p><br/>"#;
        let remote = format!("{header}{START}<p>old</p>{END}{footer}");
        let merged = merge(&remote, "<p>new</p>");
        assert_eq!(
            merged.tree.serialize(),
            format!("{header}{START}<p>new</p>{END}{footer}")
        );
        assert!(merged.comment_ops.is_empty());
    }

    #[test]
    fn single_anchor_is_replaced_by_a_bounded_pair() {
        let remote = r#"<p>intro</p><p><ac:structured-macro ac:name="anchor"><ac:parameter ac:name="">foliant</ac:parameter></ac:structured-macro></p><p>outro</p>"#;
        let merged = merge(remote, "<p>generated</p>");
        assert_eq!(
            merged.tree.serialize(),
            format!("<p>intro</p>{START}<p>generated</p>{END}<p>outro</p>")
        );
        let again = locate_region(&merged.tree);
        assert!(matches!(again.region, AnchorRegion::Bounded { .. }));
    }

    #[test]
    fn nested_anchors_take_their_container_with_them() {
        let remote = format!(
            "<p>intro</p><div>{START}<p>old</p></div><p>mid</p><div><p>x</p>{END}</div><p>outro</p>"
        );
        let merged = merge(&remote, "<p>new</p>");
        assert_eq!(
            merged.tree.serialize(),
            format!("<p>intro</p>{START}<p>new</p>{END}<p>outro</p>")
        );
    }

    #[test]
    fn relocated_comment_is_wrapped_with_original_reference() {
        let remote = format!("{START}<p>{}</p>{END}", marker("c1", "Install the driver"));
        let merged = merge(&remote, "<p>Please install the driver now.</p>");
        assert_eq!(
            merged.tree.serialize(),
            format!(
                "{START}<p>Please {} now.</p>{END}",
                marker("c1", "install the driver")
            )
        );
        assert!(matches!(
            &merged.comment_ops[0],
            CommentOp::Relocated { ref_id, .. } if ref_id == "c1"
        ));
    }

    #[test]
    fn marker_splits_inline_formatting_at_the_edges() {
        let remote = format!("{START}<p>{}</p>{END}", marker("c1", "driver now"));
        let merged = merge(&remote, "<p>Get <b>the driver</b> now, please.</p>");
        assert_eq!(
            merged.tree.serialize(),
            format!(
                "{START}<p>Get <b>the </b>{}, please.</p>{END}",
                marker("c1", "<b>driver</b> now")
            )
        );
    }

    #[test]
    fn marker_inside_inline_element_stays_inside() {
        let remote = format!("{START}<p>{}</p>{END}", marker("c1", "driver"));
        let merged = merge(&remote, "<p>Get <b>the driver</b></p>");
        assert_eq!(
            merged.tree.serialize(),
            format!("{START}<p>Get <b>the {}</b></p>{END}", marker("c1", "driver"))
        );
    }

    #[test]
    fn splitting_text_with_unknown_entities_keeps_them_intact() {
        let remote = format!("{START}<p>{}</p>{END}", marker("c1", "Install the driver"));
        let merged = merge(&remote, "<p>Install the driver for caf&eacute; mode</p>");
        assert_eq!(
            merged.tree.serialize(),
            format!(
                "{START}<p>{} for caf&eacute; mode</p>{END}",
                marker("c1", "Install the driver")
            )
        );
    }

    #[test]
    fn comment_spanning_a_link_is_relocated_around_it() {
        let link = concat!(
            r#"<ac:link><ri:page ri:content-title="Setup"/>"#,
            r#"<ac:plain-text-link-body><![CDATA[setup page]]></ac:plain-text-link-body></ac:link>"#,
        );
        let remote = format!(
            "{START}<p>Read {}.</p>{END}",
            marker("c1", &format!("the {link} first"))
        );
        let merged = merge(&remote, &format!("<p>Always read the {link} first.</p>"));
        assert_eq!(
            merged.tree.serialize(),
            format!(
                "{START}<p>Always read {}.</p>{END}",
                marker("c1", &format!("the {link} first"))
            )
        );
        assert!(matches!(
            &merged.comment_ops[0],
            CommentOp::Relocated { ref_id, .. } if ref_id == "c1"
        ));
    }

    #[test]
    fn duplicate_comment_on_single_occurrence_is_orphaned() {
        let remote = format!(
            "{START}<p>{} and {}</p>{END}",
            marker("first", "click OK"),
            marker("second", "click OK")
        );
        let merged = merge(&remote, "<p>Then click OK.</p>");
        assert_eq!(
            merged.comment_ops,
            vec![
                CommentOp::Relocated {
                    ref_id: "first".to_string(),
                    span: TextSpan::new(5, 13),
                },
                CommentOp::Orphaned {
                    ref_id: "second".to_string()
                },
            ]
        );
        assert_eq!(merged.warnings.len(), 1);
    }

    #[test]
    fn reversed_anchors_replace_whole_body_with_warning() {
        let remote = format!("{END}<p>body</p>{START}");
        let merged = merge(&remote, "<p>new</p>");
        assert_eq!(merged.tree.serialize(), format!("{START}<p>new</p>{END}"));
        assert!(matches!(
            merged.warnings.as_slice(),
            [MergeWarning::AnchorAmbiguity(_)]
        ));
    }

    #[test]
    fn comments_outside_the_region_are_not_extracted() {
        let remote = format!(
            "<p>{}</p>{START}<p>old</p>{END}",
            marker("outside", "hand text")
        );
        let merged = merge(&remote, "<p>hand text</p>");
        assert!(merged.comment_ops.is_empty());
    }
}

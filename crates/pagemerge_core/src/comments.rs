use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::markup::{DepthFirst, Node};
use crate::textindex::indexed_text;

/// Comment details reported by the wiki for one marker reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentMetadata {
    pub ref_id: String,
    #[serde(default)]
    pub comment_id: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineComment {
    pub ref_id: String,
    pub anchor_text: String,
    pub author: Option<String>,
    pub body: Option<String>,
    pub comment_id: Option<String>,
    /// Position of the first marker piece among extracted comments.
    pub order: usize,
    #[serde(skip)]
    pub marker_attributes: Vec<(String, String)>,
}

/// Collect open inline comments from `nodes` in document order.
///
/// Pieces of one comment split across formatting are joined. A marker that
/// wraps other markers is the outline of a resolved comment and is skipped.
pub fn extract_comments(nodes: &[Node], metadata: &[CommentMetadata]) -> Vec<InlineComment> {
    let by_ref = metadata
        .iter()
        .map(|entry| (entry.ref_id.as_str(), entry))
        .collect::<HashMap<_, _>>();

    let mut comments: Vec<InlineComment> = Vec::new();
    // None marks a resolved comment whose later pieces are ignored too.
    let mut positions: HashMap<String, Option<usize>> = HashMap::new();

    for (_, node) in DepthFirst::new(nodes) {
        let Node::Marker(marker) = node else {
            continue;
        };
        if !marker.is_comment() {
            continue;
        }
        if node.contains_comment_marker() {
            debug!(ref_id = %marker.ref_id, "skipping outline of resolved comment");
            continue;
        }

        let text = indexed_text(node);
        if let Some(&position) = positions.get(&marker.ref_id) {
            if let Some(comment) = position.and_then(|index| comments.get_mut(index)) {
                comment.anchor_text.push_str(&text);
            }
            continue;
        }

        let details = by_ref.get(marker.ref_id.as_str());
        if details.is_some_and(|entry| entry.resolved) {
            debug!(ref_id = %marker.ref_id, "resolved comment is not carried over");
            positions.insert(marker.ref_id.clone(), None);
            continue;
        }
        if details.is_none() {
            debug!(ref_id = %marker.ref_id, "no metadata for comment marker");
        }

        positions.insert(marker.ref_id.clone(), Some(comments.len()));
        comments.push(InlineComment {
            ref_id: marker.ref_id.clone(),
            anchor_text: text,
            author: details.and_then(|entry| entry.author.clone()),
            body: details.and_then(|entry| entry.body.clone()),
            comment_id: details.and_then(|entry| entry.comment_id.clone()),
            order: comments.len(),
            marker_attributes: marker.attributes.clone(),
        });
    }

    comments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::DocumentTree;

    fn metadata(ref_id: &str, resolved: bool) -> CommentMetadata {
        CommentMetadata {
            ref_id: ref_id.to_string(),
            comment_id: Some(format!("id-{ref_id}")),
            author: Some("reviewer".to_string()),
            body: Some("please check".to_string()),
            resolved,
        }
    }

    fn extract(source: &str, metadata: &[CommentMetadata]) -> Vec<InlineComment> {
        let tree = DocumentTree::parse(source).expect("parse");
        extract_comments(tree.nodes(), metadata)
    }

    #[test]
    fn extracts_comments_in_document_order_with_metadata() {
        let comments = extract(
            concat!(
                r#"<p><ac:inline-comment-marker ac:ref="b">click OK</ac:inline-comment-marker> then "#,
                r#"<ac:inline-comment-marker ac:ref="a">click OK</ac:inline-comment-marker></p>"#,
            ),
            &[metadata("a", false), metadata("b", false)],
        );
        let summary = comments
            .iter()
            .map(|comment| (comment.ref_id.as_str(), comment.anchor_text.as_str(), comment.order))
            .collect::<Vec<_>>();
        assert_eq!(summary, vec![("b", "click OK", 0), ("a", "click OK", 1)]);
        assert_eq!(comments[0].comment_id.as_deref(), Some("id-b"));
        assert_eq!(comments[0].author.as_deref(), Some("reviewer"));
    }

    #[test]
    fn resolved_comments_are_excluded() {
        let comments = extract(
            r#"<p><ac:inline-comment-marker ac:ref="a">one</ac:inline-comment-marker> <ac:inline-comment-marker ac:ref="b">two</ac:inline-comment-marker></p>"#,
            &[metadata("a", true), metadata("b", false)],
        );
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].ref_id, "b");
        assert_eq!(comments[0].order, 0);
    }

    #[test]
    fn split_marker_pieces_are_joined() {
        let comments = extract(
            concat!(
                r#"<p><ac:inline-comment-marker ac:ref="a">Install </ac:inline-comment-marker>"#,
                r#"<strong><ac:inline-comment-marker ac:ref="a">the driver</ac:inline-comment-marker></strong></p>"#,
            ),
            &[],
        );
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].anchor_text, "Install the driver");
        assert_eq!(comments[0].author, None);
    }

    #[test]
    fn anchor_text_leaves_out_link_bodies_and_macros() {
        let comments = extract(
            concat!(
                r#"<p><ac:inline-comment-marker ac:ref="a">read the <ac:link><ri:page ri:content-title="Setup"/>"#,
                r#"<ac:plain-text-link-body><![CDATA[setup page]]></ac:plain-text-link-body></ac:link>"#,
                r#" first</ac:inline-comment-marker></p>"#,
            ),
            &[],
        );
        assert_eq!(comments[0].anchor_text, "read the  first");
    }

    #[test]
    fn outline_markers_wrapping_other_comments_are_skipped() {
        let comments = extract(
            concat!(
                r#"<p><ac:inline-comment-marker ac:ref="outer">see "#,
                r#"<ac:inline-comment-marker ac:ref="inner">this</ac:inline-comment-marker>"#,
                r#"</ac:inline-comment-marker></p>"#,
            ),
            &[],
        );
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].ref_id, "inner");
        assert_eq!(comments[0].anchor_text, "this");
    }
}

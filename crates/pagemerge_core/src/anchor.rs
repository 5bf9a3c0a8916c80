use std::ops::Range;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{AmbiguityReason, AnchorAmbiguityWarning};
use crate::markup::{AnchorKind, DocumentTree, MarkerKind, Node, NodePath};

/// Where the rendered fragment goes on the remote page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnchorRegion {
    Whole,
    Single { path: NodePath },
    Bounded { start: NodePath, end: NodePath },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnchorResolution {
    pub region: AnchorRegion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<AnchorAmbiguityWarning>,
}

impl AnchorRegion {
    /// Top-level node range the splice replaces. Anchors nested in containers
    /// take their whole top-level ancestor with them.
    pub fn replaced_range(&self, top_level_len: usize) -> Range<usize> {
        let range = match self {
            Self::Whole => 0..top_level_len,
            Self::Single { path } => path.top_level()..path.top_level() + 1,
            Self::Bounded { start, end } => start.top_level()..end.top_level() + 1,
        };
        range.start.min(top_level_len)..range.end.min(top_level_len)
    }
}

pub fn locate_region(tree: &DocumentTree) -> AnchorResolution {
    let mut singles = Vec::new();
    let mut starts = Vec::new();
    let mut ends = Vec::new();
    for (path, node) in tree.walk() {
        if let Node::Marker(marker) = node
            && let MarkerKind::Anchor(kind) = marker.kind
        {
            match kind {
                AnchorKind::Single => singles.push(path),
                AnchorKind::Start => starts.push(path),
                AnchorKind::End => ends.push(path),
            }
        }
    }

    let outcome = match (singles.len(), starts.len(), ends.len()) {
        (0, 0, 0) => {
            debug!("no foliant anchors on page; replacing whole body");
            return AnchorResolution {
                region: AnchorRegion::Whole,
                warning: None,
            };
        }
        (1, 0, 0) => Ok(AnchorRegion::Single {
            path: singles.remove(0),
        }),
        (count, 0, 0) => Err(AmbiguityReason::DuplicateSingle { count }),
        (0, 1, 1) => {
            let start = starts.remove(0);
            let end = ends.remove(0);
            if start < end {
                Ok(AnchorRegion::Bounded { start, end })
            } else {
                Err(AmbiguityReason::ReversedOrder)
            }
        }
        (0, 0, _) => Err(AmbiguityReason::MissingStart),
        (0, _, 0) => Err(AmbiguityReason::MissingEnd),
        (0, starts, ends) => Err(AmbiguityReason::DuplicatePair { starts, ends }),
        _ => Err(AmbiguityReason::MixedSingleAndPair),
    };

    match outcome {
        Ok(region) => {
            debug!(?region, "resolved foliant anchor region");
            AnchorResolution {
                region,
                warning: None,
            }
        }
        Err(reason) => {
            let warning = AnchorAmbiguityWarning { reason };
            warn!("{warning}; replacing whole body");
            AnchorResolution {
                region: AnchorRegion::Whole,
                warning: Some(warning),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(name: &str) -> String {
        format!(
            r#"<ac:structured-macro ac:name="anchor"><ac:parameter ac:name="">{name}</ac:parameter></ac:structured-macro>"#
        )
    }

    fn resolve(source: &str) -> AnchorResolution {
        locate_region(&DocumentTree::parse(source).expect("parse"))
    }

    #[test]
    fn page_without_anchors_resolves_whole_without_warning() {
        let resolution = resolve("<p>hand written</p>");
        assert_eq!(resolution.region, AnchorRegion::Whole);
        assert_eq!(resolution.warning, None);
    }

    #[test]
    fn single_anchor_resolves_single() {
        let resolution = resolve(&format!("<p>intro</p><p>{}</p>", anchor("Foliant")));
        assert_eq!(
            resolution.region,
            AnchorRegion::Single {
                path: NodePath::new(vec![1, 0])
            }
        );
        assert_eq!(resolution.region.replaced_range(2), 1..2);
    }

    #[test]
    fn start_end_pair_resolves_bounded() {
        let source = format!(
            "<h1>Title</h1>{}<p>old</p><p>{}</p><p>footer</p>",
            anchor("foliant_start"),
            anchor("foliant_finish")
        );
        let resolution = resolve(&source);
        assert_eq!(
            resolution.region,
            AnchorRegion::Bounded {
                start: NodePath::new(vec![1]),
                end: NodePath::new(vec![3, 0]),
            }
        );
        assert_eq!(resolution.region.replaced_range(5), 1..4);
        assert_eq!(resolution.warning, None);
    }

    #[test]
    fn reversed_pair_falls_back_to_whole_with_warning() {
        let source = format!("{}<p>x</p>{}", anchor("foliant_end"), anchor("foliant_start"));
        let resolution = resolve(&source);
        assert_eq!(resolution.region, AnchorRegion::Whole);
        assert_eq!(
            resolution.warning.map(|warning| warning.reason),
            Some(AmbiguityReason::ReversedOrder)
        );
    }

    #[test]
    fn invalid_combinations_fall_back_to_whole() {
        let cases = [
            (
                format!("{}{}", anchor("foliant"), anchor("foliant_start")),
                AmbiguityReason::MixedSingleAndPair,
            ),
            (
                format!("{}{}", anchor("foliant"), anchor("foliant")),
                AmbiguityReason::DuplicateSingle { count: 2 },
            ),
            (anchor("foliant_end"), AmbiguityReason::MissingStart),
            (anchor("foliant_start"), AmbiguityReason::MissingEnd),
            (
                format!(
                    "{}{}{}",
                    anchor("foliant_start"),
                    anchor("foliant_start"),
                    anchor("foliant_end")
                ),
                AmbiguityReason::DuplicatePair { starts: 2, ends: 1 },
            ),
        ];
        for (source, expected) in cases {
            let resolution = resolve(&source);
            assert_eq!(resolution.region, AnchorRegion::Whole, "{source}");
            assert_eq!(resolution.warning.map(|warning| warning.reason), Some(expected));
        }
    }
}

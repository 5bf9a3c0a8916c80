//! Relocation of existing inline comments into freshly rendered text.
//!
//! Comments are matched one at a time in their original document order. Each
//! takes the leftmost free occurrence of its anchor text, first verbatim and
//! then under normalization, and claims it so later comments skip it.

use serde::Serialize;
use tracing::{debug, warn};

use crate::comments::InlineComment;
use crate::error::CommentMatchFailure;
use crate::textindex::{TextIndex, TextSpan};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchPolicy {
    /// Delete comments whose text disappeared instead of leaving them orphaned.
    pub resolve_if_changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    Normalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Relocated {
        span: TextSpan,
        strategy: MatchStrategy,
    },
    Orphaned,
    Resolve,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentMatch {
    pub ref_id: String,
    #[serde(flatten)]
    pub outcome: MatchOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchReport {
    pub matches: Vec<CommentMatch>,
    pub failures: Vec<CommentMatchFailure>,
}

/// Spans already taken during one matching pass, kept sorted by start.
#[derive(Debug, Clone, Default)]
pub struct ClaimSet {
    spans: Vec<TextSpan>,
}

impl ClaimSet {
    pub fn is_free(&self, span: &TextSpan) -> bool {
        let index = self.spans.partition_point(|claimed| claimed.end <= span.start);
        self.spans
            .get(index)
            .is_none_or(|claimed| !claimed.overlaps(span))
    }

    pub fn claim(&mut self, span: TextSpan) {
        let index = self.spans.partition_point(|claimed| claimed.start < span.start);
        self.spans.insert(index, span);
    }

    pub fn spans(&self) -> &[TextSpan] {
        &self.spans
    }
}

pub fn match_comments(
    comments: &[InlineComment],
    index: &TextIndex,
    policy: MatchPolicy,
) -> MatchReport {
    let mut ordered = comments.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|comment| comment.order);

    let normalized = NormalizedText::new(index.text());
    let mut claims = ClaimSet::default();
    let mut report = MatchReport::default();

    for comment in ordered {
        let result = locate(comment, index, &normalized, &claims);
        let outcome = match result {
            Ok((span, strategy)) => {
                debug!(ref_id = %comment.ref_id, ?strategy, start = span.start, end = span.end, "relocated comment");
                claims.claim(span);
                MatchOutcome::Relocated { span, strategy }
            }
            Err(detail) => {
                warn!(
                    ref_id = %comment.ref_id,
                    anchor = %comment.anchor_text,
                    "comment not relocated: {detail}"
                );
                report.failures.push(CommentMatchFailure {
                    ref_id: comment.ref_id.clone(),
                    anchor_text: comment.anchor_text.clone(),
                    detail: detail.to_string(),
                });
                if policy.resolve_if_changed {
                    MatchOutcome::Resolve
                } else {
                    MatchOutcome::Orphaned
                }
            }
        };
        report.matches.push(CommentMatch {
            ref_id: comment.ref_id.clone(),
            outcome,
        });
    }

    report
}

fn locate(
    comment: &InlineComment,
    index: &TextIndex,
    normalized: &NormalizedText,
    claims: &ClaimSet,
) -> Result<(TextSpan, MatchStrategy), &'static str> {
    if comment.anchor_text.trim().is_empty() {
        return Err("anchor text is empty");
    }
    if index.is_empty() {
        return Err("new content has no text");
    }
    if let Some(span) = find_exact(index, &comment.anchor_text, claims) {
        return Ok((span, MatchStrategy::Exact));
    }
    let needle = NormalizedText::new(&comment.anchor_text);
    let needle = needle.text.trim();
    if needle.is_empty() {
        return Err("anchor text has no comparable characters");
    }
    match normalized.find(needle, index, claims) {
        Some(span) => Ok((span, MatchStrategy::Normalized)),
        None => Err("anchor text no longer occurs in an unclaimed position"),
    }
}

fn find_exact(index: &TextIndex, needle: &str, claims: &ClaimSet) -> Option<TextSpan> {
    let haystack = index.text();
    let mut from = 0;
    while let Some(offset) = haystack.get(from..).and_then(|rest| rest.find(needle)) {
        let start = from + offset;
        let span = TextSpan::new(start, start + needle.len());
        if claims.is_free(&span) && index.is_placeable(&span) {
            return Some(span);
        }
        from = start + next_char_len(haystack, start);
    }
    None
}

fn next_char_len(text: &str, at: usize) -> usize {
    text.get(at..)
        .and_then(|rest| rest.chars().next())
        .map_or(1, char::len_utf8)
}

/// Lowercased text with whitespace collapsed and punctuation dropped, mapped
/// back char by char to byte ranges of the source text.
struct NormalizedText {
    text: String,
    starts: Vec<usize>,
    origins: Vec<(usize, usize)>,
}

impl NormalizedText {
    fn new(source: &str) -> Self {
        let mut normalized = Self {
            text: String::with_capacity(source.len()),
            starts: Vec::new(),
            origins: Vec::new(),
        };
        let mut last_was_space = true;
        for (offset, ch) in source.char_indices() {
            let origin = (offset, offset + ch.len_utf8());
            if ch.is_whitespace() {
                if !last_was_space {
                    normalized.push(' ', origin);
                    last_was_space = true;
                }
            } else if is_punctuation(ch) {
                continue;
            } else {
                for lowered in ch.to_lowercase() {
                    normalized.push(lowered, origin);
                }
                last_was_space = false;
            }
        }
        normalized
    }

    fn push(&mut self, ch: char, origin: (usize, usize)) {
        self.starts.push(self.text.len());
        self.origins.push(origin);
        self.text.push(ch);
    }

    fn find(&self, needle: &str, index: &TextIndex, claims: &ClaimSet) -> Option<TextSpan> {
        let mut from = 0;
        while let Some(offset) = self.text.get(from..).and_then(|rest| rest.find(needle)) {
            let start = from + offset;
            if let Some(span) = self.source_span(start, start + needle.len())
                && claims.is_free(&span)
                && index.is_placeable(&span)
            {
                return Some(span);
            }
            from = start + next_char_len(&self.text, start);
        }
        None
    }

    fn source_span(&self, start: usize, end: usize) -> Option<TextSpan> {
        let first = self.starts.binary_search(&start).ok()?;
        let last = self.starts.partition_point(|&offset| offset < end).checked_sub(1)?;
        let (source_start, _) = *self.origins.get(first)?;
        let (_, source_end) = *self.origins.get(last)?;
        Some(TextSpan::new(source_start, source_end))
    }
}

fn is_punctuation(ch: char) -> bool {
    ch.is_ascii_punctuation()
        || matches!(
            ch,
            '\u{a1}' | '\u{ab}' | '\u{b7}' | '\u{bb}' | '\u{bf}' | '\u{2010}'..='\u{2027}' | '\u{2030}'..='\u{205e}'
        )
}

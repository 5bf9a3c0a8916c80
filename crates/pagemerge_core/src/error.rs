use std::fmt;

use serde::Serialize;

/// Fatal merge failures. A page that hits one of these is not published.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("malformed storage markup at byte {position}: {message}")]
    MalformedMarkup { position: u64, message: String },
}

impl MergeError {
    pub(crate) fn malformed(position: u64, message: impl Into<String>) -> Self {
        Self::MalformedMarkup {
            position,
            message: message.into(),
        }
    }
}

/// Raised by a wiki client when the page version moved since it was fetched.
#[derive(Debug, Clone, thiserror::Error)]
#[error("page {page_id} changed remotely (expected version {expected_version})")]
pub struct VersionConflictError {
    pub page_id: String,
    pub expected_version: u64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AmbiguityReason {
    MixedSingleAndPair,
    DuplicateSingle { count: usize },
    DuplicatePair { starts: usize, ends: usize },
    MissingStart,
    MissingEnd,
    ReversedOrder,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct AnchorAmbiguityWarning {
    #[serde(flatten)]
    pub reason: AmbiguityReason,
}

impl fmt::Display for AnchorAmbiguityWarning {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            AmbiguityReason::MixedSingleAndPair => {
                formatter.write_str("page mixes a single foliant anchor with a start/end pair")
            }
            AmbiguityReason::DuplicateSingle { count } => {
                write!(formatter, "page has {count} single foliant anchors")
            }
            AmbiguityReason::DuplicatePair { starts, ends } => write!(
                formatter,
                "page has {starts} foliant_start and {ends} foliant_end anchors"
            ),
            AmbiguityReason::MissingStart => {
                formatter.write_str("foliant_end anchor has no matching foliant_start")
            }
            AmbiguityReason::MissingEnd => {
                formatter.write_str("foliant_start anchor has no matching foliant_end")
            }
            AmbiguityReason::ReversedOrder => {
                formatter.write_str("foliant_end anchor precedes foliant_start")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommentMatchFailure {
    pub ref_id: String,
    pub anchor_text: String,
    pub detail: String,
}

/// Recoverable conditions collected during a merge. Each one is also logged.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeWarning {
    AnchorAmbiguity(AnchorAmbiguityWarning),
    CommentMatchFailure(CommentMatchFailure),
    AttachmentNameCollision { file_name: String, path: String },
}

impl fmt::Display for MergeWarning {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnchorAmbiguity(warning) => write!(formatter, "{warning}; replacing whole body"),
            Self::CommentMatchFailure(failure) => write!(
                formatter,
                "comment {} on \"{}\" not relocated: {}",
                failure.ref_id, failure.anchor_text, failure.detail
            ),
            Self::AttachmentNameCollision { file_name, path } => write!(
                formatter,
                "attachment {path} skipped: another file is already uploaded as {file_name}"
            ),
        }
    }
}

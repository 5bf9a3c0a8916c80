//! Per-page merge pipeline and the parallel batch runner.

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::anchor::{AnchorRegion, locate_region};
use crate::attachments::{AttachmentPlan, AttachmentRef, RemoteAttachment, dedupe_attachments};
use crate::comments::{CommentMetadata, extract_comments};
use crate::error::{MergeError, MergeWarning};
use crate::fingerprint::Fingerprint;
use crate::markup::DocumentTree;
use crate::matcher::{MatchPolicy, match_comments};
use crate::merge::{CommentOp, merge_tree};
use crate::textindex::TextIndex;

pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    pub restore_comments: bool,
    pub resolve_if_changed: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            restore_comments: true,
            resolve_if_changed: false,
        }
    }
}

/// Rendered content for one logical page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInput {
    pub title: String,
    pub fragment: String,
    pub attachments: Vec<AttachmentRef>,
}

/// Remote state read before the merge. `body` is `None` for pages that do not exist yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSnapshot {
    pub body: Option<String>,
    pub stored_fingerprint: Option<String>,
    pub comments: Vec<CommentMetadata>,
    pub attachments: Vec<RemoteAttachment>,
}

#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Unchanged { fingerprint: Fingerprint },
    Merged(Box<MergeResult>),
}

#[derive(Debug, Clone)]
pub struct MergeResult {
    pub tree: DocumentTree,
    pub region: AnchorRegion,
    pub comment_ops: Vec<CommentOp>,
    pub fingerprint: Fingerprint,
    pub attachments: AttachmentPlan,
    pub warnings: Vec<MergeWarning>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommentCounts {
    pub relocated: usize,
    pub orphaned: usize,
    pub deleted: usize,
}

impl MergeOutcome {
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            Self::Unchanged { fingerprint } => fingerprint,
            Self::Merged(result) => &result.fingerprint,
        }
    }
}

impl MergeResult {
    pub fn body(&self) -> String {
        self.tree.serialize()
    }

    pub fn comment_counts(&self) -> CommentCounts {
        let mut counts = CommentCounts::default();
        for op in &self.comment_ops {
            match op {
                CommentOp::Relocated { .. } => counts.relocated += 1,
                CommentOp::Orphaned { .. } => counts.orphaned += 1,
                CommentOp::Delete { .. } => counts.deleted += 1,
            }
        }
        counts
    }
}

/// Run fingerprint gate, extraction, matching, merge and attachment dedupe for one page.
pub fn merge_page(
    input: &PageInput,
    remote: &RemoteSnapshot,
    options: MergeOptions,
) -> Result<MergeOutcome, MergeError> {
    let fragment = DocumentTree::parse(&input.fragment)?;
    let fingerprint = Fingerprint::compute(&input.title, &fragment);
    if remote.body.is_some() && fingerprint.matches(remote.stored_fingerprint.as_deref()) {
        debug!(title = %input.title, %fingerprint, "fingerprint unchanged, skipping merge");
        return Ok(MergeOutcome::Unchanged { fingerprint });
    }

    let remote_tree = match remote.body.as_deref() {
        Some(body) => DocumentTree::parse(body)?,
        None => DocumentTree::default(),
    };
    let resolution = locate_region(&remote_tree);
    let replaced = resolution.region.replaced_range(remote_tree.nodes().len());

    let comments = if options.restore_comments {
        extract_comments(&remote_tree.nodes()[replaced], &remote.comments)
    } else {
        Vec::new()
    };
    let index = TextIndex::build(fragment.nodes());
    let report = match_comments(
        &comments,
        &index,
        MatchPolicy {
            resolve_if_changed: options.resolve_if_changed,
        },
    );
    let merged = merge_tree(&remote_tree, &resolution, &fragment, &comments, &report);
    let attachments = dedupe_attachments(&input.attachments, &remote.attachments);

    let mut warnings = merged.warnings;
    warnings.extend(attachments.warnings.iter().cloned());

    let result = MergeResult {
        tree: merged.tree,
        region: resolution.region,
        comment_ops: merged.comment_ops,
        fingerprint,
        attachments,
        warnings,
    };
    let counts = result.comment_counts();
    info!(
        title = %input.title,
        relocated = counts.relocated,
        orphaned = counts.orphaned,
        deleted = counts.deleted,
        "merged page"
    );
    Ok(MergeOutcome::Merged(Box::new(result)))
}

/// Merge independent pages on a bounded worker pool. Results keep input order.
pub fn merge_pages(
    pages: &[(&PageInput, &RemoteSnapshot)],
    options: MergeOptions,
    workers: usize,
) -> Result<Vec<Result<MergeOutcome, MergeError>>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|index| format!("pagemerge-{index}"))
        .build()
        .context("failed to build merge worker pool")?;
    Ok(pool.install(|| {
        pages
            .par_iter()
            .map(|(input, remote)| merge_page(input, remote, options))
            .collect()
    }))
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use similar::TextDiff;
use tracing::{info, warn};

use crate::attachments::{AttachmentRef, collect_attachment_refs};
use crate::client::{
    ConfluenceClient, ConfluenceClientConfig, PageTarget, PageUpdate, RemotePage, WikiClient,
};
use crate::config::PublishConfig;
use crate::error::VersionConflictError;
use crate::fingerprint::{FINGERPRINT_PROPERTY_KEY, sha256_hex};
use crate::markup::DocumentTree;
use crate::merge::CommentOp;
use crate::pipeline::{
    CommentCounts, MergeOptions, MergeOutcome, MergeResult, PageInput, RemoteSnapshot, merge_page,
    merge_pages,
};

#[derive(Debug, Clone)]
pub struct PageJob {
    pub target: PageTarget,
    pub input: PageInput,
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub dry_run: bool,
    pub merge: MergeOptions,
    pub workers: usize,
    pub notify_watchers: bool,
    pub max_conflict_retries: usize,
}

impl PublishOptions {
    pub fn from_config(config: &PublishConfig, dry_run: bool) -> Self {
        Self {
            dry_run,
            merge: config.merge_options(),
            workers: config.workers(),
            notify_watchers: config.notify_watchers(),
            max_conflict_retries: config.max_conflict_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishPageResult {
    pub title: String,
    pub action: String,
    pub detail: Option<String>,
    pub page_id: Option<String>,
    pub comments: CommentCounts,
    pub uploaded_attachments: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub success: bool,
    pub dry_run: bool,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub conflicts: Vec<String>,
    pub errors: Vec<String>,
    pub pages: Vec<PublishPageResult>,
    pub request_count: usize,
}

impl PublishPageResult {
    fn new(title: &str, action: &str) -> Self {
        Self {
            title: title.to_string(),
            action: action.to_string(),
            detail: None,
            page_id: None,
            comments: CommentCounts::default(),
            uploaded_attachments: 0,
            diff: None,
            warnings: Vec::new(),
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Publish every `[[pages]]` entry of `config` through the Confluence REST API.
pub fn publish_pages(
    config: &PublishConfig,
    root: &Path,
    options: &PublishOptions,
) -> Result<PublishReport> {
    let jobs = load_page_jobs(config, root)?;
    let mut client = ConfluenceClient::new(ConfluenceClientConfig::from_config(config)?)?;
    publish_pages_with_api(&jobs, options, &mut client)
}

/// Read fragments and hash attachments for every configured page.
///
/// Besides the files listed in the entry, attachments referenced by name in
/// the fragment are picked up when they sit next to the fragment file.
pub fn load_page_jobs(config: &PublishConfig, root: &Path) -> Result<Vec<PageJob>> {
    let mut jobs = Vec::with_capacity(config.pages.len());
    for entry in &config.pages {
        let target = config.page_target(entry)?;
        let fragment_path = root.join(&entry.fragment);
        let fragment = fs::read_to_string(&fragment_path)
            .with_context(|| format!("failed to read {}", fragment_path.display()))?;

        let mut paths: Vec<PathBuf> = entry
            .attachments
            .iter()
            .map(|path| root.join(path))
            .collect();
        if let Ok(tree) = DocumentTree::parse(&fragment) {
            let fragment_dir = fragment_path.parent().unwrap_or(root);
            for name in collect_attachment_refs(&tree) {
                let candidate = fragment_dir.join(&name);
                let already_listed = paths
                    .iter()
                    .any(|path| path.file_name() == candidate.file_name());
                if !already_listed && candidate.is_file() {
                    paths.push(candidate);
                }
            }
        }

        let mut attachments = Vec::with_capacity(paths.len());
        for path in paths {
            let content_hash = hash_file(&path)?;
            attachments.push(AttachmentRef { path, content_hash });
        }
        jobs.push(PageJob {
            target,
            input: PageInput {
                title: entry.title.clone(),
                fragment,
                attachments,
            },
        });
    }
    Ok(jobs)
}

pub fn hash_file(path: &Path) -> Result<String> {
    let content =
        fs::read(path).with_context(|| format!("failed to read attachment {}", path.display()))?;
    Ok(sha256_hex(&content))
}

pub fn publish_pages_with_api<A: WikiClient>(
    jobs: &[PageJob],
    options: &PublishOptions,
    api: &mut A,
) -> Result<PublishReport> {
    let mut report = PublishReport {
        success: true,
        dry_run: options.dry_run,
        created: 0,
        updated: 0,
        unchanged: 0,
        conflicts: Vec::new(),
        errors: Vec::new(),
        pages: Vec::new(),
        request_count: 0,
    };

    let mut fetched = Vec::with_capacity(jobs.len());
    for job in jobs {
        match fetch_snapshot(api, job, options.merge) {
            Ok(snapshot) => fetched.push((job, snapshot)),
            Err(error) => record_error(&mut report, &job.input.title, "fetch failed", &error),
        }
    }

    let pairs = fetched
        .iter()
        .map(|(job, (_, snapshot))| (&job.input, snapshot))
        .collect::<Vec<_>>();
    let outcomes = merge_pages(&pairs, options.merge, options.workers)?;

    for ((job, (page, _)), outcome) in fetched.iter().zip(outcomes) {
        let mut current = outcome
            .map(|outcome| (page.clone(), outcome))
            .map_err(anyhow::Error::from);
        let mut attempt = 0;
        loop {
            let applied = current.and_then(|(page, outcome)| {
                apply_outcome(api, job, page.as_ref(), outcome, options)
            });
            match applied {
                Ok(result) => {
                    match result.action.as_str() {
                        "created" => report.created += 1,
                        "updated" => report.updated += 1,
                        "unchanged" => report.unchanged += 1,
                        _ => {}
                    }
                    report.pages.push(result);
                    break;
                }
                Err(error) if error.downcast_ref::<VersionConflictError>().is_some() => {
                    if attempt >= options.max_conflict_retries {
                        warn!(title = %job.input.title, "giving up after version conflicts");
                        report.conflicts.push(job.input.title.clone());
                        report.pages.push(
                            PublishPageResult::new(&job.input.title, "conflict")
                                .with_detail(error.to_string()),
                        );
                        break;
                    }
                    attempt += 1;
                    warn!(title = %job.input.title, attempt, "version conflict, refetching page");
                    current = fetch_snapshot(api, job, options.merge).and_then(|(page, snapshot)| {
                        let outcome = merge_page(&job.input, &snapshot, options.merge)?;
                        Ok((page, outcome))
                    });
                }
                Err(error) => {
                    record_error(&mut report, &job.input.title, "publish failed", &error);
                    break;
                }
            }
        }
    }

    report.request_count = api.request_count();
    report.success = report.errors.is_empty() && report.conflicts.is_empty();
    Ok(report)
}

fn record_error(report: &mut PublishReport, title: &str, detail: &str, error: &anyhow::Error) {
    warn!(title, "{detail}: {error:#}");
    report.errors.push(format!("{title}: {error:#}"));
    report
        .pages
        .push(PublishPageResult::new(title, "error").with_detail(detail));
}

fn fetch_snapshot<A: WikiClient>(
    api: &mut A,
    job: &PageJob,
    options: MergeOptions,
) -> Result<(Option<RemotePage>, RemoteSnapshot)> {
    let Some(page) = api.fetch_page(&job.target)? else {
        return Ok((None, RemoteSnapshot::default()));
    };
    let comments = if options.restore_comments || options.resolve_if_changed {
        api.fetch_comments(&page.id)?
    } else {
        Vec::new()
    };
    let attachments = if job.input.attachments.is_empty() {
        Vec::new()
    } else {
        api.fetch_attachments(&page.id)?
    };
    let snapshot = RemoteSnapshot {
        body: Some(page.body.clone()),
        stored_fingerprint: page.stored_fingerprint.clone(),
        comments,
        attachments,
    };
    Ok((Some(page), snapshot))
}

fn apply_outcome<A: WikiClient>(
    api: &mut A,
    job: &PageJob,
    page: Option<&RemotePage>,
    outcome: MergeOutcome,
    options: &PublishOptions,
) -> Result<PublishPageResult> {
    let title = &job.input.title;
    let result = match outcome {
        MergeOutcome::Unchanged { .. } => {
            let mut result = PublishPageResult::new(title, "unchanged");
            result.page_id = page.map(|page| page.id.clone());
            return Ok(result);
        }
        MergeOutcome::Merged(result) => result,
    };
    let body = result.body();

    let mut output = PublishPageResult::new(title, "");
    output.page_id = page.map(|page| page.id.clone());
    output.comments = result.comment_counts();
    output.warnings = result.warnings.iter().map(ToString::to_string).collect();

    if options.dry_run {
        let old = page.map(|page| page.body.as_str()).unwrap_or("");
        output.action = if page.is_some() {
            "would_update".to_string()
        } else {
            "would_create".to_string()
        };
        output.uploaded_attachments = result.attachments.uploads().count();
        output.diff = Some(
            TextDiff::from_lines(old, body.as_str())
                .unified_diff()
                .header("remote", "merged")
                .to_string(),
        );
        return Ok(output);
    }

    let page_id = match page {
        Some(page) => {
            output.uploaded_attachments = upload_attachments(api, &page.id, &result)?;
            api.update_page(&PageUpdate {
                page_id: &page.id,
                title,
                body: &body,
                expected_version: page.version,
                minor_edit: !options.notify_watchers,
            })?;
            output.action = "updated".to_string();
            page.id.clone()
        }
        None => {
            let created = api.create_page(&job.target, title, &body)?;
            output.uploaded_attachments = upload_attachments(api, &created.id, &result)?;
            output.action = "created".to_string();
            created.id
        }
    };

    for op in &result.comment_ops {
        let CommentOp::Delete { ref_id, comment_id } = op else {
            continue;
        };
        match comment_id {
            Some(comment_id) => api
                .delete_comment(comment_id)
                .with_context(|| format!("failed to delete comment {ref_id}"))?,
            None => {
                warn!(title = %title, ref_id = %ref_id, "comment has no id and was not deleted");
                output
                    .warnings
                    .push(format!("comment {ref_id} has no comment id; left in place"));
            }
        }
    }
    api.set_property(&page_id, FINGERPRINT_PROPERTY_KEY, result.fingerprint.as_str())
        .context("failed to store page fingerprint")?;

    info!(title = %title, action = %output.action, page_id = %page_id, "published page");
    output.page_id = Some(page_id);
    Ok(output)
}

fn upload_attachments<A: WikiClient>(
    api: &mut A,
    page_id: &str,
    result: &MergeResult,
) -> Result<usize> {
    let mut uploaded = 0;
    for op in result.attachments.uploads() {
        api.upload_attachment(page_id, &op.path, &op.content_hash)
            .with_context(|| format!("failed to upload {}", op.path.display()))?;
        uploaded += 1;
    }
    Ok(uploaded)
}

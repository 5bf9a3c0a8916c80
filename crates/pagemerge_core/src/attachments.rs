use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::MergeWarning;
use crate::markup::{DocumentTree, Node, decode_attribute};

/// A file referenced while rendering a page, hashed by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub path: PathBuf,
    pub content_hash: String,
}

/// Attachment already present on the remote page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAttachment {
    pub file_name: String,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentAction {
    Upload,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentOp {
    pub path: PathBuf,
    pub file_name: String,
    pub content_hash: String,
    pub action: AttachmentAction,
    /// How many references collapsed into this entry.
    pub references: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttachmentPlan {
    pub ops: Vec<AttachmentOp>,
    pub warnings: Vec<MergeWarning>,
}

impl AttachmentPlan {
    pub fn uploads(&self) -> impl Iterator<Item = &AttachmentOp> {
        self.ops
            .iter()
            .filter(|op| op.action == AttachmentAction::Upload)
    }
}

/// Collapse repeated references into one upload obligation per file.
pub fn dedupe_attachments(refs: &[AttachmentRef], remote: &[RemoteAttachment]) -> AttachmentPlan {
    let remote_hashes = remote
        .iter()
        .map(|attachment| (attachment.file_name.as_str(), attachment.content_hash.as_deref()))
        .collect::<HashMap<_, _>>();

    let mut plan = AttachmentPlan::default();
    let mut by_path: HashMap<PathBuf, usize> = HashMap::new();
    let mut by_name: HashMap<String, PathBuf> = HashMap::new();

    for reference in refs {
        let path = normalize_lexically(&reference.path);
        if let Some(&index) = by_path.get(&path) {
            plan.ops[index].references += 1;
            continue;
        }

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        if let Some(existing) = by_name.get(&file_name) {
            let warning = MergeWarning::AttachmentNameCollision {
                file_name: file_name.clone(),
                path: path.display().to_string(),
            };
            warn!(existing = %existing.display(), "{warning}");
            plan.warnings.push(warning);
            continue;
        }

        let unchanged = remote_hashes
            .get(file_name.as_str())
            .copied()
            .flatten()
            .is_some_and(|hash| hash.eq_ignore_ascii_case(&reference.content_hash));
        let action = if unchanged {
            debug!(file = %file_name, "attachment unchanged on remote");
            AttachmentAction::Unchanged
        } else {
            AttachmentAction::Upload
        };

        by_path.insert(path.clone(), plan.ops.len());
        by_name.insert(file_name.clone(), path.clone());
        plan.ops.push(AttachmentOp {
            path,
            file_name,
            content_hash: reference.content_hash.clone(),
            action,
            references: 1,
        });
    }

    plan
}

/// Resolve `.` and `..` components without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(
                    normalized.components().next_back(),
                    Some(Component::Normal(_))
                ) && normalized.pop();
                if !popped && !normalized.has_root() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// File names referenced by `<ri:attachment ri:filename="…"/>` in a fragment.
pub fn collect_attachment_refs(fragment: &DocumentTree) -> Vec<String> {
    let mut names = Vec::new();
    for (_, node) in fragment.walk() {
        if let Node::Element(element) = node
            && element.name == "ri:attachment"
            && let Some(name) = element.attribute("ri:filename")
        {
            let name = decode_attribute(name).into_owned();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

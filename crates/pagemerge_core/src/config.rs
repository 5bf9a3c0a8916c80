use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::client::PageTarget;
use crate::pipeline::{DEFAULT_WORKERS, MergeOptions};

pub const DEFAULT_USER_AGENT: &str = "pagemerge/0.1";
pub const DEFAULT_CONFIG_PATH: &str = ".pagemerge/config.toml";
pub const DEFAULT_MAX_CONFLICT_RETRIES: usize = 1;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PublishConfig {
    #[serde(default)]
    pub confluence: ConfluenceSection,
    #[serde(default)]
    pub pages: Vec<PageEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConfluenceSection {
    pub host: Option<String>,
    pub space_key: Option<String>,
    pub username: Option<String>,
    pub token: Option<String>,
    pub user_agent: Option<String>,
    pub restore_comments: Option<bool>,
    pub resolve_if_changed: Option<bool>,
    pub notify_watchers: Option<bool>,
    pub workers: Option<usize>,
    pub max_conflict_retries: Option<usize>,
}

/// One `[[pages]]` entry: a rendered fragment and where it goes.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PageEntry {
    pub title: String,
    pub id: Option<String>,
    pub space_key: Option<String>,
    pub parent_id: Option<String>,
    pub fragment: PathBuf,
    #[serde(default)]
    pub attachments: Vec<PathBuf>,
}

impl PublishConfig {
    /// Resolve the Confluence host: env CONFLUENCE_HOST > config > None.
    pub fn host(&self) -> Option<String> {
        env_override("CONFLUENCE_HOST").or_else(|| self.confluence.host.clone())
    }

    pub fn username(&self) -> Option<String> {
        env_override("CONFLUENCE_USERNAME").or_else(|| self.confluence.username.clone())
    }

    pub fn token(&self) -> Option<String> {
        env_override("CONFLUENCE_TOKEN").or_else(|| self.confluence.token.clone())
    }

    /// Resolve user agent: env CONFLUENCE_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("CONFLUENCE_USER_AGENT")
            .or_else(|| self.confluence.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn merge_options(&self) -> MergeOptions {
        let defaults = MergeOptions::default();
        MergeOptions {
            restore_comments: self
                .confluence
                .restore_comments
                .unwrap_or(defaults.restore_comments),
            resolve_if_changed: self
                .confluence
                .resolve_if_changed
                .unwrap_or(defaults.resolve_if_changed),
        }
    }

    pub fn workers(&self) -> usize {
        self.confluence.workers.unwrap_or(DEFAULT_WORKERS).max(1)
    }

    pub fn max_conflict_retries(&self) -> usize {
        self.confluence
            .max_conflict_retries
            .unwrap_or(DEFAULT_MAX_CONFLICT_RETRIES)
    }

    pub fn notify_watchers(&self) -> bool {
        self.confluence.notify_watchers.unwrap_or(false)
    }

    /// Where `entry` lives remotely: its id when known, else space key and title.
    pub fn page_target(&self, entry: &PageEntry) -> Result<PageTarget> {
        if let Some(id) = entry.id.as_deref().map(str::trim)
            && !id.is_empty()
        {
            return Ok(PageTarget::Id(id.to_string()));
        }
        let space_key = entry
            .space_key
            .clone()
            .or_else(|| self.confluence.space_key.clone())
            .filter(|value| !value.trim().is_empty());
        let Some(space_key) = space_key else {
            bail!(
                "page \"{}\" needs either an id or a space_key",
                entry.title
            );
        };
        Ok(PageTarget::Title {
            space_key,
            title: entry.title.clone(),
            parent_id: entry.parent_id.clone(),
        })
    }
}

/// Load and parse a PublishConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<PublishConfig> {
    if !config_path.exists() {
        return Ok(PublishConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: PublishConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Derive the REST API base from a Confluence host such as `wiki.example.org`.
pub fn derive_rest_url(host: &str) -> Option<String> {
    let trimmed = host.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    if with_scheme.ends_with("/rest/api") {
        Some(with_scheme)
    } else {
        Some(format!("{with_scheme}/rest/api"))
    }
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_no_host() {
        let config = PublishConfig::default();
        assert!(config.confluence.host.is_none());
        assert!(config.pages.is_empty());
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert!(config.confluence.space_key.is_none());
    }

    #[test]
    fn load_config_parses_confluence_section_and_pages() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[confluence]
host = "https://wiki.example.org"
space_key = "DOCS"
resolve_if_changed = true
workers = 8

[[pages]]
title = "Setup"
fragment = "build/setup.xhtml"
attachments = ["img/logo.png"]

[[pages]]
title = "Pinned"
id = "12345"
fragment = "build/pinned.xhtml"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.confluence.space_key.as_deref(), Some("DOCS"));
        assert_eq!(config.workers(), 8);
        assert_eq!(config.max_conflict_retries(), 1);
        assert_eq!(
            config.merge_options(),
            MergeOptions {
                restore_comments: true,
                resolve_if_changed: true,
            }
        );
        assert_eq!(config.pages.len(), 2);
        assert_eq!(config.pages[0].attachments, vec![PathBuf::from("img/logo.png")]);
        assert_eq!(
            config.page_target(&config.pages[0]).expect("target"),
            PageTarget::Title {
                space_key: "DOCS".to_string(),
                title: "Setup".to_string(),
                parent_id: None,
            }
        );
        assert_eq!(
            config.page_target(&config.pages[1]).expect("target"),
            PageTarget::Id("12345".to_string())
        );
    }

    #[test]
    fn page_without_id_or_space_is_rejected() {
        let config = PublishConfig::default();
        let entry = PageEntry {
            title: "Loose".to_string(),
            id: None,
            space_key: None,
            parent_id: None,
            fragment: PathBuf::from("loose.xhtml"),
            attachments: Vec::new(),
        };
        let error = config.page_target(&entry).expect_err("must fail");
        assert!(error.to_string().contains("space_key"));
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[confluence\nhost = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn derive_rest_url_adds_scheme_and_path() {
        assert_eq!(
            derive_rest_url("wiki.example.org/"),
            Some("https://wiki.example.org/rest/api".to_string())
        );
        assert_eq!(
            derive_rest_url("http://localhost:8090/rest/api"),
            Some("http://localhost:8090/rest/api".to_string())
        );
        assert_eq!(derive_rest_url("  "), None);
    }

    #[test]
    fn default_merge_options_restore_comments() {
        let config = PublishConfig::default();
        assert!(config.merge_options().restore_comments);
        assert!(!config.merge_options().resolve_if_changed);
        assert_eq!(config.workers(), 4);
    }
}

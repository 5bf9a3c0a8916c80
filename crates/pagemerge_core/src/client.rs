use std::env;
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::multipart::Form;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::attachments::RemoteAttachment;
use crate::comments::CommentMetadata;
use crate::config::{PublishConfig, derive_rest_url};
use crate::error::VersionConflictError;
use crate::fingerprint::FINGERPRINT_PROPERTY_KEY;

const PAGE_LIMIT: usize = 100;
const HASH_COMMENT_PREFIX: &str = "sha256:";

/// How a page is addressed on the wiki.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum PageTarget {
    Id(String),
    Title {
        space_key: String,
        title: String,
        parent_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePage {
    pub id: String,
    pub title: String,
    pub version: u64,
    pub body: String,
    pub stored_fingerprint: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageUpdate<'a> {
    pub page_id: &'a str,
    pub title: &'a str,
    pub body: &'a str,
    pub expected_version: u64,
    pub minor_edit: bool,
}

pub trait WikiClient {
    /// `Ok(None)` when the target does not exist yet.
    fn fetch_page(&mut self, target: &PageTarget) -> Result<Option<RemotePage>>;
    fn fetch_comments(&mut self, page_id: &str) -> Result<Vec<CommentMetadata>>;
    fn fetch_attachments(&mut self, page_id: &str) -> Result<Vec<RemoteAttachment>>;
    fn create_page(&mut self, target: &PageTarget, title: &str, body: &str) -> Result<RemotePage>;
    /// Returns the new version. A stale `expected_version` fails with [`VersionConflictError`].
    fn update_page(&mut self, update: &PageUpdate<'_>) -> Result<u64>;
    fn upload_attachment(&mut self, page_id: &str, path: &Path, content_hash: &str) -> Result<()>;
    fn delete_comment(&mut self, comment_id: &str) -> Result<()>;
    fn set_property(&mut self, page_id: &str, key: &str, value: &str) -> Result<()>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub username: Option<String>,
    pub token: Option<String>,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl ConfluenceClientConfig {
    pub fn from_config(config: &PublishConfig) -> Result<Self> {
        Self::with_host(config.host(), config)
    }

    /// Build the client settings for an already resolved `host`.
    pub fn with_host(host: Option<String>, config: &PublishConfig) -> Result<Self> {
        let host =
            host.ok_or_else(|| anyhow::anyhow!("CONFLUENCE_HOST or [confluence].host is required"))?;
        let api_url = derive_rest_url(&host)
            .ok_or_else(|| anyhow::anyhow!("invalid Confluence host: {host}"))?;
        Ok(Self {
            api_url,
            user_agent: config.user_agent(),
            username: config.username(),
            token: config.token(),
            timeout_ms: env_value_u64("CONFLUENCE_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("CONFLUENCE_RATE_LIMIT_READ", 200),
            rate_limit_write_ms: env_value_u64("CONFLUENCE_RATE_LIMIT_WRITE", 500),
            max_retries: env_value_usize("CONFLUENCE_HTTP_RETRIES", 2),
            max_write_retries: env_value_usize("CONFLUENCE_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_value_u64("CONFLUENCE_HTTP_RETRY_DELAY_MS", 500),
        })
    }
}

pub struct ConfluenceClient {
    client: Client,
    config: ConfluenceClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Confluence HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("User-Agent", self.config.user_agent.clone());
        match (&self.config.username, &self.config.token) {
            (Some(username), Some(token)) => request.basic_auth(username, Some(token)),
            (None, Some(token)) => request.bearer_auth(token),
            _ => request,
        }
    }

    /// Send with rate limiting and retries. Non-retryable statuses are returned to the caller.
    fn execute<F>(&mut self, is_write: bool, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> Result<RequestBuilder>,
    {
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let request = self.authorize(build(&self.client)?);
            match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if attempt < max_retries && is_retryable_status(status) {
                        debug!(%status, attempt, "retrying Confluence request");
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Ok(response);
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        debug!(%error, attempt, "retrying Confluence request");
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error).context("failed to call Confluence API");
                }
            }
        }

        bail!("Confluence API request exhausted retry budget")
    }

    fn get_json(&mut self, path: &str, query: &[(&str, String)]) -> Result<Option<Value>> {
        let url = self.url(path);
        let response = self.execute(false, |client| Ok(client.get(&url).query(query)))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let payload = expect_success(response, path)?
            .json::<Value>()
            .context("failed to decode Confluence API JSON response")?;
        Ok(Some(payload))
    }

    /// Follow `start`/`limit` paging until a short page comes back.
    fn get_paged<T>(&mut self, path: &str, query: &[(&str, String)]) -> Result<Vec<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut output = Vec::new();
        let mut start = 0usize;
        loop {
            let mut pairs = query.to_vec();
            pairs.push(("start", start.to_string()));
            pairs.push(("limit", PAGE_LIMIT.to_string()));
            let Some(payload) = self.get_json(path, &pairs)? else {
                return Ok(output);
            };
            let page: ResultsPage<T> = serde_json::from_value(payload)
                .with_context(|| format!("failed to decode {path} listing"))?;
            let count = page.results.len();
            output.extend(page.results);
            if count < PAGE_LIMIT {
                return Ok(output);
            }
            start += count;
        }
    }

    fn fetch_property(&mut self, page_id: &str, key: &str) -> Result<Option<ContentProperty>> {
        let path = format!("content/{page_id}/property/{key}");
        match self.get_json(&path, &[])? {
            Some(payload) => Ok(Some(
                serde_json::from_value(payload).context("failed to decode page property")?,
            )),
            None => Ok(None),
        }
    }

    fn into_remote_page(&mut self, content: ContentItem) -> Result<RemotePage> {
        let stored_fingerprint = self
            .fetch_property(&content.id, FINGERPRINT_PROPERTY_KEY)?
            .and_then(|property| property.value.as_str().map(str::to_string));
        let url = content
            .links
            .as_ref()
            .and_then(|links| links.webui.as_ref())
            .map(|webui| match content.links.as_ref().and_then(|links| links.base.as_ref()) {
                Some(base) => format!("{base}{webui}"),
                None => webui.clone(),
            });
        Ok(RemotePage {
            id: content.id,
            title: content.title,
            version: content.version.map(|version| version.number).unwrap_or(0),
            body: content
                .body
                .and_then(|body| body.storage)
                .map(|storage| storage.value)
                .unwrap_or_default(),
            stored_fingerprint,
            url,
        })
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }
}

impl WikiClient for ConfluenceClient {
    fn fetch_page(&mut self, target: &PageTarget) -> Result<Option<RemotePage>> {
        let expand = ("expand", "body.storage,version".to_string());
        let content = match target {
            PageTarget::Id(id) => match self.get_json(&format!("content/{id}"), &[expand])? {
                Some(payload) => Some(
                    serde_json::from_value::<ContentItem>(payload)
                        .context("failed to decode Confluence page")?,
                ),
                None => None,
            },
            PageTarget::Title {
                space_key, title, ..
            } => {
                let payload = self.get_json(
                    "content",
                    &[
                        ("spaceKey", space_key.clone()),
                        ("title", title.clone()),
                        ("type", "page".to_string()),
                        expand,
                    ],
                )?;
                match payload {
                    Some(payload) => {
                        serde_json::from_value::<ResultsPage<ContentItem>>(payload)
                            .context("failed to decode Confluence page search")?
                            .results
                            .into_iter()
                            .next()
                    }
                    None => None,
                }
            }
        };
        content.map(|content| self.into_remote_page(content)).transpose()
    }

    fn fetch_comments(&mut self, page_id: &str) -> Result<Vec<CommentMetadata>> {
        let items: Vec<CommentItem> = self.get_paged(
            &format!("content/{page_id}/child/comment"),
            &[
                ("location", "inline".to_string()),
                (
                    "expand",
                    "body.storage,history,extensions.inlineProperties,extensions.resolution"
                        .to_string(),
                ),
            ],
        )?;

        let mut output = Vec::with_capacity(items.len());
        for item in items {
            let Some(extensions) = item.extensions else {
                continue;
            };
            let Some(ref_id) = extensions
                .inline_properties
                .and_then(|properties| properties.marker_ref)
            else {
                debug!(comment_id = %item.id, "inline comment without marker reference");
                continue;
            };
            let resolved = extensions
                .resolution
                .is_some_and(|resolution| resolution.status.eq_ignore_ascii_case("resolved"));
            output.push(CommentMetadata {
                ref_id,
                comment_id: Some(item.id),
                author: item
                    .history
                    .and_then(|history| history.created_by)
                    .and_then(|user| user.display_name),
                body: item
                    .body
                    .and_then(|body| body.storage)
                    .map(|storage| storage.value),
                resolved,
            });
        }
        Ok(output)
    }

    fn fetch_attachments(&mut self, page_id: &str) -> Result<Vec<RemoteAttachment>> {
        let items: Vec<AttachmentItem> = self.get_paged(
            &format!("content/{page_id}/child/attachment"),
            &[("expand", "version,metadata".to_string())],
        )?;
        Ok(items
            .into_iter()
            .map(|item| {
                let comment = item
                    .metadata
                    .and_then(|metadata| metadata.comment)
                    .or_else(|| item.version.and_then(|version| version.message));
                RemoteAttachment {
                    file_name: item.title,
                    content_hash: comment.and_then(|comment| {
                        comment
                            .trim()
                            .strip_prefix(HASH_COMMENT_PREFIX)
                            .map(str::to_string)
                    }),
                }
            })
            .collect())
    }

    fn create_page(&mut self, target: &PageTarget, title: &str, body: &str) -> Result<RemotePage> {
        let PageTarget::Title {
            space_key,
            parent_id,
            ..
        } = target
        else {
            bail!("cannot create a page addressed only by id");
        };
        let mut payload = json!({
            "type": "page",
            "title": title,
            "space": { "key": space_key },
            "body": { "storage": { "value": body, "representation": "storage" } },
        });
        if let Some(parent_id) = parent_id {
            payload["ancestors"] = json!([{ "id": parent_id }]);
        }

        let url = self.url("content");
        let response = self.execute(true, |client| Ok(client.post(&url).json(&payload)))?;
        let content: ContentItem = expect_success(response, "content")?
            .json()
            .context("failed to decode created page")?;
        Ok(RemotePage {
            id: content.id,
            title: content.title,
            version: content.version.map(|version| version.number).unwrap_or(1),
            body: body.to_string(),
            stored_fingerprint: None,
            url: None,
        })
    }

    fn update_page(&mut self, update: &PageUpdate<'_>) -> Result<u64> {
        let next_version = update.expected_version + 1;
        let payload = json!({
            "id": update.page_id,
            "type": "page",
            "title": update.title,
            "version": { "number": next_version, "minorEdit": update.minor_edit },
            "body": { "storage": { "value": update.body, "representation": "storage" } },
        });
        let path = format!("content/{}", update.page_id);
        let url = self.url(&path);
        let response = self.execute(true, |client| Ok(client.put(&url).json(&payload)))?;
        if response.status() == StatusCode::CONFLICT {
            return Err(VersionConflictError {
                page_id: update.page_id.to_string(),
                expected_version: update.expected_version,
            }
            .into());
        }
        let content: ContentItem = expect_success(response, &path)?
            .json()
            .context("failed to decode updated page")?;
        Ok(content
            .version
            .map(|version| version.number)
            .unwrap_or(next_version))
    }

    fn upload_attachment(&mut self, page_id: &str, path: &Path, content_hash: &str) -> Result<()> {
        let endpoint = format!("content/{page_id}/child/attachment");
        let url = self.url(&endpoint);
        let comment = format!("{HASH_COMMENT_PREFIX}{content_hash}");
        let response = self.execute(true, |client| {
            let form = Form::new()
                .text("comment", comment.clone())
                .text("minorEdit", "true")
                .file("file", path)
                .with_context(|| format!("failed to read attachment {}", path.display()))?;
            Ok(client
                .put(&url)
                .header("X-Atlassian-Token", "nocheck")
                .multipart(form))
        })?;
        expect_success(response, &endpoint)?;
        Ok(())
    }

    fn delete_comment(&mut self, comment_id: &str) -> Result<()> {
        let path = format!("content/{comment_id}");
        let url = self.url(&path);
        let response = self.execute(true, |client| Ok(client.delete(&url)))?;
        if response.status() == StatusCode::NOT_FOUND {
            warn!(comment_id, "comment already gone");
            return Ok(());
        }
        expect_success(response, &path)?;
        Ok(())
    }

    fn set_property(&mut self, page_id: &str, key: &str, value: &str) -> Result<()> {
        let existing = self.fetch_property(page_id, key)?;
        let (path, payload, is_update) = match existing {
            Some(property) => (
                format!("content/{page_id}/property/{key}"),
                json!({
                    "key": key,
                    "value": value,
                    "version": { "number": property.version.map(|version| version.number).unwrap_or(0) + 1 },
                }),
                true,
            ),
            None => (
                format!("content/{page_id}/property"),
                json!({ "key": key, "value": value }),
                false,
            ),
        };
        let url = self.url(&path);
        let response = self.execute(true, |client| {
            let request = if is_update {
                client.put(&url)
            } else {
                client.post(&url)
            };
            Ok(request.json(&payload))
        })?;
        expect_success(response, &path)?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn expect_success(response: Response, path: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response
        .text()
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .and_then(|payload| payload.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "no error message".to_string());
    bail!("Confluence API request {path} failed with HTTP {status}: {detail}")
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize)]
struct ResultsPage<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    id: String,
    #[serde(default)]
    title: String,
    version: Option<VersionPayload>,
    body: Option<BodyPayload>,
    #[serde(rename = "_links")]
    links: Option<LinksPayload>,
}

#[derive(Debug, Deserialize)]
struct VersionPayload {
    #[serde(default)]
    number: u64,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BodyPayload {
    storage: Option<StoragePayload>,
}

#[derive(Debug, Deserialize)]
struct StoragePayload {
    value: String,
}

#[derive(Debug, Deserialize)]
struct LinksPayload {
    base: Option<String>,
    webui: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentProperty {
    value: Value,
    version: Option<VersionPayload>,
}

#[derive(Debug, Deserialize)]
struct CommentItem {
    id: String,
    body: Option<BodyPayload>,
    history: Option<HistoryPayload>,
    extensions: Option<CommentExtensions>,
}

#[derive(Debug, Deserialize)]
struct HistoryPayload {
    #[serde(rename = "createdBy")]
    created_by: Option<UserPayload>,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    #[serde(rename = "displayName")]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommentExtensions {
    #[serde(rename = "inlineProperties")]
    inline_properties: Option<InlineProperties>,
    resolution: Option<ResolutionPayload>,
}

#[derive(Debug, Deserialize)]
struct InlineProperties {
    #[serde(rename = "markerRef")]
    marker_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResolutionPayload {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct AttachmentItem {
    title: String,
    version: Option<VersionPayload>,
    metadata: Option<AttachmentMetadata>,
}

#[derive(Debug, Deserialize)]
struct AttachmentMetadata {
    comment: Option<String>,
}

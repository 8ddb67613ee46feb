//! Page sessions, HTTP fetch utilities and CSV artifact storage for minrepo.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minrepo_core::{RawFrame, ResultRow};
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "minrepo-storage";

#[derive(Debug, Clone, Serialize)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    #[serde(skip)]
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ArtifactManifest<'a> {
    schema_version: u32,
    files: &'a [StoredArtifact],
}

/// Writes inspection-only CSV artifacts under a root directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn run_dir(started_at: DateTime<Utc>) -> PathBuf {
        PathBuf::from(started_at.format("%Y%m%d_%H%M%S").to_string())
    }

    /// `{a}_{b}_{c}.csv` with path separators and blanks replaced.
    pub fn csv_file_name(parts: &[&str]) -> String {
        let stem = parts
            .iter()
            .map(|part| {
                part.trim()
                    .chars()
                    .map(|c| match c {
                        '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
                        c if c.is_whitespace() => '-',
                        c => c,
                    })
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("_");
        let stem = if stem.trim_matches('_').is_empty() {
            "unnamed".to_string()
        } else {
            stem
        };
        format!("{stem}.csv")
    }

    /// Store bytes at `relative_path` via temp-file rename. An existing file with
    /// identical content is left untouched and reported as deduplicated.
    pub async fn store_bytes(
        &self,
        relative_path: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let relative_path = relative_path.as_ref().to_path_buf();
        let absolute_path = self.root.join(&relative_path);
        let content_hash = Self::sha256_hex(bytes);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            let existing = fs::read(&absolute_path)
                .await
                .with_context(|| format!("reading existing artifact {}", absolute_path.display()))?;
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(StoredArtifact {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                });
            }
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }

    pub async fn write_frame_csv(
        &self,
        relative_path: impl AsRef<Path>,
        frame: &RawFrame,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = frame_to_csv(frame)?;
        self.store_bytes(relative_path, &bytes).await
    }

    pub async fn write_rows_csv(
        &self,
        relative_path: impl AsRef<Path>,
        rows: &[ResultRow],
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = rows_to_csv(rows)?;
        self.store_bytes(relative_path, &bytes).await
    }

    pub async fn write_manifest(
        &self,
        relative_dir: impl AsRef<Path>,
        files: &[StoredArtifact],
    ) -> anyhow::Result<PathBuf> {
        let manifest = ArtifactManifest {
            schema_version: 1,
            files,
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing artifact manifest")?;
        let stored = self
            .store_bytes(relative_dir.as_ref().join("manifest.json"), &bytes)
            .await?;
        Ok(stored.absolute_path)
    }
}

pub fn frame_to_csv(frame: &RawFrame) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(frame.columns())
        .context("writing csv header")?;
    for row in frame.rows() {
        writer
            .write_record(row.iter().map(|cell| cell.as_deref().unwrap_or("")))
            .context("writing csv row")?;
    }
    writer.into_inner().context("flushing csv buffer")
}

pub fn rows_to_csv(rows: &[ResultRow]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).context("writing csv row")?;
    }
    writer.into_inner().context("flushing csv buffer")
}

/// Reads a cleaned CSV (`pref,hall,model,date,unit_no,game,bb,rb,medal`).
pub fn read_rows_csv(path: impl AsRef<Path>) -> anyhow::Result<Vec<ResultRow>> {
    let path = path.as_ref();
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    reader
        .deserialize()
        .enumerate()
        .map(|(i, row)| row.with_context(|| format!("parsing {} record {}", path.display(), i + 1)))
        .collect()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Plain GET client. One attempt per call.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }
}

#[derive(Debug, Error)]
pub enum NavigationError {
    #[error("timed out after {timeout:?} loading {url}")]
    Timeout { url: String, timeout: Duration },
    #[error("failed to load {url}: {source}")]
    Fetch { url: String, source: FetchError },
    #[error("{url} returned an empty document")]
    EmptyDocument { url: String },
    #[error("{url} is not reachable from this session")]
    Unreachable { url: String },
    #[error("no page has been loaded")]
    NoPage,
}

#[derive(Debug, Error)]
#[error("selector `{selector}` did not appear within {waited:?}")]
pub struct ElementTimeout {
    pub selector: String,
    pub waited: Duration,
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error(transparent)]
    Navigation(#[from] NavigationError),
    #[error(transparent)]
    ElementTimeout(#[from] ElementTimeout),
    #[error("invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },
}

/// Detached snapshot of a matched element and its subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementHandle {
    tag: String,
    text: String,
    attributes: BTreeMap<String, String>,
    children: Vec<ElementHandle>,
}

impl ElementHandle {
    fn snapshot(element: ElementRef<'_>) -> Self {
        Self {
            tag: element.value().name().to_string(),
            text: element.text().collect(),
            attributes: element
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            children: element
                .children()
                .filter_map(ElementRef::wrap)
                .map(Self::snapshot)
                .collect(),
        }
    }

    pub fn text_content(&self) -> &str {
        &self.text
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Descendant elements with the given tag name, in document order.
    pub fn find_all(&self, tag: &str) -> Vec<&ElementHandle> {
        let mut out = Vec::new();
        for child in &self.children {
            if child.tag.eq_ignore_ascii_case(tag) {
                out.push(child);
            }
            out.extend(child.find_all(tag));
        }
        out
    }
}

#[derive(Debug, Clone)]
struct LoadedDocument {
    url: String,
    html: String,
}

impl LoadedDocument {
    fn select(&self, selector: &str) -> Result<Vec<ElementHandle>, PageError> {
        let sel = parse_selector(selector)?;
        let document = Html::parse_document(&self.html);
        Ok(document.select(&sel).map(ElementHandle::snapshot).collect())
    }

    fn count(&self, selector: &str) -> Result<usize, PageError> {
        let sel = parse_selector(selector)?;
        let document = Html::parse_document(&self.html);
        Ok(document.select(&sel).count())
    }
}

fn parse_selector(selector: &str) -> Result<Selector, PageError> {
    Selector::parse(selector).map_err(|e| PageError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn wait_on_document(
    document: Option<&LoadedDocument>,
    selector: &str,
    timeout: Duration,
) -> Result<(), PageError> {
    let document = document.ok_or(NavigationError::NoPage)?;
    if document.count(selector)? == 0 {
        return Err(ElementTimeout {
            selector: selector.to_string(),
            waited: timeout,
        }
        .into());
    }
    Ok(())
}

fn locate_on_document(
    document: Option<&LoadedDocument>,
    selector: &str,
) -> Result<Vec<ElementHandle>, PageError> {
    document.ok_or(NavigationError::NoPage)?.select(selector)
}

/// The capability surface the navigators need from a rendering engine.
#[async_trait]
pub trait PageSession: Send {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), NavigationError>;

    async fn reload(&mut self) -> Result<(), NavigationError>;

    /// Fails with [`PageError::ElementTimeout`] when nothing matches within `timeout`.
    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration)
        -> Result<(), PageError>;

    fn locate_all(&self, selector: &str) -> Result<Vec<ElementHandle>, PageError>;

    fn current_url(&self) -> Option<&str>;

    async fn close(&mut self) {}
}

/// Live session over plain HTTP. Documents are complete on arrival, so waits
/// resolve against the fetched markup immediately.
#[derive(Debug)]
pub struct HttpPageSession {
    http: HttpFetcher,
    document: Option<LoadedDocument>,
    last_timeout: Duration,
}

impl HttpPageSession {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            document: None,
            last_timeout: HttpClientConfig::default().timeout,
        }
    }
}

#[async_trait]
impl PageSession for HttpPageSession {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), NavigationError> {
        self.last_timeout = timeout;
        let fetched = tokio::time::timeout(timeout, self.http.fetch_bytes(url))
            .await
            .map_err(|_| NavigationError::Timeout {
                url: url.to_string(),
                timeout,
            })?
            .map_err(|source| NavigationError::Fetch {
                url: url.to_string(),
                source,
            })?;

        let html = String::from_utf8_lossy(&fetched.body).into_owned();
        if html.trim().is_empty() {
            return Err(NavigationError::EmptyDocument {
                url: fetched.final_url,
            });
        }
        debug!(url = %fetched.final_url, bytes = html.len(), "page loaded");
        self.document = Some(LoadedDocument {
            url: fetched.final_url,
            html,
        });
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), NavigationError> {
        let url = self
            .document
            .as_ref()
            .map(|d| d.url.clone())
            .ok_or(NavigationError::NoPage)?;
        let timeout = self.last_timeout;
        self.navigate(&url, timeout).await
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), PageError> {
        wait_on_document(self.document.as_ref(), selector, timeout)
    }

    fn locate_all(&self, selector: &str) -> Result<Vec<ElementHandle>, PageError> {
        locate_on_document(self.document.as_ref(), selector)
    }

    fn current_url(&self) -> Option<&str> {
        self.document.as_ref().map(|d| d.url.as_str())
    }

    async fn close(&mut self) {
        self.document = None;
    }
}

/// Serves pre-captured HTML by URL. A page may carry a separate first render
/// that is served on navigation and replaced by the full page on reload.
#[derive(Debug, Clone, Default)]
pub struct StaticPageSession {
    pages: HashMap<String, String>,
    first_renders: HashMap<String, String>,
    document: Option<LoadedDocument>,
    visits: Vec<String>,
    reloads: usize,
    closed: bool,
}

impl StaticPageSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }

    pub fn with_first_render(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.first_renders.insert(url.into(), html.into());
        self
    }

    pub fn visits(&self) -> &[String] {
        &self.visits
    }

    pub fn reloads(&self) -> usize {
        self.reloads
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn load(&mut self, url: &str, html: String) -> Result<(), NavigationError> {
        if html.trim().is_empty() {
            return Err(NavigationError::EmptyDocument {
                url: url.to_string(),
            });
        }
        self.document = Some(LoadedDocument {
            url: url.to_string(),
            html,
        });
        Ok(())
    }
}

#[async_trait]
impl PageSession for StaticPageSession {
    async fn navigate(&mut self, url: &str, _timeout: Duration) -> Result<(), NavigationError> {
        self.visits.push(url.to_string());
        let html = self
            .first_renders
            .get(url)
            .or_else(|| self.pages.get(url))
            .cloned()
            .ok_or_else(|| NavigationError::Unreachable {
                url: url.to_string(),
            })?;
        self.load(url, html)
    }

    async fn reload(&mut self) -> Result<(), NavigationError> {
        let url = self
            .document
            .as_ref()
            .map(|d| d.url.clone())
            .ok_or(NavigationError::NoPage)?;
        self.reloads += 1;
        let html = self
            .pages
            .get(&url)
            .cloned()
            .ok_or_else(|| NavigationError::Unreachable { url: url.clone() })?;
        self.load(&url, html)
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), PageError> {
        wait_on_document(self.document.as_ref(), selector, timeout)
    }

    fn locate_all(&self, selector: &str) -> Result<Vec<ElementHandle>, PageError> {
        locate_on_document(self.document.as_ref(), selector)
    }

    fn current_url(&self) -> Option<&str> {
        self.document.as_ref().map(|d| d.url.as_str())
    }

    async fn close(&mut self) {
        self.document = None;
        self.closed = true;
    }
}

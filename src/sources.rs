//! Document acquisition.
//!
//! A [`DocumentSource`] turns a locator into plain text ready for
//! segmentation. [`WebSource`] fetches and de-tags HTML pages,
//! [`FileSource`] reads local text or HTML files, and [`resolve`] picks
//! between them by locator shape. Fetched text is validated before it is
//! returned; content that is empty or implausibly short is an error here,
//! not later in the pipeline.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use rustc_hash::FxHashMap;
use scraper::{Html, Selector};
use url::Url;

use crate::preprocess::{self, ContentCheck, DEFAULT_MIN_LENGTH};
use crate::types::PipelineError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "Mozilla/5.0 (compatible; attackmap/0.1)";

static SCRIPT_STYLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|noscript)\b.*?</(script|style|noscript)>").unwrap()
});

/// A fetched document, text already extracted.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// The locator as given.
    pub source: String,
    pub title: Option<String>,
    pub text: String,
    pub metadata: FxHashMap<String, String>,
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<FetchedDocument, PipelineError>;
}

/// Pick a source implementation from the locator shape: anything with an
/// http(s) scheme goes to the web, everything else is a file path.
pub fn resolve(locator: &str) -> Result<Box<dyn DocumentSource>, PipelineError> {
    if locator.starts_with("http://") || locator.starts_with("https://") {
        Ok(Box::new(WebSource::new()?))
    } else {
        Ok(Box::new(FileSource::new()))
    }
}

fn html_title(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    let title: String = document
        .select(&selector)
        .next()?
        .text()
        .collect::<String>()
        .trim()
        .to_string();
    (!title.is_empty()).then_some(title)
}

/// Strip script/style bodies, then let the normalizer drop the remaining
/// markup. Scripts must go first or their source would survive as "text".
fn html_to_text(body: &str) -> String {
    let without_scripts = SCRIPT_STYLE_RE.replace_all(body, " ");
    preprocess::clean(&without_scripts)
}

fn check_content(text: &str, locator: &str) -> Result<(), PipelineError> {
    match preprocess::validate(text, DEFAULT_MIN_LENGTH) {
        ContentCheck::Valid { warning } => {
            if let Some(note) = warning {
                tracing::warn!(locator, note = %note, "fetched content looks unusual");
            }
            Ok(())
        }
        ContentCheck::Invalid { reason } => Err(PipelineError::Source(format!(
            "unusable content from {locator}: {reason}"
        ))),
    }
}

// ── Web ─────────────────────────────────────────────────────────────────

pub struct WebSource {
    client: reqwest::Client,
}

impl WebSource {
    pub fn new() -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentSource for WebSource {
    async fn fetch(&self, locator: &str) -> Result<FetchedDocument, PipelineError> {
        let url = Url::parse(locator)
            .map_err(|err| PipelineError::Source(format!("invalid url {locator}: {err}")))?;

        tracing::info!(url = %url, "fetching document");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?;

        let mut metadata = FxHashMap::default();
        metadata.insert("status".to_string(), response.status().as_u16().to_string());
        if let Some(content_type) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        {
            metadata.insert("content_type".to_string(), content_type.to_string());
        }
        metadata.insert(
            "fetched_at".to_string(),
            chrono::Utc::now().to_rfc3339(),
        );

        let body = response.text().await?;
        let document = Html::parse_document(&body);
        let title = html_title(&document);
        let text = html_to_text(&body);
        check_content(&text, locator)?;

        Ok(FetchedDocument {
            source: locator.to_string(),
            title,
            text,
            metadata,
        })
    }
}

// ── File ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FileSource;

impl FileSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DocumentSource for FileSource {
    async fn fetch(&self, locator: &str) -> Result<FetchedDocument, PipelineError> {
        let path = Path::new(locator);
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            PipelineError::Source(format!("cannot read {locator}: {err}"))
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let is_html = matches!(extension.as_str(), "html" | "htm");

        let (title, text) = if is_html {
            let document = Html::parse_document(&raw);
            (html_title(&document), html_to_text(&raw))
        } else {
            let stem = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_string);
            (stem, raw)
        };
        check_content(&text, locator)?;

        let mut metadata = FxHashMap::default();
        metadata.insert("path".to_string(), locator.to_string());
        if !extension.is_empty() {
            metadata.insert("extension".to_string(), extension);
        }

        Ok(FetchedDocument {
            source: locator.to_string(),
            title,
            text,
            metadata,
        })
    }
}

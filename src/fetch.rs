use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use reqwest::Url;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use thiserror::Error;
use tracing::debug;

use crate::parser::table::{self, FieldSchema};
use crate::parser::ExtractedRow;

static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static BLANKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]\(([^)\s]+)(?:\s+[^)]*)?\)").unwrap());
static H1_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#\s+(.+)$").unwrap());

/// A fetched page, converted to markdown.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: String,
    pub title: String,
    pub markdown: String,
    /// Absolute URLs of every link in the markdown, in document order.
    pub links: Vec<String>,
}

impl Page {
    /// Build from markdown; title falls back to the first `#` heading.
    pub fn from_markdown(url: &str, title: Option<String>, markdown: &str) -> Self {
        let markdown = strip_images(markdown);
        let title = title
            .filter(|t| !t.trim().is_empty())
            .or_else(|| H1_RE.captures(&markdown).map(|c| c[1].trim().to_string()))
            .unwrap_or_default();
        let links = LINK_RE
            .captures_iter(&markdown)
            .filter_map(|c| absolute_url(url, &c[1]))
            .collect();
        Self {
            url: url.to_string(),
            title,
            markdown,
            links,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("source returned HTTP {0}")]
    Status(i64),

    #[error("no content in response")]
    Empty,

    #[error("client setup failed: {0}")]
    Client(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Where pages come from. Failures are per-page values, never panics.
#[allow(async_fn_in_trait)]
pub trait PageSource {
    async fn fetch_page(&self, url: &str) -> Result<Page, FetchError>;

    /// Schema-guided extraction of a single page's results table.
    async fn extract_structured(
        &self,
        url: &str,
        schema: &FieldSchema,
    ) -> Result<Vec<ExtractedRow>, FetchError> {
        let page = self.fetch_page(url).await?;
        Ok(table::extract(&page, schema))
    }
}

/// spider.cloud markdown scraper.
pub struct SpiderSource {
    spider: Spider,
}

impl SpiderSource {
    pub fn new(api_key: &str) -> Result<Self, FetchError> {
        let spider = Spider::new(Some(api_key.to_string()))
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { spider })
    }
}

impl PageSource for SpiderSource {
    async fn fetch_page(&self, url: &str) -> Result<Page, FetchError> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Markdown)),
            ..Default::default()
        };

        let start = Instant::now();
        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;
        debug!("Fetched {} in {}ms", url, start.elapsed().as_millis());

        let parsed: serde_json::Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };
        let first = parsed.as_array().and_then(|arr| arr.first());

        if let Some(status) = first.and_then(|obj| obj.get("status")).and_then(|s| s.as_i64()) {
            if status >= 400 {
                return Err(FetchError::Status(status));
            }
        }

        let content = first
            .and_then(|obj| obj.get("content"))
            .and_then(|c| c.as_str())
            .filter(|c| !c.trim().is_empty())
            .ok_or(FetchError::Empty)?;

        let title = first
            .and_then(|obj| obj.get("metadata"))
            .and_then(|m| m.get("title"))
            .and_then(|t| t.as_str())
            .map(str::to_string);

        Ok(Page::from_markdown(url, title, content))
    }
}

/// Fixed pause between consecutive fetches.
pub struct Pacer {
    delay: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(delay: Duration) -> Self {
        Self { delay, last: None }
    }

    /// Sleep until `delay` has passed since the previous fetch. The first call returns at once.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                tokio::time::sleep(self.delay - elapsed).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

/// Resolve `href` against `base`; `None` for unparseable or non-http targets.
pub fn absolute_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim().trim_start_matches('<').trim_end_matches('>');
    let joined = match Url::parse(href) {
        Ok(url) => url,
        Err(_) => Url::parse(base).ok()?.join(href).ok()?,
    };
    match joined.scheme() {
        "http" | "https" => Some(joined.to_string()),
        _ => {
            debug!("Skipping non-http link {}", joined);
            None
        }
    }
}

/// Remove markdown image syntax: ![alt](url)
fn strip_images(md: &str) -> String {
    let cleaned = IMAGE_RE.replace_all(md, "");
    BLANKS_RE.replace_all(&cleaned, "\n\n").to_string()
}

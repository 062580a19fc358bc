pub mod rows;
pub mod table;
pub mod track_page;
pub mod vehicle_page;

use std::sync::LazyLock;

use regex::Regex;

use crate::fetch::{absolute_url, Page};
use crate::laptime::parse_to_ms;
use rows::RowMatch;

static SITE_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+[|\-–—]\s+.*$").unwrap());
static LEADING_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:lap\s*times?|laptimes?|lap\s*records?)\s+(?:at|on|for|of)\s+").unwrap()
});
static TRAILING_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*[:\-]?\s*(?:lap\s*times?|laptimes?|lap\s*records?|results)\s*$").unwrap()
});
static TIRE_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:tires|tyres)\s*:\s*([^|;,)]+)").unwrap());
static TIRE_BRAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:michelin|pirelli|bridgestone|continental|goodyear|dunlop|yokohama|hankook|toyo|falken|kumho|nankang)\b").unwrap()
});
static NON_STOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:modified|tuned|non-stock)\b").unwrap());

/// How a row was recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Schema,
    Structured,
    Loose,
}

impl Strategy {
    pub fn weight(self) -> f64 {
        match self {
            Strategy::Schema => 0.95,
            Strategy::Structured => 0.9,
            Strategy::Loose => 0.7,
        }
    }
}

/// One scraped (name, time, source) triple, not yet resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRow {
    pub name: String,
    pub name_url: Option<String>,
    pub lap_time_text: String,
    pub lap_time_ms: u32,
    pub source_url: String,
    pub strategy: Strategy,
    pub rank: Option<u32>,
    pub power_hp: Option<u32>,
    pub tire_info: Option<String>,
    pub is_stock: bool,
}

/// Rows of one page plus the entity the page is about.
#[derive(Debug, Clone)]
pub struct ParsedPage {
    pub subject: String,
    pub rows: Vec<ExtractedRow>,
}

/// The entity a page is about, from its title: "Test Circuit lap times | Site" → "Test Circuit".
pub fn page_subject(title: &str) -> String {
    let head = title.split(',').next().unwrap_or(title);
    let head = SITE_SUFFIX_RE.replace(head.trim(), "");
    let head = LEADING_PHRASE_RE.replace(&head, "");
    TRAILING_PHRASE_RE.replace(&head, "").trim().to_string()
}

/// Shared row builder: strategies pick the line apart, the caller adds page-specific fields.
fn build_row(page: &Page, m: &RowMatch) -> Option<ExtractedRow> {
    let lap_time_ms = parse_to_ms(&m.time_text)?;
    let source_url = m
        .time_url
        .as_deref()
        .and_then(|href| absolute_url(&page.url, href))
        .unwrap_or_else(|| page.url.clone());
    let name_url = m.name_url.as_deref().and_then(|href| absolute_url(&page.url, href));

    Some(ExtractedRow {
        name: m.name.clone(),
        name_url,
        lap_time_text: m.time_text.clone(),
        lap_time_ms,
        source_url,
        strategy: m.strategy,
        rank: None,
        power_hp: None,
        tire_info: tire_info(m),
        is_stock: !NON_STOCK_RE.is_match(&m.context),
    })
}

fn tire_info(m: &RowMatch) -> Option<String> {
    if let Some(caps) = TIRE_LABEL_RE.captures(&m.context) {
        return Some(caps[1].trim().to_string());
    }
    m.cells
        .iter()
        .find(|cell| TIRE_BRAND_RE.is_match(cell))
        .map(|cell| cell.trim().to_string())
}

/// Scan the page line by line; lines no strategy accepts are skipped.
fn parse_lines(page: &Page, mut finish: impl FnMut(&RowMatch, &mut ExtractedRow)) -> Vec<ExtractedRow> {
    let mut out = Vec::new();
    for line in page.markdown.lines() {
        let Some(m) = rows::match_line(line) else {
            continue;
        };
        if let Some(mut row) = build_row(page, &m) {
            finish(&m, &mut row);
            out.push(row);
        }
    }
    out
}

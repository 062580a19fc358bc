use std::sync::LazyLock;

use regex::Regex;

use super::{ExtractedRow, Strategy, NON_STOCK_RE};
use crate::fetch::{absolute_url, Page};
use crate::laptime::parse_to_ms;

static SEPARATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\|?\s*:?-+:?\s*(?:\|\s*:?-+:?\s*)*\|?$").unwrap());
static CELL_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\[([^\]]+)\]\(([^)\s]+)(?:\s+"[^"]*")?\)"#).unwrap()
});

/// Column headers that identify each field of a results table.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub name: &'static [&'static str],
    pub time: &'static [&'static str],
    pub rank: &'static [&'static str],
    pub tires: &'static [&'static str],
}

impl FieldSchema {
    /// Rows name vehicles.
    pub fn track_page() -> Self {
        Self {
            name: &["car", "vehicle", "model"],
            time: &["time", "lap time", "laptime"],
            rank: &["#", "pos", "position", "rank"],
            tires: &["tires", "tyres"],
        }
    }

    /// Rows name tracks.
    pub fn vehicle_page() -> Self {
        Self {
            name: &["track", "circuit", "venue"],
            time: &["time", "lap time", "laptime"],
            rank: &["#", "pos", "position", "rank"],
            tires: &["tires", "tyres"],
        }
    }
}

struct Columns {
    name: usize,
    time: usize,
    rank: Option<usize>,
    tires: Option<usize>,
}

fn split_cells(line: &str) -> Option<Vec<String>> {
    let inner = line.trim().strip_prefix('|')?;
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    Some(inner.split('|').map(|c| c.trim().to_string()).collect())
}

fn find_column(headers: &[String], names: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| names.iter().any(|n| h.eq_ignore_ascii_case(n)))
}

fn map_columns(headers: &[String], schema: &FieldSchema) -> Option<Columns> {
    Some(Columns {
        name: find_column(headers, schema.name)?,
        time: find_column(headers, schema.time)?,
        rank: find_column(headers, schema.rank),
        tires: find_column(headers, schema.tires),
    })
}

/// (text, link) of a cell; a cell that is a link yields its text and target.
fn cell_parts(cell: &str) -> (String, Option<String>) {
    match CELL_LINK_RE.captures(cell) {
        Some(caps) => (caps[1].trim().to_string(), Some(caps[2].to_string())),
        None => (cell.trim().to_string(), None),
    }
}

/// Read every markdown table whose header maps onto `schema`.
pub fn extract(page: &Page, schema: &FieldSchema) -> Vec<ExtractedRow> {
    let lines: Vec<&str> = page.markdown.lines().collect();
    let mut rows = Vec::new();
    let mut i = 0;

    while i + 1 < lines.len() {
        let columns = split_cells(lines[i])
            .filter(|_| SEPARATOR_RE.is_match(lines[i + 1].trim()))
            .and_then(|headers| map_columns(&headers, schema));
        let Some(columns) = columns else {
            i += 1;
            continue;
        };

        i += 2;
        while i < lines.len() {
            let Some(cells) = split_cells(lines[i]) else {
                break;
            };
            i += 1;
            if let Some(row) = read_row(page, &cells, &columns) {
                rows.push(row);
            }
        }
    }
    rows
}

fn read_row(page: &Page, cells: &[String], columns: &Columns) -> Option<ExtractedRow> {
    let (name, name_link) = cell_parts(cells.get(columns.name)?);
    let (time_text, time_link) = cell_parts(cells.get(columns.time)?);
    if name.is_empty() {
        return None;
    }
    let lap_time_ms = parse_to_ms(&time_text)?;

    let rank = columns
        .rank
        .and_then(|c| cells.get(c))
        .and_then(|c| c.trim_start_matches('#').trim_end_matches('.').parse().ok());
    let tire_info = columns
        .tires
        .and_then(|c| cells.get(c))
        .map(|c| cell_parts(c).0)
        .filter(|c| !c.is_empty());
    let is_stock = !cells.iter().any(|c| NON_STOCK_RE.is_match(c));

    Some(ExtractedRow {
        name,
        name_url: name_link.and_then(|href| absolute_url(&page.url, &href)),
        lap_time_text: time_text,
        lap_time_ms,
        source_url: time_link
            .and_then(|href| absolute_url(&page.url, &href))
            .unwrap_or_else(|| page.url.clone()),
        strategy: Strategy::Schema,
        rank,
        power_hp: None,
        tire_info,
        is_stock,
    })
}

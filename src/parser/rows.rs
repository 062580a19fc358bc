use std::sync::LazyLock;

use regex::Regex;

use super::Strategy;
use crate::laptime::parse_to_ms;

static CELL_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\[([^\]]+)\]\(([^)\s]+)(?:\s+"[^"]*")?\).*$"#).unwrap()
});
static INLINE_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[([^\]]*)\]\(([^)\s]+)(?:\s+"[^"]*")?\)"#).unwrap()
});
static MINUTES_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\d:.])(\d{1,2}['’:]\d{2}\.\d{1,3})(?:$|[^\d])").unwrap());
static SECONDS_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\d:.])(\d+\.\d{1,3})(?:$|[^\d.])").unwrap());
static UNIT_AFTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[A-Za-z%]").unwrap());
static SECONDS_UNIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:s|sec|secs|seconds)\b").unwrap());

/// A data line picked apart, before the time is parsed or links resolved.
#[derive(Debug, Clone)]
pub struct RowMatch {
    pub strategy: Strategy,
    pub name: String,
    pub name_url: Option<String>,
    pub time_text: String,
    pub time_url: Option<String>,
    /// Numeric cell right before the name, structured rows only.
    pub rank: Option<u32>,
    /// Plain text of the remaining cells.
    pub cells: Vec<String>,
    /// Line text with link markup reduced to link text.
    pub context: String,
}

type LineStrategy = fn(&str) -> Option<RowMatch>;

/// Tried in order; the first strategy that accepts a line wins.
const STRATEGIES: &[LineStrategy] = &[structured_row, loose_line];

pub fn match_line(line: &str) -> Option<RowMatch> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    STRATEGIES.iter().find_map(|strategy| strategy(line))
}

fn is_time_token(text: &str) -> bool {
    parse_to_ms(text).is_some()
}

fn has_letter(text: &str) -> bool {
    text.chars().any(char::is_alphabetic)
}

/// "1", "#1", "1." → 1
fn parse_rank(cell: &str) -> Option<u32> {
    cell.trim()
        .trim_start_matches('#')
        .trim_end_matches('.')
        .parse()
        .ok()
}

fn plain_text(text: &str) -> String {
    INLINE_LINK_RE.replace_all(text, "$1").trim().to_string()
}

/// `| 1 | [Name](/link) | ... | [1:23.456](/source) | ... |`
fn structured_row(line: &str) -> Option<RowMatch> {
    let inner = line.strip_prefix('|')?;
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    let cells: Vec<&str> = inner.split('|').map(str::trim).collect();

    let (name_idx, name, name_url) = cells.iter().enumerate().find_map(|(i, cell)| {
        let caps = CELL_LINK_RE.captures(cell)?;
        let text = caps[1].trim();
        (has_letter(text) && !is_time_token(text))
            .then(|| (i, text.to_string(), caps[2].to_string()))
    })?;

    let (time_idx, time_text, time_url) =
        cells.iter().enumerate().skip(name_idx + 1).find_map(|(i, cell)| {
            let caps = CELL_LINK_RE.captures(cell)?;
            let text = caps[1].trim();
            is_time_token(text).then(|| (i, text.to_string(), caps[2].to_string()))
        })?;

    let rank_idx = name_idx
        .checked_sub(1)
        .filter(|&i| parse_rank(cells[i]).is_some());
    let rest = cells
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != name_idx && *i != time_idx && Some(*i) != rank_idx)
        .map(|(_, c)| plain_text(c))
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>();

    Some(RowMatch {
        strategy: Strategy::Structured,
        name,
        name_url: Some(name_url),
        time_text,
        time_url: Some(time_url),
        rank: rank_idx.and_then(|i| parse_rank(cells[i])),
        context: plain_text(line),
        cells: rest,
    })
}

/// Any line with a time token and a linked name near it.
fn loose_line(line: &str) -> Option<RowMatch> {
    struct Link<'a> {
        start: usize,
        end: usize,
        text: &'a str,
        url: &'a str,
        is_time: bool,
    }

    let links: Vec<Link> = INLINE_LINK_RE
        .captures_iter(line)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let text = caps.get(1)?.as_str().trim();
            Some(Link {
                start: whole.start(),
                end: whole.end(),
                text,
                url: caps.get(2)?.as_str(),
                is_time: is_time_token(text),
            })
        })
        .collect();

    // Blank out non-time links so names and URLs never yield a time. Time
    // links keep their text at the same offset.
    let mut scan = String::with_capacity(line.len());
    let mut pos = 0;
    for link in &links {
        scan.push_str(&line[pos..link.start]);
        let width = link.end - link.start;
        if link.is_time {
            scan.push(' ');
            scan.push_str(link.text);
            scan.push_str(&" ".repeat(width - 1 - link.text.len()));
        } else {
            scan.push_str(&" ".repeat(width));
        }
        pos = link.end;
    }
    scan.push_str(&line[pos..]);

    let (time_start, time_text) = find_time_token(&scan)?;

    let name = links
        .iter()
        .filter(|l| !l.is_time && has_letter(l.text))
        .min_by_key(|l| {
            if l.end <= time_start {
                time_start - l.end
            } else {
                l.start.saturating_sub(time_start)
            }
        })?;
    let time_url = links
        .iter()
        .find(|l| l.is_time && l.start <= time_start && time_start < l.end)
        .map(|l| l.url.to_string());

    Some(RowMatch {
        strategy: Strategy::Loose,
        name: name.text.to_string(),
        name_url: Some(name.url.to_string()),
        time_text,
        time_url,
        rank: None,
        cells: Vec::new(),
        context: plain_text(line),
    })
}

/// Minute-form tokens first; a bare `SS.mmm` followed by a unit (`2.0 l`, `20.8 km`) is not a time.
fn find_time_token(scan: &str) -> Option<(usize, String)> {
    if let Some(m) = MINUTES_TOKEN_RE.captures(scan).and_then(|c| c.get(1)) {
        return Some((m.start(), m.as_str().to_string()));
    }
    SECONDS_TOKEN_RE
        .captures_iter(scan)
        .filter_map(|c| c.get(1))
        .find(|m| {
            let after = &scan[m.end()..];
            !UNIT_AFTER_RE.is_match(after) || SECONDS_UNIT_RE.is_match(after)
        })
        .map(|m| (m.start(), m.as_str().to_string()))
}

use std::sync::LazyLock;

use regex::Regex;

static MINUTES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2}):([0-5]\d)\.(\d{1,3})$").unwrap());
static SECONDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})\.(\d{1,3})$").unwrap());

/// Parse `M:SS.mmm` or `SS.mmm` into milliseconds. `1'23.4` is read as `1:23.400`.
pub fn parse_to_ms(text: &str) -> Option<u32> {
    let text = text.trim().replace(['\'', '’', '′'], ":");

    if let Some(caps) = MINUTES_RE.captures(&text) {
        let minutes: u32 = caps[1].parse().ok()?;
        let seconds: u32 = caps[2].parse().ok()?;
        return Some(minutes * 60_000 + seconds * 1000 + fraction_ms(&caps[3])?);
    }
    if let Some(caps) = SECONDS_RE.captures(&text) {
        let seconds: u32 = caps[1].parse().ok()?;
        return Some(seconds * 1000 + fraction_ms(&caps[2])?);
    }
    None
}

/// ".4" → 400, ".45" → 450, ".456" → 456.
fn fraction_ms(digits: &str) -> Option<u32> {
    let value: u32 = digits.parse().ok()?;
    Some(value * 10u32.pow(3 - digits.len() as u32))
}

/// Exact millisecond text; minutes omitted below one minute. Inverse of [`parse_to_ms`].
pub fn format_from_ms(ms: u32) -> String {
    let minutes = ms / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let millis = ms % 1000;
    if minutes == 0 {
        format!("{}.{:03}", seconds, millis)
    } else {
        format!("{}:{:02}.{:03}", minutes, seconds, millis)
    }
}

/// Display form with hundredths, rounded half-up: 83456 → "1:23.46".
pub fn display_from_ms(ms: u32) -> String {
    let centis = (ms + 5) / 10;
    let minutes = centis / 6000;
    let seconds = (centis % 6000) / 100;
    let hundredths = centis % 100;
    if minutes == 0 {
        format!("{}.{:02}", seconds, hundredths)
    } else {
        format!("{}:{:02}.{:02}", minutes, seconds, hundredths)
    }
}

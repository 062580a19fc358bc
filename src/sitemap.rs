use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use tracing::info;

/// Track result pages: `/tracks/<slug>` with nothing after the slug.
pub const TRACK_PATTERN: &str = r"/tracks/[A-Za-z0-9][A-Za-z0-9_-]*/?$";

/// Fetch a sitemap and return the URLs matching `pattern`, in sitemap order.
pub async fn fetch_track_urls(sitemap_url: &str, pattern: &str) -> Result<Vec<String>> {
    let client = reqwest::Client::new();
    let re = Regex::new(pattern).with_context(|| format!("Invalid URL pattern {}", pattern))?;

    info!("Fetching sitemap: {}", sitemap_url);
    let xml = client
        .get(sitemap_url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
        .context("Failed to fetch sitemap")?;

    let all_urls = parse_urlset(&xml)?;
    info!("Total URLs in sitemap: {}", all_urls.len());

    let filtered: Vec<String> = all_urls.into_iter().filter(|url| re.is_match(url)).collect();
    info!("Track pages after filtering: {}", filtered.len());
    Ok(filtered)
}

/// `<loc>` text of every `<url>` entry. Namespace prefixes are ignored.
fn parse_urlset(xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut urls = Vec::new();
    let mut url_depth = 0usize;
    let mut loc: Option<String> = None;
    loop {
        match reader.read_event().context("Malformed sitemap XML")? {
            Event::Start(tag) => match tag.local_name().as_ref() {
                b"url" => url_depth += 1,
                b"loc" if url_depth > 0 => loc = Some(String::new()),
                _ => {}
            },
            Event::Text(text) => {
                if let Some(buf) = loc.as_mut() {
                    buf.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(buf) = loc.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::End(tag) => match tag.local_name().as_ref() {
                b"url" => url_depth = url_depth.saturating_sub(1),
                b"loc" => {
                    if let Some(found) = loc.take().filter(|u| !u.trim().is_empty()) {
                        urls.push(found.trim().to_string());
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(urls)
}

use super::{page_subject, parse_lines, ParsedPage};
use crate::fetch::Page;

/// A vehicle's page: the vehicle comes from the on-page title, never from the
/// query that found the page; each row names a track.
pub fn parse(page: &Page) -> ParsedPage {
    ParsedPage {
        subject: page_subject(&page.title),
        rows: parse_lines(page, |_, _| {}),
    }
}

use std::sync::LazyLock;

use regex::Regex;

use super::{page_subject, parse_lines, ParsedPage};
use crate::fetch::Page;

static POWER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{2,4}(?:[.,]\d+)?)\s*(bhp|hp|ps|kw)\b").unwrap()
});

/// A track's results page: the track comes from the title, each row names a vehicle.
pub fn parse(page: &Page) -> ParsedPage {
    let rows = parse_lines(page, |m, row| {
        row.rank = m.rank;
        row.power_hp = m
            .cells
            .iter()
            .find_map(|cell| power_hp(cell))
            .or_else(|| power_hp(&m.context));
    });
    ParsedPage {
        subject: page_subject(&page.title),
        rows,
    }
}

/// "503 hp" → 503, "370 kW" → 496, "500 PS" → 493
fn power_hp(text: &str) -> Option<u32> {
    let caps = POWER_RE.captures(text)?;
    let amount: f64 = caps[1].replace(',', ".").parse().ok()?;
    let hp = match caps[2].to_ascii_lowercase().as_str() {
        "kw" => amount * 1.341,
        "ps" => amount * 0.9863,
        _ => amount,
    };
    Some(hp.round() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Strategy;

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.md", name)).unwrap()
    }

    #[test]
    fn single_row() {
        let md = "# Test Circuit lap times\n\n| # | Car | Time |\n|---|---|---|\n| 1 | [Acme Falcon GT](/models/acme-falcon-gt) | [1:23.456](/tests/123) |\n";
        let page = Page::from_markdown("https://laps.example.com/tracks/test-track", None, md);
        let parsed = parse(&page);
        assert_eq!(parsed.subject, "Test Circuit");
        assert_eq!(parsed.rows.len(), 1);
        let row = &parsed.rows[0];
        assert_eq!(row.name, "Acme Falcon GT");
        assert_eq!(row.rank, Some(1));
        assert_eq!(row.lap_time_ms, 83_456);
        assert_eq!(row.source_url, "https://laps.example.com/tests/123");
    }

    #[test]
    fn power_units() {
        assert_eq!(power_hp("503 hp"), Some(503));
        assert_eq!(power_hp("370 kW"), Some(496));
        assert_eq!(power_hp("500 PS"), Some(493));
        assert_eq!(power_hp("fast"), None);
    }

    #[test]
    fn fixture_page() {
        let page = Page::from_markdown(
            "https://laps.example.com/tracks/test-track",
            None,
            &fixture("track_page"),
        );
        let parsed = parse(&page);
        assert_eq!(parsed.subject, "Test Circuit");
        let names: Vec<&str> = parsed.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Acme Falcon GT", "Zenith Comet RS (2019-2022)", "Porsche 911 GT3 4.0", "Acme Falcon GT"]
        );
        assert_eq!(parsed.rows[1].power_hp, Some(496));
        assert_eq!(parsed.rows[2].strategy, Strategy::Loose);
        assert!(!parsed.rows[3].is_stock);
        assert!(parsed.rows.iter().all(|r| r.source_url.starts_with("https://laps.example.com/")));
    }
}

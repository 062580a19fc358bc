use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Url;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{build_indexes, CatalogEntity, Indexes};
use crate::db::LapTimeRecord;
use crate::fetch::{FetchError, Pacer, Page, PageSource};
use crate::laptime::display_from_ms;
use crate::parser::table::FieldSchema;
use crate::parser::{page_subject, track_page, vehicle_page, ExtractedRow, ParsedPage, Strategy};
use crate::persist::{confidence, insert_if_new, upsert_track, InsertOutcome};
use crate::resolve::{resolve, MatchGuard, MatchStep};

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Pause between consecutive fetches.
    pub delay: Duration,
    /// Source site root, used to build search URLs.
    pub base_url: String,
    /// Max track pages (by-track) or vehicles (by-vehicle).
    pub limit: Option<usize>,
    pub pages_per_vehicle: usize,
    pub guard: MatchGuard,
}

/// Where a by-track run gets its page URLs.
#[derive(Debug, Clone)]
pub enum TrackPages {
    Urls(Vec<String>),
    /// An index page whose `/tracks/` links are the pages to scrape.
    Index(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunError {
    pub context: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub pages_processed: usize,
    pub lap_times_found: usize,
    pub lap_times_inserted: usize,
    pub lap_times_skipped: usize,
    pub tracks_created: usize,
    pub cars_matched: usize,
    pub cars_unmatched: BTreeSet<String>,
    pub tracks_unmatched: BTreeSet<String>,
    pub errors: Vec<RunError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    fn start() -> Self {
        Self {
            pages_processed: 0,
            lap_times_found: 0,
            lap_times_inserted: 0,
            lap_times_skipped: 0,
            tracks_created: 0,
            cars_matched: 0,
            cars_unmatched: BTreeSet::new(),
            tracks_unmatched: BTreeSet::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn print(&self) {
        println!("Pages processed:  {}", self.pages_processed);
        println!("Lap times found:  {}", self.lap_times_found);
        println!("  inserted:       {}", self.lap_times_inserted);
        println!("  skipped:        {}", self.lap_times_skipped);
        println!("Tracks created:   {}", self.tracks_created);
        println!("Cars matched:     {}", self.cars_matched);
        println!("Cars unmatched:   {}", self.cars_unmatched.len());
        for name in &self.cars_unmatched {
            println!("  {}", name);
        }
        if !self.tracks_unmatched.is_empty() {
            println!("Tracks unmatched: {}", self.tracks_unmatched.len());
            for name in &self.tracks_unmatched {
                println!("  {}", name);
            }
        }
        if !self.errors.is_empty() {
            println!("Errors:           {}", self.errors.len());
            for e in &self.errors {
                println!("  {}: {}", e.context, e.message);
            }
        }
    }
}

/// State of one run: the catalog snapshot, pacing and the running tally.
struct Run<'a, S> {
    conn: &'a Connection,
    source: &'a S,
    indexes: Indexes,
    guard: MatchGuard,
    pacer: Pacer,
    visited: HashSet<String>,
    summary: RunSummary,
}

impl<'a, S: PageSource> Run<'a, S> {
    fn new(conn: &'a Connection, source: &'a S, opts: &RunOptions) -> Result<Self> {
        Ok(Self {
            conn,
            source,
            indexes: build_indexes(conn)?,
            guard: opts.guard,
            pacer: Pacer::new(opts.delay),
            visited: HashSet::new(),
            summary: RunSummary::start(),
        })
    }

    fn record_error(&mut self, context: &str, message: impl ToString) {
        self.summary.errors.push(RunError {
            context: context.to_string(),
            message: message.to_string(),
        });
    }

    async fn fetch(&mut self, url: &str) -> Option<Page> {
        self.pacer.wait().await;
        match self.source.fetch_page(url).await {
            Ok(page) => Some(page),
            Err(e) => {
                warn!("Failed to fetch {}: {}", url, e);
                self.record_error(url, e);
                None
            }
        }
    }

    /// Resolve a track name, creating the track when allowed. The step is
    /// `Exact` for a track created here. An existing track reached through
    /// the slug must still pass the guard.
    fn track_for(&mut self, name: &str, may_create: bool, context: &str) -> Option<(i64, MatchStep)> {
        if let Some(found) = resolve(name, &self.indexes.tracks, &self.guard) {
            return Some((found.entity.id(), found.step));
        }
        if !may_create {
            debug!("Unmatched track {:?} on {}", name, context);
            self.summary.tracks_unmatched.insert(name.to_string());
            return None;
        }

        match upsert_track(self.conn, name, None, None) {
            Ok((track, created)) => {
                if !created && !self.guard.accepts(name, &track.name) {
                    warn!(
                        "Track {:?} shares slug {} with {:?}, leaving it unmatched",
                        name, track.slug, track.name
                    );
                    self.summary.tracks_unmatched.insert(name.to_string());
                    return None;
                }
                if created {
                    self.summary.tracks_created += 1;
                }
                let id = track.id;
                self.indexes.tracks.insert(track);
                Some((id, MatchStep::Exact))
            }
            Err(e) => {
                warn!("Track upsert failed for {:?}: {:#}", name, e);
                self.record_error(context, format!("{:#}", e));
                None
            }
        }
    }

    fn persist(&mut self, row: &ExtractedRow, vehicle_id: i64, track_id: i64, steps: &[MatchStep]) {
        let record = LapTimeRecord {
            vehicle_id,
            track_id,
            lap_time_ms: row.lap_time_ms,
            lap_time_text: display_from_ms(row.lap_time_ms),
            is_stock: row.is_stock,
            tire_info: row.tire_info.clone(),
            source_url: row.source_url.clone(),
            confidence_score: confidence(row.strategy, steps),
            verified: false,
        };
        match insert_if_new(self.conn, &record) {
            Ok(InsertOutcome::Inserted { .. }) => self.summary.lap_times_inserted += 1,
            Ok(InsertOutcome::Skipped { .. }) => self.summary.lap_times_skipped += 1,
            Err(e) => {
                warn!("{:#}", e);
                self.record_error(&row.source_url, format!("{:#}", e));
            }
        }
    }

    /// A page must name what it is about before any of its rows count.
    fn check_subject(&mut self, url: &str, parsed: &ParsedPage) -> bool {
        self.summary.pages_processed += 1;
        self.summary.lap_times_found += parsed.rows.len();
        if parsed.rows.is_empty() {
            debug!("No lap times on {}", url);
            return false;
        }
        if parsed.subject.is_empty() {
            warn!("No title on {}, skipping {} rows", url, parsed.rows.len());
            self.record_error(url, "page has no title");
            return false;
        }
        true
    }

    /// Track from the page, vehicle per row.
    fn process_track_page(&mut self, url: &str, parsed: ParsedPage) {
        if !self.check_subject(url, &parsed) {
            return;
        }
        let Some((track_id, track_step)) = self.track_for(&parsed.subject, true, url) else {
            return;
        };

        for row in &parsed.rows {
            let Some(found) = resolve(&row.name, &self.indexes.vehicles, &self.guard) else {
                debug!("Unmatched vehicle {:?} on {}", row.name, url);
                self.summary.cars_unmatched.insert(row.name.clone());
                continue;
            };
            let (vehicle_id, vehicle_step) = (found.entity.id(), found.step);
            self.summary.cars_matched += 1;
            self.persist(row, vehicle_id, track_id, &[vehicle_step, track_step]);
        }
    }

    /// Vehicle from the page title, track per row. Nothing is stored for a
    /// page whose vehicle is not in the catalog.
    fn process_vehicle_page(&mut self, url: &str, parsed: ParsedPage) {
        if !self.check_subject(url, &parsed) {
            return;
        }
        let Some(found) = resolve(&parsed.subject, &self.indexes.vehicles, &self.guard) else {
            info!("Vehicle page {} is about {:?}, not in catalog", url, parsed.subject);
            self.summary.cars_unmatched.insert(parsed.subject.clone());
            return;
        };
        let (vehicle_id, vehicle_step) = (found.entity.id(), found.step);

        for row in &parsed.rows {
            let may_create = row.strategy != Strategy::Loose;
            let Some((track_id, track_step)) = self.track_for(&row.name, may_create, url) else {
                continue;
            };
            self.summary.cars_matched += 1;
            self.persist(row, vehicle_id, track_id, &[vehicle_step, track_step]);
        }
    }

    /// Track page links found on an index page, in page order.
    async fn discover_track_pages(&mut self, index_url: &str) -> Vec<String> {
        let Some(index) = self.fetch(index_url).await else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let urls: Vec<String> = index
            .links
            .into_iter()
            .filter(|link| is_track_link(link) && link != index_url)
            .filter(|link| seen.insert(link.clone()))
            .collect();
        info!("Found {} track pages on {}", urls.len(), index_url);
        urls
    }

    fn finish(mut self) -> RunSummary {
        self.summary.finished_at = Some(Utc::now());
        info!(
            "Run finished: {} pages, {} found, {} inserted, {} skipped, {} errors",
            self.summary.pages_processed,
            self.summary.lap_times_found,
            self.summary.lap_times_inserted,
            self.summary.lap_times_skipped,
            self.summary.errors.len()
        );
        self.summary
    }
}

fn is_track_link(url: &str) -> bool {
    url.contains("/tracks/")
}

fn is_vehicle_link(url: &str) -> bool {
    url.contains("/models/")
}

/// `{base}/search?q=<name>`
pub fn search_url(base_url: &str, query: &str) -> Result<String, FetchError> {
    let base = Url::parse(base_url).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", base_url, e)))?;
    let mut url = base
        .join("search")
        .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", base_url, e)))?;
    url.query_pairs_mut().append_pair("q", query);
    Ok(url.to_string())
}

fn progress_bar(len: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Scrape track pages: the track comes from each page, vehicles from its rows.
pub async fn run_by_track<S: PageSource>(
    conn: &Connection,
    source: &S,
    opts: &RunOptions,
    pages: TrackPages,
) -> Result<RunSummary> {
    let mut run = Run::new(conn, source, opts)?;

    let urls = match pages {
        TrackPages::Urls(urls) => urls,
        TrackPages::Index(index_url) => run.discover_track_pages(&index_url).await,
    };
    let mut seen = HashSet::new();
    let urls: Vec<String> = urls
        .into_iter()
        .filter(|u| seen.insert(u.clone()))
        .take(opts.limit.unwrap_or(usize::MAX))
        .collect();
    info!("Scraping {} track pages", urls.len());

    let pb = progress_bar(urls.len())?;
    for url in &urls {
        pb.set_message(url.clone());
        if let Some(page) = run.fetch(url).await {
            let parsed = track_page::parse(&page);
            run.process_track_page(&page.url, parsed);
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(run.finish())
}

/// Search the source for every catalog vehicle and scrape the vehicle pages it returns.
pub async fn run_by_vehicle<S: PageSource>(
    conn: &Connection,
    source: &S,
    opts: &RunOptions,
) -> Result<RunSummary> {
    let mut run = Run::new(conn, source, opts)?;
    let vehicles: Vec<String> = run
        .indexes
        .vehicles
        .entities()
        .iter()
        .take(opts.limit.unwrap_or(usize::MAX))
        .map(|v| v.name.clone())
        .collect();
    if run.indexes.vehicles.is_empty() {
        warn!("Vehicle catalog is empty, nothing to search for");
    }
    info!("Searching for {} vehicles", vehicles.len());

    let pb = progress_bar(vehicles.len())?;
    for name in &vehicles {
        pb.set_message(name.clone());
        let url = match search_url(&opts.base_url, name) {
            Ok(url) => url,
            Err(e) => {
                run.record_error(name, e);
                pb.inc(1);
                continue;
            }
        };
        let Some(results) = run.fetch(&url).await else {
            pb.inc(1);
            continue;
        };

        let mut taken = 0;
        for link in &results.links {
            if taken >= opts.pages_per_vehicle {
                break;
            }
            if !is_vehicle_link(link) || !run.visited.insert(link.clone()) {
                continue;
            }
            taken += 1;
            if let Some(page) = run.fetch(link).await {
                let parsed = vehicle_page::parse(&page);
                run.process_vehicle_page(&page.url, parsed);
            }
        }
        if taken == 0 {
            debug!("No new vehicle pages for {:?}", name);
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(run.finish())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Track,
    Vehicle,
}

/// One page: schema-guided table extraction first, markup parsing when that
/// finds nothing.
pub async fn run_single_page<S: PageSource>(
    conn: &Connection,
    source: &S,
    opts: &RunOptions,
    url: &str,
    kind: PageKind,
) -> Result<RunSummary> {
    let mut run = Run::new(conn, source, opts)?;
    let Some(page) = run.fetch(url).await else {
        return Ok(run.finish());
    };

    let schema = match kind {
        PageKind::Track => FieldSchema::track_page(),
        PageKind::Vehicle => FieldSchema::vehicle_page(),
    };
    run.pacer.wait().await;
    let structured = match source.extract_structured(url, &schema).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!("Structured extraction failed for {}: {}", url, e);
            run.record_error(url, e);
            Vec::new()
        }
    };

    let parsed = if structured.is_empty() {
        debug!("No results table on {}, parsing markup", url);
        match kind {
            PageKind::Track => track_page::parse(&page),
            PageKind::Vehicle => vehicle_page::parse(&page),
        }
    } else {
        info!("Read {} rows from the results table on {}", structured.len(), url);
        ParsedPage {
            subject: page_subject(&page.title),
            rows: structured,
        }
    };
    match kind {
        PageKind::Track => run.process_track_page(&page.url, parsed),
        PageKind::Vehicle => run.process_vehicle_page(&page.url, parsed),
    }

    Ok(run.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, CatalogFile, Track, Vehicle};
    use crate::fetch::testing::ScriptedSource;

    const BASE: &str = "https://laps.example.com";

    fn vehicle(slug: &str, name: &str) -> Vehicle {
        Vehicle {
            id: 0,
            slug: slug.into(),
            name: name.into(),
            make: None,
            year: None,
        }
    }

    fn track(slug: &str, name: &str) -> Track {
        Track {
            id: 0,
            slug: slug.into(),
            name: name.into(),
            country: None,
            length_km: None,
        }
    }

    fn opts() -> RunOptions {
        RunOptions {
            delay: Duration::ZERO,
            base_url: BASE.into(),
            limit: None,
            pages_per_vehicle: 3,
            guard: MatchGuard::default(),
        }
    }

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.md", name)).unwrap()
    }

    fn url(path: &str) -> String {
        format!("{}{}", BASE, path)
    }

    fn single_row_catalog() -> Connection {
        db::test_conn(&CatalogFile {
            vehicles: vec![vehicle("acme-falcon-gt", "Acme Falcon GT")],
            tracks: vec![track("test-circuit", "Test Circuit")],
        })
    }

    const SINGLE_ROW: &str = "| # | Car | Time |\n|---|---|---|\n| 1 | [Acme Falcon GT](/models/acme-falcon-gt) | [1:23.456](/tests/123) |\n";

    #[tokio::test]
    async fn track_page_end_to_end() {
        let conn = single_row_catalog();
        let source = ScriptedSource::default().with_page(&url("/tracks/test-circuit"), "Test Circuit lap times", SINGLE_ROW);

        let summary = run_by_track(&conn, &source, &opts(), TrackPages::Urls(vec![url("/tracks/test-circuit")]))
            .await
            .unwrap();
        assert_eq!(summary.pages_processed, 1);
        assert_eq!(summary.lap_times_found, 1);
        assert_eq!(summary.lap_times_inserted, 1);
        assert_eq!(summary.cars_matched, 1);
        assert_eq!(summary.tracks_created, 0);
        assert!(summary.errors.is_empty());
        assert!(summary.finished_at.is_some());

        let (ms, text, source_url, score, verified): (u32, String, String, f64, bool) = conn
            .query_row(
                "SELECT lap_time_ms, lap_time_text, source_url, confidence_score, verified FROM lap_times",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .unwrap();
        assert_eq!(ms, 83_456);
        assert_eq!(text, "1:23.46");
        assert_eq!(source_url, "https://laps.example.com/tests/123");
        assert_eq!(score, 0.9);
        assert!(!verified);
    }

    #[tokio::test]
    async fn unmatched_vehicle_is_reported_not_stored() {
        let conn = single_row_catalog();
        let md = "| 1 | [Unknown Brand Hovercar](/models/hovercar) | [1:23.456](/tests/9) |";
        let source = ScriptedSource::default().with_page(&url("/tracks/test-circuit"), "Test Circuit lap times", md);

        let summary = run_by_track(&conn, &source, &opts(), TrackPages::Urls(vec![url("/tracks/test-circuit")]))
            .await
            .unwrap();
        assert_eq!(summary.lap_times_found, 1);
        assert_eq!(summary.lap_times_inserted, 0);
        assert_eq!(summary.cars_matched, 0);
        assert_eq!(
            summary.cars_unmatched.iter().collect::<Vec<_>>(),
            vec!["Unknown Brand Hovercar"]
        );
        assert_eq!(db::get_stats(&conn).unwrap().lap_times, 0);
    }

    #[tokio::test]
    async fn fetch_failure_does_not_stop_run() {
        let conn = single_row_catalog();
        let source = ScriptedSource::default().with_page(&url("/tracks/test-circuit"), "Test Circuit lap times", SINGLE_ROW);
        let urls = vec![url("/tracks/gone"), url("/tracks/test-circuit")];

        let summary = run_by_track(&conn, &source, &opts(), TrackPages::Urls(urls)).await.unwrap();
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].context, url("/tracks/gone"));
        assert_eq!(summary.pages_processed, 1);
        assert_eq!(summary.lap_times_inserted, 1);
    }

    #[tokio::test]
    async fn rerun_skips_stored_times() {
        let conn = single_row_catalog();
        let source = ScriptedSource::default().with_page(&url("/tracks/test-circuit"), "Test Circuit lap times", SINGLE_ROW);
        let pages = TrackPages::Urls(vec![url("/tracks/test-circuit")]);

        run_by_track(&conn, &source, &opts(), pages.clone()).await.unwrap();
        let again = run_by_track(&conn, &source, &opts(), pages).await.unwrap();
        assert_eq!(again.lap_times_inserted, 0);
        assert_eq!(again.lap_times_skipped, 1);
        assert_eq!(db::get_stats(&conn).unwrap().lap_times, 1);
    }

    #[tokio::test]
    async fn track_fixture_resolves_every_row() {
        let conn = db::test_conn(&CatalogFile {
            vehicles: vec![
                vehicle("acme-falcon-gt", "Acme Falcon GT"),
                vehicle("zenith-comet-rs", "Zenith Comet RS"),
                vehicle("porsche-911-gt3", "Porsche 911 GT3"),
            ],
            tracks: vec![track("test-circuit", "Test Circuit")],
        });
        let source = ScriptedSource::default().with_page(&url("/tracks/test-circuit"), "", &fixture("track_page"));

        let summary = run_by_track(&conn, &source, &opts(), TrackPages::Urls(vec![url("/tracks/test-circuit")]))
            .await
            .unwrap();
        assert_eq!(summary.lap_times_found, 4);
        assert_eq!(summary.lap_times_inserted, 4);
        assert!(summary.cars_unmatched.is_empty());

        let modified: usize = conn
            .query_row("SELECT COUNT(*) FROM lap_times WHERE is_stock = 0", [], |r| r.get(0))
            .unwrap();
        assert_eq!(modified, 1);
    }

    #[tokio::test]
    async fn unknown_track_created_once_per_run() {
        let conn = single_row_catalog();
        let source = ScriptedSource::default()
            .with_page(&url("/tracks/new-a"), "Brand New Raceway lap times", SINGLE_ROW)
            .with_page(
                &url("/tracks/new-b"),
                "Brand New Raceway - LapDB",
                "| 1 | [Acme Falcon GT](/models/acme-falcon-gt) | [1:30.000](/tests/124) |",
            );
        let pages = TrackPages::Urls(vec![url("/tracks/new-a"), url("/tracks/new-b")]);

        let summary = run_by_track(&conn, &source, &opts(), pages).await.unwrap();
        assert_eq!(summary.tracks_created, 1);
        assert_eq!(summary.lap_times_inserted, 2);
        let created = db::find_track_by_slug(&conn, "brandnewraceway").unwrap().unwrap();
        let on_new: usize = conn
            .query_row("SELECT COUNT(*) FROM lap_times WHERE track_id = ?1", [created.id], |r| r.get(0))
            .unwrap();
        assert_eq!(on_new, 2);
    }

    #[tokio::test]
    async fn hyphenated_catalog_slug_does_not_capture_new_track() {
        let conn = db::test_conn(&CatalogFile {
            vehicles: vec![vehicle("acme-falcon-gt", "Acme Falcon GT")],
            tracks: vec![track("test-track", "Test Circuit")],
        });
        let source = ScriptedSource::default().with_page(&url("/tracks/test-track"), "Test Track lap times", SINGLE_ROW);

        let summary = run_by_track(&conn, &source, &opts(), TrackPages::Urls(vec![url("/tracks/test-track")]))
            .await
            .unwrap();
        assert_eq!(summary.tracks_created, 1);
        assert_eq!(summary.lap_times_inserted, 1);

        let created = db::find_track_by_slug(&conn, "testtrack").unwrap().unwrap();
        assert_eq!(created.name, "Test Track");
        let track_id: i64 = conn
            .query_row("SELECT track_id FROM lap_times", [], |r| r.get(0))
            .unwrap();
        assert_eq!(track_id, created.id);
    }

    #[tokio::test]
    async fn slug_collision_with_unrelated_track_is_unmatched() {
        let conn = db::test_conn(&CatalogFile {
            vehicles: vec![vehicle("acme-falcon-gt", "Acme Falcon GT")],
            tracks: vec![track("testtrack", "Test Circuit")],
        });
        let source = ScriptedSource::default().with_page(&url("/tracks/test-track"), "Test Track lap times", SINGLE_ROW);

        let summary = run_by_track(&conn, &source, &opts(), TrackPages::Urls(vec![url("/tracks/test-track")]))
            .await
            .unwrap();
        assert_eq!(summary.lap_times_inserted, 0);
        assert_eq!(summary.cars_matched, 0);
        assert_eq!(summary.tracks_created, 0);
        assert_eq!(
            summary.tracks_unmatched.iter().collect::<Vec<_>>(),
            vec!["Test Track"]
        );
        assert_eq!(db::get_stats(&conn).unwrap().lap_times, 0);
        assert_eq!(db::get_stats(&conn).unwrap().tracks, 1);
    }

    #[tokio::test]
    async fn index_page_discovery() {
        let conn = single_row_catalog();
        let index = "[Test Circuit](/tracks/test-circuit) [Missing](/tracks/missing) [Again](/tracks/test-circuit) [About](/about)";
        let source = ScriptedSource::default()
            .with_page(&url("/tracks"), "All tracks", index)
            .with_page(&url("/tracks/test-circuit"), "Test Circuit lap times", SINGLE_ROW);

        let summary = run_by_track(&conn, &source, &opts(), TrackPages::Index(url("/tracks")))
            .await
            .unwrap();
        assert_eq!(
            *source.requests.borrow(),
            vec![url("/tracks"), url("/tracks/test-circuit"), url("/tracks/missing")]
        );
        assert_eq!(summary.lap_times_inserted, 1);
        assert_eq!(summary.errors.len(), 1);
    }

    #[tokio::test]
    async fn limit_caps_track_pages() {
        let conn = single_row_catalog();
        let source = ScriptedSource::default().with_page(&url("/tracks/test-circuit"), "Test Circuit lap times", SINGLE_ROW);
        let opts = RunOptions {
            limit: Some(1),
            ..opts()
        };
        let pages = TrackPages::Urls(vec![url("/tracks/test-circuit"), url("/tracks/other")]);

        let summary = run_by_track(&conn, &source, &opts, pages).await.unwrap();
        assert_eq!(source.requests.borrow().len(), 1);
        assert!(summary.errors.is_empty());
    }

    fn vehicle_catalog() -> Connection {
        db::test_conn(&CatalogFile {
            vehicles: vec![
                vehicle("acme-falcon-gt", "Acme Falcon GT"),
                vehicle("zenith-comet-rs", "Zenith Comet RS"),
            ],
            tracks: vec![
                track("test-track", "Test Circuit"),
                track("nordschleife", "Nürburgring Nordschleife"),
            ],
        })
    }

    #[tokio::test]
    async fn by_vehicle_creates_and_reuses_tracks() {
        let conn = vehicle_catalog();
        let source = ScriptedSource::default()
            .with_page(
                &url("/search?q=Acme+Falcon+GT"),
                "Search",
                "[Acme Falcon GT](/models/acme-falcon-gt)\n[Acme Falcon GT](/models/acme-falcon-gt)\n[News](/news/1)",
            )
            .with_page(&url("/models/acme-falcon-gt"), "", &fixture("vehicle_page"))
            .with_page(
                &url("/search?q=Zenith+Comet+RS"),
                "Search",
                "[Zenith Comet RS](/models/zenith-comet-rs)\n[Acme Falcon GT](/models/acme-falcon-gt)",
            )
            .with_page(
                &url("/models/zenith-comet-rs"),
                "Zenith Comet RS laptimes, specs and performance data",
                "| [Brand New Raceway](/tracks/brand-new-raceway) | [1:50.000](/tests/300) |",
            );

        let summary = run_by_vehicle(&conn, &source, &opts()).await.unwrap();
        assert_eq!(summary.pages_processed, 2);
        assert_eq!(summary.lap_times_found, 5);
        assert_eq!(summary.lap_times_inserted, 4);
        assert_eq!(summary.cars_matched, 4);
        assert_eq!(summary.tracks_created, 1);
        assert_eq!(
            summary.tracks_unmatched.iter().collect::<Vec<_>>(),
            vec!["Kart Arena"]
        );
        assert!(summary.errors.is_empty());

        let acme_fetches = source
            .requests
            .borrow()
            .iter()
            .filter(|u| **u == url("/models/acme-falcon-gt"))
            .count();
        assert_eq!(acme_fetches, 1);

        let created = db::find_track_by_slug(&conn, "brandnewraceway").unwrap().unwrap();
        let on_new: usize = conn
            .query_row("SELECT COUNT(*) FROM lap_times WHERE track_id = ?1", [created.id], |r| r.get(0))
            .unwrap();
        assert_eq!(on_new, 2);
    }

    #[tokio::test]
    async fn vehicle_page_subject_decides_attribution() {
        let conn = vehicle_catalog();
        let source = ScriptedSource::default()
            .with_page(
                &url("/search?q=Acme+Falcon+GT"),
                "Search",
                "[Zenith](/models/zenith-comet-rs) [Mystery](/models/mystery)",
            )
            .with_page(
                &url("/models/zenith-comet-rs"),
                "Zenith Comet RS laptimes, specs and performance data",
                "| [Test Circuit](/tracks/test-track) | [1:30.000](/tests/5) |",
            )
            .with_page(
                &url("/models/mystery"),
                "Mystery Machine laptimes",
                "| [Test Circuit](/tracks/test-track) | [1:40.000](/tests/6) |",
            );
        let opts = RunOptions {
            limit: Some(1),
            ..opts()
        };

        let summary = run_by_vehicle(&conn, &source, &opts).await.unwrap();
        assert_eq!(summary.lap_times_inserted, 1);
        assert_eq!(
            summary.cars_unmatched.iter().collect::<Vec<_>>(),
            vec!["Mystery Machine"]
        );

        let vehicle_id: i64 = conn
            .query_row("SELECT vehicle_id FROM lap_times", [], |r| r.get(0))
            .unwrap();
        assert_eq!(vehicle_id, 2);
    }

    #[tokio::test]
    async fn pages_per_vehicle_caps_candidates() {
        let conn = vehicle_catalog();
        let source = ScriptedSource::default().with_page(
            &url("/search?q=Acme+Falcon+GT"),
            "Search",
            "[a](/models/a) [b](/models/b) [c](/models/c)",
        );
        let opts = RunOptions {
            limit: Some(1),
            pages_per_vehicle: 2,
            ..opts()
        };

        let summary = run_by_vehicle(&conn, &source, &opts).await.unwrap();
        assert_eq!(source.requests.borrow().len(), 3);
        assert_eq!(summary.errors.len(), 2);
    }

    #[tokio::test]
    async fn single_page_prefers_results_table() {
        let conn = db::test_conn(&CatalogFile {
            vehicles: vec![
                vehicle("acme-falcon-gt", "Acme Falcon GT"),
                vehicle("zenith-comet-rs", "Zenith Comet RS"),
                vehicle("porsche-911-gt3", "Porsche 911 GT3"),
            ],
            tracks: vec![track("test-circuit", "Test Circuit")],
        });
        let page_url = url("/tracks/test-circuit");
        let source = ScriptedSource::default().with_page(&page_url, "", &fixture("track_page"));

        let summary = run_single_page(&conn, &source, &opts(), &page_url, PageKind::Track).await.unwrap();
        assert_eq!(summary.lap_times_inserted, 4);
        assert_eq!(source.requests.borrow().len(), 2);

        let min_score: f64 = conn
            .query_row("SELECT MIN(confidence_score) FROM lap_times", [], |r| r.get(0))
            .unwrap();
        assert!(min_score > 0.7);
    }

    #[tokio::test]
    async fn single_page_falls_back_to_markup() {
        let conn = single_row_catalog();
        let page_url = url("/tracks/test-circuit");
        let source = ScriptedSource::default().with_page(
            &page_url,
            "Test Circuit lap times",
            "Fastest: [1:23.456](/tests/9) by [Acme Falcon GT](/models/acme-falcon-gt)",
        );

        let summary = run_single_page(&conn, &source, &opts(), &page_url, PageKind::Track).await.unwrap();
        assert_eq!(summary.lap_times_inserted, 1);
        let score: f64 = conn
            .query_row("SELECT confidence_score FROM lap_times", [], |r| r.get(0))
            .unwrap();
        assert_eq!(score, 0.7);
    }

    #[tokio::test]
    async fn single_vehicle_page_reads_track_table() {
        let conn = vehicle_catalog();
        let page_url = url("/models/acme-falcon-gt");
        let source = ScriptedSource::default().with_page(&page_url, "", &fixture("vehicle_page"));

        let summary = run_single_page(&conn, &source, &opts(), &page_url, PageKind::Vehicle)
            .await
            .unwrap();
        // The loose "Kart Arena" line sits outside the table.
        assert_eq!(summary.lap_times_found, 3);
        assert_eq!(summary.lap_times_inserted, 3);
        assert_eq!(summary.tracks_created, 1);

        let tires: String = conn
            .query_row(
                "SELECT tire_info FROM lap_times WHERE tire_info IS NOT NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tires, "Michelin Pilot Sport Cup 2");
    }

    #[test]
    fn search_urls() {
        assert_eq!(
            search_url("https://laps.example.com", "Acme Falcon GT").unwrap(),
            "https://laps.example.com/search?q=Acme+Falcon+GT"
        );
        assert!(matches!(search_url("not a url", "x"), Err(FetchError::InvalidUrl(_))));
    }
}

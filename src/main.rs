mod catalog;
mod config;
mod db;
mod fetch;
mod laptime;
mod normalize;
mod parser;
mod persist;
mod pipeline;
mod resolve;
mod sitemap;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use config::Config;
use fetch::SpiderSource;
use pipeline::{PageKind, RunSummary, TrackPages};

#[derive(Parser)]
#[command(name = "laptime_ingest", about = "Lap-time ingestion into a vehicle/track catalog via spider.cloud")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// SQLite database path (env: LAPTIME_DB)
    #[arg(long, global = true)]
    db: Option<String>,
    /// Source site root used for searches (env: LAPTIME_SOURCE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Pause between fetches in milliseconds (env: LAPTIME_DELAY_MS)
    #[arg(long, global = true)]
    delay_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Load vehicles and tracks from a JSON catalog file
    ImportCatalog {
        file: PathBuf,
    },
    /// Scrape track pages; each row names a vehicle
    ByTrack {
        /// Track page URL (repeatable)
        #[arg(long = "url")]
        urls: Vec<String>,
        /// Index page listing track pages
        #[arg(long, conflicts_with = "sitemap")]
        index: Option<String>,
        /// XML sitemap listing track pages
        #[arg(long)]
        sitemap: Option<String>,
        /// Max track pages to scrape
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Search for every catalog vehicle and scrape its pages
    ByVehicle {
        /// Max vehicles to search for
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Scrape a single page, a track page unless --vehicle is given
    Page {
        url: String,
        /// The page belongs to a vehicle; its rows name tracks
        #[arg(long)]
        vehicle: bool,
        #[arg(long)]
        json: bool,
    },
    /// Stored lap times
    List {
        /// Only this track (slug)
        #[arg(short, long)]
        track: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Show catalog and lap-time counts
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let config = Config::from_env().with_overrides(
        cli.global.db,
        cli.global.base_url,
        cli.global.delay_ms,
    );

    let conn = db::connect(&config.db_path)?;
    db::init_schema(&conn)?;

    let result = match cli.command {
        Commands::Init => {
            println!("Schema ready in {}", config.db_path);
            Ok(())
        }
        Commands::ImportCatalog { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let catalog: db::CatalogFile = serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            let (vehicles, tracks) = db::import_catalog(&conn, &catalog)?;
            println!(
                "Imported {} vehicles and {} tracks ({} and {} in file)",
                vehicles,
                tracks,
                catalog.vehicles.len(),
                catalog.tracks.len()
            );
            Ok(())
        }
        Commands::ByTrack { urls, index, sitemap, limit, json } => {
            let pages = match (sitemap, index) {
                (Some(sitemap_url), _) => {
                    let mut found = sitemap::fetch_track_urls(&sitemap_url, sitemap::TRACK_PATTERN).await?;
                    found.extend(urls);
                    TrackPages::Urls(found)
                }
                (None, Some(index_url)) => TrackPages::Index(index_url),
                (None, None) if !urls.is_empty() => TrackPages::Urls(urls),
                (None, None) => bail!("Give track pages with --url, --index or --sitemap"),
            };
            let source = SpiderSource::new(&config::spider_api_key()?)?;
            let summary =
                pipeline::run_by_track(&conn, &source, &config.run_options(limit), pages).await?;
            report(&summary, json)
        }
        Commands::ByVehicle { limit, json } => {
            let source = SpiderSource::new(&config::spider_api_key()?)?;
            let summary = pipeline::run_by_vehicle(&conn, &source, &config.run_options(limit)).await?;
            report(&summary, json)
        }
        Commands::Page { url, vehicle, json } => {
            let kind = if vehicle { PageKind::Vehicle } else { PageKind::Track };
            let source = SpiderSource::new(&config::spider_api_key()?)?;
            let summary =
                pipeline::run_single_page(&conn, &source, &config.run_options(None), &url, kind)
                    .await?;
            report(&summary, json)
        }
        Commands::List { track, limit } => {
            let rows = db::fetch_lap_times(&conn, track.as_deref(), limit)?;
            if rows.is_empty() {
                println!("No lap times stored.");
                return Ok(());
            }

            println!(
                "{:>3} | {:<24} | {:<28} | {:>9} | {:>4} | {:<3} | {}",
                "#", "Track", "Vehicle", "Time", "Conf", "Ver", "Source"
            );
            println!("{}", "-".repeat(110));
            for (i, r) in rows.iter().enumerate() {
                println!(
                    "{:>3} | {:<24} | {:<28} | {:>9} | {:>4.2} | {:<3} | {}",
                    i + 1,
                    truncate(&r.track, 24),
                    truncate(&r.vehicle, 28),
                    r.lap_time_text,
                    r.confidence_score,
                    if r.verified { "yes" } else { "no" },
                    r.source_url
                );
            }
            println!("\n{} lap times", rows.len());
            Ok(())
        }
        Commands::Stats => {
            let s = db::get_stats(&conn)?;
            println!("Vehicles:   {}", s.vehicles);
            println!("Tracks:     {}", s.tracks);
            println!("Lap times:  {}", s.lap_times);
            println!("Unverified: {}", s.unverified);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn report(summary: &RunSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        summary.print();
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

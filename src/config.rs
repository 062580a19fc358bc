use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::pipeline::RunOptions;
use crate::resolve::MatchGuard;

pub const DEFAULT_DB_PATH: &str = "data/laptimes.db";
pub const DEFAULT_SOURCE_URL: &str = "https://fastestlaps.com";
pub const DEFAULT_DELAY_MS: u64 = 1500;
pub const PAGES_PER_VEHICLE: usize = 3;

/// Settings for one invocation: constants, then environment, then CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub base_url: String,
    pub delay: Duration,
    pub pages_per_vehicle: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            base_url: DEFAULT_SOURCE_URL.to_string(),
            delay: Duration::from_millis(DEFAULT_DELAY_MS),
            pages_per_vehicle: PAGES_PER_VEHICLE,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("LAPTIME_DB") {
            config.db_path = path;
        }
        if let Ok(url) = std::env::var("LAPTIME_SOURCE_URL") {
            config.base_url = url;
        }
        if let Ok(ms) = std::env::var("LAPTIME_DELAY_MS") {
            match parse_delay(&ms) {
                Some(delay) => config.delay = delay,
                None => warn!("Ignoring LAPTIME_DELAY_MS={:?}, using {}ms", ms, DEFAULT_DELAY_MS),
            }
        }
        config
    }

    /// Flags given on the command line win over everything else.
    pub fn with_overrides(
        mut self,
        db_path: Option<String>,
        base_url: Option<String>,
        delay_ms: Option<u64>,
    ) -> Self {
        if let Some(path) = db_path {
            self.db_path = path;
        }
        if let Some(url) = base_url {
            self.base_url = url;
        }
        if let Some(ms) = delay_ms {
            self.delay = Duration::from_millis(ms);
        }
        self
    }

    pub fn run_options(&self, limit: Option<usize>) -> RunOptions {
        RunOptions {
            delay: self.delay,
            base_url: self.base_url.clone(),
            limit,
            pages_per_vehicle: self.pages_per_vehicle,
            guard: MatchGuard::default(),
        }
    }
}

pub fn spider_api_key() -> Result<String> {
    std::env::var("SPIDER_API_KEY")
        .map_err(|_| anyhow::anyhow!("SPIDER_API_KEY environment variable must be set"))
}

fn parse_delay(value: &str) -> Option<Duration> {
    value.trim().parse().ok().map(Duration::from_millis)
}

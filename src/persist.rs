use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::db::{self, LapTimeRecord, Track};
use crate::laptime::format_from_ms;
use crate::normalize::normalize;
use crate::parser::Strategy;
use crate::resolve::MatchStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { id: i64 },
    Skipped { existing_id: i64 },
}

/// Write `record` unless the same (vehicle, track, time) triple is already stored.
pub fn insert_if_new(conn: &Connection, record: &LapTimeRecord) -> Result<InsertOutcome> {
    if let Some(existing_id) =
        db::find_lap_time(conn, record.vehicle_id, record.track_id, record.lap_time_ms)?
    {
        debug!(
            "Lap time {} for vehicle {} on track {} already stored as #{}",
            format_from_ms(record.lap_time_ms),
            record.vehicle_id,
            record.track_id,
            existing_id
        );
        return Ok(InsertOutcome::Skipped { existing_id });
    }

    let id = db::insert_lap_time(conn, record).with_context(|| {
        format!(
            "Failed to insert lap time {} for vehicle {} on track {}",
            record.lap_time_text, record.vehicle_id, record.track_id
        )
    })?;
    Ok(InsertOutcome::Inserted { id })
}

/// Find or create the track whose slug is the normalized name. Returns the
/// stored row and whether this call created it.
pub fn upsert_track(
    conn: &Connection,
    name: &str,
    country: Option<&str>,
    length_km: Option<f64>,
) -> Result<(Track, bool)> {
    let slug = normalize(name);
    if slug.is_empty() {
        return Err(anyhow!("Track name {:?} has no usable slug", name));
    }

    let created = db::insert_track_if_absent(conn, &slug, name.trim(), country, length_km)
        .with_context(|| format!("Failed to create track {}", slug))?;
    let track = db::find_track_by_slug(conn, &slug)?
        .ok_or_else(|| anyhow!("Track {} missing after upsert", slug))?;

    if created {
        info!("Created track {} ({})", track.name, track.slug);
    }
    Ok((track, created))
}

/// Strategy weight times the weakest resolution step, two decimals.
pub fn confidence(strategy: Strategy, steps: &[MatchStep]) -> f64 {
    let weakest = steps
        .iter()
        .map(|s| s.weight())
        .fold(1.0_f64, f64::min);
    (strategy.weight() * weakest * 100.0).round() / 100.0
}

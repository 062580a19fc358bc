use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;

pub fn connect(path: &str) -> Result<Connection> {
    if let Some(dir) = std::path::Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create database directory {}", dir.display()))?;
        }
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS vehicles (
            id         INTEGER PRIMARY KEY,
            slug       TEXT UNIQUE NOT NULL,
            name       TEXT NOT NULL,
            make       TEXT,
            year       INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS tracks (
            id         INTEGER PRIMARY KEY,
            slug       TEXT UNIQUE NOT NULL,
            name       TEXT NOT NULL,
            country    TEXT,
            length_km  REAL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS lap_times (
            id               INTEGER PRIMARY KEY,
            vehicle_id       INTEGER NOT NULL REFERENCES vehicles(id),
            track_id         INTEGER NOT NULL REFERENCES tracks(id),
            lap_time_ms      INTEGER NOT NULL,
            lap_time_text    TEXT NOT NULL,
            is_stock         BOOLEAN NOT NULL DEFAULT 1,
            tire_info        TEXT,
            source_url       TEXT NOT NULL,
            confidence_score REAL NOT NULL,
            verified         BOOLEAN NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_lap_times_triple
            ON lap_times(vehicle_id, track_id, lap_time_ms);
        CREATE INDEX IF NOT EXISTS idx_lap_times_track ON lap_times(track_id);
        ",
    )?;
    Ok(())
}

// ── Catalog ──

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Vehicle {
    #[serde(default)]
    pub id: i64,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Track {
    #[serde(default)]
    pub id: i64,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub length_km: Option<f64>,
}

pub fn list_vehicles(conn: &Connection) -> Result<Vec<Vehicle>> {
    let mut stmt = conn.prepare("SELECT id, slug, name, make, year FROM vehicles ORDER BY id")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Vehicle {
                id: row.get(0)?,
                slug: row.get(1)?,
                name: row.get(2)?,
                make: row.get(3)?,
                year: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_tracks(conn: &Connection) -> Result<Vec<Track>> {
    let mut stmt =
        conn.prepare("SELECT id, slug, name, country, length_km FROM tracks ORDER BY id")?;
    let rows = stmt.query_map([], track_from_row)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn find_track_by_slug(conn: &Connection, slug: &str) -> Result<Option<Track>> {
    let track = conn
        .query_row(
            "SELECT id, slug, name, country, length_km FROM tracks WHERE slug = ?1",
            [slug],
            track_from_row,
        )
        .optional()?;
    Ok(track)
}

fn track_from_row(row: &rusqlite::Row) -> rusqlite::Result<Track> {
    Ok(Track {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        country: row.get(3)?,
        length_km: row.get(4)?,
    })
}

/// Insert a track unless its slug exists. Returns true when a row was written.
pub fn insert_track_if_absent(
    conn: &Connection,
    slug: &str,
    name: &str,
    country: Option<&str>,
    length_km: Option<f64>,
) -> Result<bool> {
    let changed = conn.execute(
        "INSERT INTO tracks (slug, name, country, length_km) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(slug) DO NOTHING",
        rusqlite::params![slug, name, country, length_km],
    )?;
    Ok(changed == 1)
}

#[derive(Debug, Default, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub vehicles: Vec<Vehicle>,
    #[serde(default)]
    pub tracks: Vec<Track>,
}

/// Seed the reference catalog. Existing slugs are left untouched.
pub fn import_catalog(conn: &Connection, catalog: &CatalogFile) -> Result<(usize, usize)> {
    let tx = conn.unchecked_transaction()?;
    let mut vehicles = 0;
    let mut tracks = 0;
    {
        let mut v_stmt = tx.prepare(
            "INSERT OR IGNORE INTO vehicles (slug, name, make, year) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for v in &catalog.vehicles {
            vehicles += v_stmt.execute(rusqlite::params![v.slug, v.name, v.make, v.year])?;
        }

        let mut t_stmt = tx.prepare(
            "INSERT OR IGNORE INTO tracks (slug, name, country, length_km) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for t in &catalog.tracks {
            tracks += t_stmt.execute(rusqlite::params![t.slug, t.name, t.country, t.length_km])?;
        }
    }
    tx.commit()?;
    Ok((vehicles, tracks))
}

// ── Lap times ──

#[derive(Debug, Clone, PartialEq)]
pub struct LapTimeRecord {
    pub vehicle_id: i64,
    pub track_id: i64,
    pub lap_time_ms: u32,
    pub lap_time_text: String,
    pub is_stock: bool,
    pub tire_info: Option<String>,
    pub source_url: String,
    pub confidence_score: f64,
    pub verified: bool,
}

pub fn find_lap_time(
    conn: &Connection,
    vehicle_id: i64,
    track_id: i64,
    lap_time_ms: u32,
) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM lap_times
             WHERE vehicle_id = ?1 AND track_id = ?2 AND lap_time_ms = ?3
             LIMIT 1",
            rusqlite::params![vehicle_id, track_id, lap_time_ms],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub fn insert_lap_time(conn: &Connection, r: &LapTimeRecord) -> Result<i64> {
    conn.execute(
        "INSERT INTO lap_times
         (vehicle_id, track_id, lap_time_ms, lap_time_text, is_stock, tire_info,
          source_url, confidence_score, verified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            r.vehicle_id, r.track_id, r.lap_time_ms, r.lap_time_text, r.is_stock,
            r.tire_info, r.source_url, r.confidence_score, r.verified,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

// ── Listing ──

pub struct LapTimeListRow {
    pub track: String,
    pub vehicle: String,
    pub lap_time_text: String,
    pub confidence_score: f64,
    pub verified: bool,
    pub source_url: String,
}

pub fn fetch_lap_times(
    conn: &Connection,
    track_slug: Option<&str>,
    limit: usize,
) -> Result<Vec<LapTimeListRow>> {
    let sql = format!(
        "SELECT t.name, v.name, l.lap_time_text, l.confidence_score, l.verified, l.source_url
         FROM lap_times l
         JOIN tracks t ON t.id = l.track_id
         JOIN vehicles v ON v.id = l.vehicle_id
         WHERE ?1 IS NULL OR t.slug = ?1
         ORDER BY t.name, l.lap_time_ms
         LIMIT {}",
        limit
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([track_slug], |row| {
            Ok(LapTimeListRow {
                track: row.get(0)?,
                vehicle: row.get(1)?,
                lap_time_text: row.get(2)?,
                confidence_score: row.get(3)?,
                verified: row.get(4)?,
                source_url: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub vehicles: usize,
    pub tracks: usize,
    pub lap_times: usize,
    pub unverified: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let vehicles: usize = conn.query_row("SELECT COUNT(*) FROM vehicles", [], |r| r.get(0))?;
    let tracks: usize = conn.query_row("SELECT COUNT(*) FROM tracks", [], |r| r.get(0))?;
    let lap_times: usize = conn.query_row("SELECT COUNT(*) FROM lap_times", [], |r| r.get(0))?;
    let unverified: usize =
        conn.query_row("SELECT COUNT(*) FROM lap_times WHERE verified = 0", [], |r| r.get(0))?;
    Ok(Stats {
        vehicles,
        tracks,
        lap_times,
        unverified,
    })
}

#[cfg(test)]
pub(crate) fn test_conn(catalog: &CatalogFile) -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    init_schema(&conn).unwrap();
    import_catalog(&conn, catalog).unwrap();
    conn
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> CatalogFile {
        CatalogFile {
            vehicles: vec![Vehicle {
                id: 0,
                slug: "acme-falcon-gt".into(),
                name: "Acme Falcon GT".into(),
                make: Some("Acme".into()),
                year: None,
            }],
            tracks: vec![Track {
                id: 0,
                slug: "test-track".into(),
                name: "Test Circuit".into(),
                country: None,
                length_km: Some(4.2),
            }],
        }
    }

    #[test]
    fn import_is_idempotent() {
        let conn = test_conn(&catalog());
        assert_eq!(import_catalog(&conn, &catalog()).unwrap(), (0, 0));
        assert_eq!(list_vehicles(&conn).unwrap().len(), 1);
        assert_eq!(list_tracks(&conn).unwrap()[0].length_km, Some(4.2));
    }

    #[test]
    fn missing_track_is_none() {
        let conn = test_conn(&catalog());
        assert!(find_track_by_slug(&conn, "nowhere").unwrap().is_none());
        assert!(find_track_by_slug(&conn, "test-track").unwrap().is_some());
    }

    #[test]
    fn track_insert_respects_slug() {
        let conn = test_conn(&catalog());
        assert!(!insert_track_if_absent(&conn, "test-track", "Other", None, None).unwrap());
        assert!(insert_track_if_absent(&conn, "new-ring", "New Ring", Some("DE"), None).unwrap());
        assert_eq!(get_stats(&conn).unwrap().tracks, 2);
    }

    #[test]
    fn catalog_file_parses_without_ids() {
        let json = r#"{"vehicles":[{"slug":"a-b","name":"A B","year":2020}],"tracks":[{"slug":"t","name":"T"}]}"#;
        let parsed: CatalogFile = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.vehicles[0].year, Some(2020));
        assert_eq!(parsed.tracks[0].country, None);
    }
}

use std::collections::HashMap;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::info;

use crate::db::{self, Track, Vehicle};
use crate::normalize::{normalize, strip_year_suffix};

/// Anything the resolver can match a scraped name against.
pub trait CatalogEntity: Clone {
    fn id(&self) -> i64;
    fn name(&self) -> &str;
    fn slug(&self) -> &str;
}

impl CatalogEntity for Vehicle {
    fn id(&self) -> i64 {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn slug(&self) -> &str {
        &self.slug
    }
}

impl CatalogEntity for Track {
    fn id(&self) -> i64 {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn slug(&self) -> &str {
        &self.slug
    }
}

/// Normalized key → catalog entity. Built fresh for every run.
#[derive(Debug, Clone)]
pub struct ReferenceIndex<T> {
    entries: Vec<T>,
    keys: HashMap<String, usize>,
}

impl<T: CatalogEntity> ReferenceIndex<T> {
    pub fn build(entities: Vec<T>) -> Self {
        let mut index = Self {
            entries: Vec::with_capacity(entities.len()),
            keys: HashMap::with_capacity(entities.len() * 3),
        };
        for entity in entities {
            index.insert(entity);
        }
        index
    }

    /// Index under name, slug and year-stripped name. Later inserts win on collision.
    pub fn insert(&mut self, entity: T) {
        let pos = self.entries.len();
        let keys = [
            normalize(entity.name()),
            normalize(entity.slug()),
            normalize(strip_year_suffix(entity.name())),
        ];
        for key in keys {
            if !key.is_empty() {
                self.keys.insert(key, pos);
            }
        }
        self.entries.push(entity);
    }

    /// Look up an already-normalized key.
    pub fn get(&self, key: &str) -> Option<&T> {
        self.keys.get(key).map(|&pos| &self.entries[pos])
    }

    pub fn entities(&self) -> &[T] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn insert_key(&mut self, key: &str, entity: T) {
        self.keys.insert(key.to_string(), self.entries.len());
        self.entries.push(entity);
    }
}

pub struct Indexes {
    pub vehicles: ReferenceIndex<Vehicle>,
    pub tracks: ReferenceIndex<Track>,
}

/// Snapshot the catalog and index it. Failure here is fatal for a run.
pub fn build_indexes(conn: &Connection) -> Result<Indexes> {
    let vehicles = db::list_vehicles(conn).context("Failed to read vehicle catalog")?;
    let tracks = db::list_tracks(conn).context("Failed to read track catalog")?;
    let indexes = Indexes {
        vehicles: ReferenceIndex::build(vehicles),
        tracks: ReferenceIndex::build(tracks),
    };
    info!(
        "Indexed {} vehicles and {} tracks",
        indexes.vehicles.len(),
        indexes.tracks.len()
    );
    Ok(indexes)
}

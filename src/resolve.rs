use std::collections::HashSet;

use tracing::debug;

use crate::catalog::{CatalogEntity, ReferenceIndex};
use crate::normalize::{normalize, strip_spec_suffix, strip_year_suffix};

/// Which variant of the scraped name produced the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStep {
    Exact,
    YearStripped,
    SuffixStripped,
    MakeModel,
}

impl MatchStep {
    pub fn weight(self) -> f64 {
        match self {
            MatchStep::Exact => 1.0,
            MatchStep::YearStripped => 0.95,
            MatchStep::SuffixStripped => 0.85,
            MatchStep::MakeModel => 0.75,
        }
    }
}

#[derive(Debug)]
pub struct Resolution<'a, T> {
    pub entity: &'a T,
    pub step: MatchStep,
}

/// Evidence a lookup hit must show before it is accepted.
#[derive(Debug, Clone, Copy)]
pub struct MatchGuard {
    pub min_shared_tokens: usize,
    pub prefix_len: usize,
}

impl Default for MatchGuard {
    fn default() -> Self {
        Self {
            min_shared_tokens: 2,
            prefix_len: 15,
        }
    }
}

impl MatchGuard {
    pub fn accepts(&self, scraped: &str, catalog: &str) -> bool {
        if shared_tokens(scraped, catalog) >= self.min_shared_tokens {
            return true;
        }
        let a = normalize(scraped);
        let b = normalize(catalog);
        prefix_within(&a, &b, self.prefix_len) || prefix_within(&b, &a, self.prefix_len)
    }
}

fn tokens(name: &str) -> HashSet<String> {
    name.split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

fn shared_tokens(a: &str, b: &str) -> usize {
    tokens(a).intersection(&tokens(b)).count()
}

/// First `len` chars of `needle` occur in `haystack`. Keys are ASCII.
fn prefix_within(needle: &str, haystack: &str, len: usize) -> bool {
    let prefix = &needle[..needle.len().min(len)];
    !prefix.is_empty() && haystack.contains(prefix)
}

fn variants(raw: &str) -> [(MatchStep, String); 4] {
    let no_year = strip_year_suffix(raw);
    let make_model = raw.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
    [
        (MatchStep::Exact, normalize(raw)),
        (MatchStep::YearStripped, normalize(no_year)),
        (MatchStep::SuffixStripped, normalize(strip_spec_suffix(no_year))),
        (MatchStep::MakeModel, normalize(&make_model)),
    ]
}

/// Walk the name variants in order; the first hit `guard` accepts wins.
pub fn resolve<'a, T: CatalogEntity>(
    raw: &str,
    index: &'a ReferenceIndex<T>,
    guard: &MatchGuard,
) -> Option<Resolution<'a, T>> {
    let mut tried: Vec<String> = Vec::with_capacity(4);
    for (step, key) in variants(raw) {
        if key.is_empty() || tried.contains(&key) {
            continue;
        }
        if let Some(entity) = index.get(&key) {
            if guard.accepts(raw, entity.name()) {
                return Some(Resolution { entity, step });
            }
            debug!("Rejected {:?} match {:?} -> {:?}", step, raw, entity.name());
        }
        tried.push(key);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Vehicle;

    fn resolve<'a>(raw: &str, index: &'a ReferenceIndex<Vehicle>) -> Option<Resolution<'a, Vehicle>> {
        super::resolve(raw, index, &MatchGuard::default())
    }

    fn vehicle(id: i64, slug: &str, name: &str) -> Vehicle {
        Vehicle {
            id,
            slug: slug.into(),
            name: name.into(),
            make: None,
            year: None,
        }
    }

    fn index() -> ReferenceIndex<Vehicle> {
        ReferenceIndex::build(vec![
            vehicle(1, "acme-falcon-gt", "Acme Falcon GT"),
            vehicle(2, "porsche-911-gt3-992", "Porsche 911 GT3 (2021)"),
            vehicle(3, "audi-r8", "Audi R8"),
            vehicle(4, "bmw-m3", "BMW M3"),
        ])
    }

    #[test]
    fn exact() {
        let idx = index();
        let r = resolve("acme falcon gt", &idx).unwrap();
        assert_eq!(r.entity.id, 1);
        assert_eq!(r.step, MatchStep::Exact);
    }

    #[test]
    fn year_stripped() {
        let idx = index();
        let r = resolve("Acme Falcon GT (2019-2022)", &idx).unwrap();
        assert_eq!(r.entity.id, 1);
        assert_eq!(r.step, MatchStep::YearStripped);
    }

    #[test]
    fn suffix_stripped() {
        let idx = index();
        let r = resolve("Audi R8 5.2 V10", &idx).unwrap();
        assert_eq!(r.entity.id, 3);
        assert_eq!(r.step, MatchStep::SuffixStripped);
    }

    #[test]
    fn make_model() {
        let idx = index();
        let r = resolve("BMW M3 Competition xDrive", &idx).unwrap();
        assert_eq!(r.entity.id, 4);
        assert_eq!(r.step, MatchStep::MakeModel);
    }

    #[test]
    fn unknown_name() {
        let idx = index();
        assert!(resolve("Unknown Brand Hovercar", &idx).is_none());
        assert!(resolve("", &idx).is_none());
    }

    #[test]
    fn guard_rejects_collision_across_models() {
        let mut idx = index();
        // Force "Zenith Comet GT" onto an unrelated catalog entry.
        idx.insert_key(&normalize("Zenith Comet GT"), vehicle(1, "acme-falcon-gt", "Acme Falcon GT"));
        assert!(resolve("Zenith Comet GT", &idx).is_none());
    }

    #[test]
    fn guard_rules() {
        let guard = MatchGuard::default();
        assert!(guard.accepts("Porsche 911 GT3 RS", "Porsche 911 GT3"));
        assert!(guard.accepts("Nordschleife", "Nürburgring Nordschleife"));
        assert!(!guard.accepts("Zenith Comet GT", "Acme Falcon GT"));
        assert!(!guard.accepts("Porsche Cayenne", "Porsche 911 GT3"));
    }

    #[test]
    fn tunable_thresholds() {
        let strict = MatchGuard {
            min_shared_tokens: 3,
            prefix_len: 40,
        };
        assert!(!strict.accepts("Porsche 911 Turbo", "Porsche 911 GT3"));
        assert!(MatchGuard::default().accepts("Porsche 911 Turbo", "Porsche 911 GT3"));
    }
}

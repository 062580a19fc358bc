use std::sync::LazyLock;

use regex::Regex;

/// Brand/model spellings collapsed onto one token. Applied to the compacted
/// key, so sources are written without separators. Every replacement must be
/// strictly shorter than its source.
const SYNONYMS: &[(&str, &str)] = &[
    ("mercedesbenz", "mercedes"),
    ("mercedesamg", "mercedes"),
    ("volkswagen", "vw"),
    ("chevrolet", "chevy"),
    ("alfaromeo", "alfa"),
    ("astonmartin", "aston"),
    ("rollsroyce", "rolls"),
    ("lamborghini", "lambo"),
    ("bayerischemotorenwerke", "bmw"),
];

static YEAR_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*\(\s*\d{4}(?:\s*[-–/]\s*(?:\d{4}|\d{2}|present|now)?)?\s*\)\s*$").unwrap()
});

static SPEC_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s+(?:\d+\.\d+\s*[a-z]{0,3}|[vw]\d{1,2}|\d{1,2}[- ]?cyl(?:inder)?)$").unwrap()
});

/// Canonical lookup key: lower-case, alphanumeric only, brand synonyms collapsed.
pub fn normalize(name: &str) -> String {
    let mut key: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    // Repeat until nothing changes; replacements only shrink the key.
    loop {
        let before = key.len();
        for (from, to) in SYNONYMS {
            if key.contains(from) {
                key = key.replace(from, to);
            }
        }
        if key.len() == before {
            break;
        }
    }
    key
}

/// Drop a trailing year or year-range parenthetical: "Golf R (2017-2020)" → "Golf R".
pub fn strip_year_suffix(name: &str) -> &str {
    match YEAR_SUFFIX_RE.find(name) {
        Some(m) => name[..m.start()].trim_end(),
        None => name.trim_end(),
    }
}

/// Drop trailing engine/displacement/cylinder tokens: "R8 5.2 V10" → "R8".
pub fn strip_spec_suffix(name: &str) -> &str {
    let mut rest = name.trim_end();
    while let Some(m) = SPEC_SUFFIX_RE.find(rest) {
        if m.start() == 0 {
            break;
        }
        rest = rest[..m.start()].trim_end();
    }
    rest
}

//! Composable predicates over composite keys.
//!
//! Filters decide which keys a rule touches. They are compiled once at
//! config-load time, are cheap to clone, and carry no mutable state. The
//! closed set of variants dispatches through [`Filter::filter`].
//!
//! One inherited contract worth calling out: [`Filter::Exclude`] returns
//! `true` when the key is *not* listed. Exclusion composes inside
//! [`Filter::Set`] disjunctions that treat `true` as "keep", so the polarity
//! must stay this way.

pub mod config;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use regex::bytes::Regex;

use crate::error::CoreResult;
use tsmfix_codec::key;

/// A predicate over composite keys (or key components, when nested inside
/// [`Filter::Measurement`] / [`Filter::RawSerie`]).
#[derive(Debug, Clone)]
pub enum Filter {
    /// True when the regex matches the bytes.
    Pattern(PatternFilter),
    /// True when the bytes equal one of the listed strings.
    Include(Vec<String>),
    /// True when the bytes equal none of the listed strings.
    Exclude(Vec<String>),
    /// True when some whole line of the backing file equals the bytes.
    File(FileFilter),
    /// OR of the configured string predicates.
    Strings(StringsFilter),
    /// Applied to composite keys: true when a listed tag is present and its
    /// value matches the associated regex.
    Where(WhereFilter),
    /// Applies the inner filter to the measurement component.
    Measurement(Box<Filter>),
    /// Applies the inner filter to the series-key prefix.
    RawSerie(Box<Filter>),
    /// Conjunction over the decomposed key.
    Serie(Box<SerieFilter>),
    /// Disjunction: true when any child is true.
    Set(Vec<Filter>),
    /// Always true.
    AlwaysTrue,
    /// Always false.
    AlwaysFalse,
    /// Always false; the reserved default for the global pre-filter, where
    /// "true" means "exclude" and so nothing is excluded.
    Pass,
}

/// Regex leaf. Kept as a named struct so rename rules can reuse the
/// compiled pattern for capture expansion.
#[derive(Debug, Clone)]
pub struct PatternFilter {
    /// The compiled pattern.
    pub pattern: Regex,
}

/// Whole-line membership of a file's contents.
#[derive(Debug, Clone)]
pub struct FileFilter {
    lines: BTreeSet<String>,
}

/// The string-ops leaf: any configured predicate matching makes it true.
#[derive(Debug, Clone, Default)]
pub struct StringsFilter {
    /// Substring containment.
    pub contains: Option<String>,
    /// Any of these characters present.
    pub contains_any: Option<String>,
    /// Exact equality.
    pub equal: Option<String>,
    /// Case-insensitive equality.
    pub equal_fold: Option<String>,
    /// Prefix match.
    pub has_prefix: Option<String>,
    /// Suffix match.
    pub has_suffix: Option<String>,
}

/// Tag-value predicates keyed by tag name.
#[derive(Debug, Clone)]
pub struct WhereFilter {
    where_: BTreeMap<String, Regex>,
}

/// Conjunction over measurement, series key and (optionally) field.
#[derive(Debug, Clone)]
pub struct SerieFilter {
    /// Applied to the measurement name.
    pub measurement: Filter,
    /// Applied to the series key (typically a `where` filter).
    pub tag: Filter,
    /// Applied to the field name; absent means "any field".
    pub field: Option<Filter>,
}

impl Filter {
    /// Compiles a regex pattern filter.
    pub fn pattern(pattern: &str) -> CoreResult<Self> {
        Ok(Filter::Pattern(PatternFilter {
            pattern: Regex::new(pattern)?,
        }))
    }

    /// Creates an include-list filter.
    pub fn include(includes: Vec<String>) -> Self {
        Filter::Include(includes)
    }

    /// Creates an exclude-list filter.
    pub fn exclude(excludes: Vec<String>) -> Self {
        Filter::Exclude(excludes)
    }

    /// Loads a file-membership filter from `path`.
    pub fn file(path: &Path) -> CoreResult<Self> {
        let file = File::open(path)?;
        let mut lines = BTreeSet::new();
        for line in BufReader::new(file).lines() {
            lines.insert(line?);
        }
        Ok(Filter::File(FileFilter { lines }))
    }

    /// Creates a where filter from `tag → regex` pairs.
    pub fn where_tags(pairs: BTreeMap<String, String>) -> CoreResult<Self> {
        let mut where_ = BTreeMap::new();
        for (tag, pattern) in pairs {
            where_.insert(tag, Regex::new(&pattern)?);
        }
        Ok(Filter::Where(WhereFilter { where_ }))
    }

    /// Wraps `inner` so it applies to the measurement component.
    pub fn measurement(inner: Filter) -> Self {
        Filter::Measurement(Box::new(inner))
    }

    /// Wraps `inner` so it applies to the series-key prefix.
    pub fn raw_serie(inner: Filter) -> Self {
        Filter::RawSerie(Box::new(inner))
    }

    /// Evaluates the predicate against `key`.
    pub fn filter(&self, key: &[u8]) -> bool {
        match self {
            Filter::Pattern(f) => f.pattern.is_match(key),
            Filter::Include(includes) => includes.iter().any(|s| s.as_bytes() == key),
            Filter::Exclude(excludes) => excludes.iter().all(|s| s.as_bytes() != key),
            Filter::File(f) => {
                let text = String::from_utf8_lossy(key);
                f.lines.contains(text.as_ref())
            }
            Filter::Strings(f) => f.matches(key),
            Filter::Where(f) => f.matches(key),
            Filter::Measurement(inner) => {
                let measurement = key::measurement_from_composite(key);
                inner.filter(measurement.as_bytes())
            }
            Filter::RawSerie(inner) => {
                let (series_key, _) = key::series_and_field(key);
                inner.filter(series_key)
            }
            Filter::Serie(f) => f.matches(key),
            Filter::Set(children) => children.iter().any(|f| f.filter(key)),
            Filter::AlwaysTrue => true,
            Filter::AlwaysFalse | Filter::Pass => false,
        }
    }
}

impl StringsFilter {
    /// Returns true if at least one predicate is configured.
    pub fn is_configured(&self) -> bool {
        self.contains.is_some()
            || self.contains_any.is_some()
            || self.equal.is_some()
            || self.equal_fold.is_some()
            || self.has_prefix.is_some()
            || self.has_suffix.is_some()
    }

    fn matches(&self, key: &[u8]) -> bool {
        let text = String::from_utf8_lossy(key);

        if let Some(s) = &self.contains {
            if text.contains(s.as_str()) {
                return true;
            }
        }
        if let Some(s) = &self.contains_any {
            if text.chars().any(|c| s.contains(c)) {
                return true;
            }
        }
        if let Some(s) = &self.equal {
            if text == s.as_str() {
                return true;
            }
        }
        if let Some(s) = &self.equal_fold {
            if text.eq_ignore_ascii_case(s) {
                return true;
            }
        }
        if let Some(s) = &self.has_prefix {
            if text.starts_with(s.as_str()) {
                return true;
            }
        }
        if let Some(s) = &self.has_suffix {
            if text.ends_with(s.as_str()) {
                return true;
            }
        }

        false
    }
}

impl WhereFilter {
    fn matches(&self, composite: &[u8]) -> bool {
        let (series_key, _) = key::series_and_field(composite);
        let (_, tags) = key::parse_key(series_key);

        for tag in &tags {
            let name = String::from_utf8_lossy(&tag.key);
            if let Some(re) = self.where_.get(name.as_ref()) {
                if re.is_match(&tag.value) {
                    return true;
                }
            }
        }

        false
    }
}

impl SerieFilter {
    fn matches(&self, composite: &[u8]) -> bool {
        let (series_key, field) = key::series_and_field(composite);
        let (measurement, _) = key::parse_key(series_key);

        if !self.measurement.filter(measurement.as_bytes()) {
            return false;
        }
        if !self.tag.filter(series_key) {
            return false;
        }
        match &self.field {
            Some(f) => f.filter(field),
            None => true,
        }
    }
}

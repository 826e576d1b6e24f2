//! Filter configuration and registry.
//!
//! Every registered filter has a config type that knows how to populate
//! itself from a TOML sub-table and how to build the compiled [`Filter`].
//! There is no runtime reflection: each config names its own fields, and
//! fields holding nested filters are pulled out of the table explicitly via
//! [`take_filter`] before scalar values are read.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{CoreError, CoreResult};
use crate::filter::{Filter, SerieFilter, StringsFilter};

/// Configuration of a single filter, populated from its TOML sub-table.
pub trait FilterConfig {
    /// An example configuration, used for listings and self-tests.
    fn sample(&self) -> &'static str;

    /// Populates the config from its sub-table.
    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()>;

    /// Builds the compiled filter, validating the configuration.
    fn build(&self) -> CoreResult<Filter>;
}

type NewFilterFn = fn() -> Box<dyn FilterConfig>;

/// Name → config constructor map for filters.
///
/// Registering the same name twice is a programming bug and panics.
pub struct FilterRegistry {
    builders: BTreeMap<&'static str, NewFilterFn>,
}

impl FilterRegistry {
    /// Creates a registry holding every built-in filter.
    pub fn builtin() -> Self {
        let mut registry = Self {
            builders: BTreeMap::new(),
        };
        registry.register("exclude", || Box::<ExcludeFilterConfig>::default());
        registry.register("file", || Box::<FileFilterConfig>::default());
        registry.register("include", || Box::<IncludeFilterConfig>::default());
        registry.register("pass", || Box::<PassFilterConfig>::default());
        registry.register("pattern", || Box::<PatternFilterConfig>::default());
        registry.register("serie", || Box::<SerieFilterConfig>::default());
        registry.register("strings", || Box::<StringsFilterConfig>::default());
        registry.register("where", || Box::<WhereFilterConfig>::default());
        registry
    }

    /// Registers a filter; panics if the name is taken.
    pub fn register(&mut self, name: &'static str, f: NewFilterFn) {
        if self.builders.insert(name, f).is_some() {
            panic!("filter {name} has already been registered");
        }
    }

    /// Creates a fresh config for `name`.
    pub fn create(&self, name: &str) -> CoreResult<Box<dyn FilterConfig>> {
        self.builders
            .get(name)
            .map(|f| f())
            .ok_or_else(|| CoreError::unknown_filter(name))
    }

    /// Iterates registered names in canonical (sorted) order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.builders.keys().copied()
    }
}

/// Removes `key` from `table`, matching case-insensitively.
pub(crate) fn take_value(table: &mut toml::Table, key: &str) -> Option<toml::Value> {
    let found = table.keys().find(|k| k.eq_ignore_ascii_case(key)).cloned()?;
    table.remove(&found)
}

/// Removes a string value from `table`.
pub(crate) fn take_str(table: &mut toml::Table, key: &str) -> CoreResult<Option<String>> {
    match take_value(table, key) {
        None => Ok(None),
        Some(toml::Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(CoreError::invalid_value(
            key,
            format!("expected a string, got {}", other.type_str()),
        )),
    }
}

/// Removes a boolean value from `table`.
pub(crate) fn take_bool(table: &mut toml::Table, key: &str) -> CoreResult<Option<bool>> {
    match take_value(table, key) {
        None => Ok(None),
        Some(toml::Value::Boolean(b)) => Ok(Some(b)),
        Some(other) => Err(CoreError::invalid_value(
            key,
            format!("expected a boolean, got {}", other.type_str()),
        )),
    }
}

/// Removes a string-array value from `table`.
pub(crate) fn take_str_array(table: &mut toml::Table, key: &str) -> CoreResult<Option<Vec<String>>> {
    match take_value(table, key) {
        None => Ok(None),
        Some(toml::Value::Array(items)) => {
            let mut strings = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    toml::Value::String(s) => strings.push(s),
                    other => {
                        return Err(CoreError::invalid_value(
                            key,
                            format!("expected an array of strings, got {}", other.type_str()),
                        ))
                    }
                }
            }
            Ok(Some(strings))
        }
        Some(other) => Err(CoreError::invalid_value(
            key,
            format!("expected an array, got {}", other.type_str()),
        )),
    }
}

/// Extracts and builds the filter declared under the `field` key of a rule
/// or filter table.
///
/// The entry must be a table with exactly one child: the registered filter
/// name mapped to its own sub-table. Returns `Ok(None)` when the field is
/// absent.
pub fn take_filter(table: &mut toml::Table, field: &str) -> CoreResult<Option<Filter>> {
    let Some(value) = take_value(table, field) else {
        return Ok(None);
    };

    let sub = value
        .as_table()
        .ok_or_else(|| CoreError::invalid_filter(field, "expected a filter table"))?;

    if sub.len() != 1 {
        return Err(CoreError::invalid_filter(
            field,
            format!("expected exactly one filter, got {}", sub.len()),
        ));
    }

    let (filter_name, filter_value) = sub.iter().next().expect("length checked");
    let filter_table = filter_value
        .as_table()
        .ok_or_else(|| CoreError::invalid_filter(filter_name, "expected a table"))?;

    build_filter(filter_name, filter_table.clone()).map(Some)
}

/// Builds the named filter from its sub-table.
pub fn build_filter(name: &str, mut table: toml::Table) -> CoreResult<Filter> {
    let mut config = FilterRegistry::builtin().create(name)?;
    config.unmarshal(&mut table)?;
    config.build()
}

/// Config for [`Filter::Pattern`].
#[derive(Debug, Default)]
pub struct PatternFilterConfig {
    /// The regex source.
    pub pattern: String,
}

impl FilterConfig for PatternFilterConfig {
    fn sample(&self) -> &'static str {
        r#"
        pattern = "^(cpu|disk)$"
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        if let Some(pattern) = take_str(table, "pattern")? {
            self.pattern = pattern;
        }
        Ok(())
    }

    fn build(&self) -> CoreResult<Filter> {
        if self.pattern.is_empty() {
            return Err(CoreError::invalid_filter("pattern", "pattern must not be empty"));
        }
        Filter::pattern(&self.pattern)
    }
}

/// Config for [`Filter::Include`].
#[derive(Debug, Default)]
pub struct IncludeFilterConfig {
    /// The strings to include.
    pub includes: Vec<String>,
}

impl FilterConfig for IncludeFilterConfig {
    fn sample(&self) -> &'static str {
        r#"
        includes = ["cpu", "disk"]
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        if let Some(includes) = take_str_array(table, "includes")? {
            self.includes = includes;
        }
        Ok(())
    }

    fn build(&self) -> CoreResult<Filter> {
        Ok(Filter::include(self.includes.clone()))
    }
}

/// Config for [`Filter::Exclude`].
#[derive(Debug, Default)]
pub struct ExcludeFilterConfig {
    /// The strings to exclude.
    pub excludes: Vec<String>,
}

impl FilterConfig for ExcludeFilterConfig {
    fn sample(&self) -> &'static str {
        r#"
        excludes = ["mem"]
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        if let Some(excludes) = take_str_array(table, "excludes")? {
            self.excludes = excludes;
        }
        Ok(())
    }

    fn build(&self) -> CoreResult<Filter> {
        Ok(Filter::exclude(self.excludes.clone()))
    }
}

/// Config for [`Filter::File`].
#[derive(Debug, Default)]
pub struct FileFilterConfig {
    /// Path of the file whose lines form the membership set.
    pub path: String,
}

impl FilterConfig for FileFilterConfig {
    fn sample(&self) -> &'static str {
        r#"
        path = "series.log"
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        if let Some(path) = take_str(table, "path")? {
            self.path = path;
        }
        Ok(())
    }

    fn build(&self) -> CoreResult<Filter> {
        if self.path.is_empty() {
            return Err(CoreError::invalid_filter("file", "path must not be empty"));
        }
        Filter::file(Path::new(&self.path))
    }
}

/// Config for [`Filter::Strings`].
#[derive(Debug, Default)]
pub struct StringsFilterConfig {
    inner: StringsFilter,
}

impl FilterConfig for StringsFilterConfig {
    fn sample(&self) -> &'static str {
        r#"
        hasprefix = "linux."
        hassuffix = ".gauge"
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        self.inner.contains = take_str(table, "contains")?;
        self.inner.contains_any = take_str(table, "containsany")?;
        self.inner.equal = take_str(table, "equal")?;
        self.inner.equal_fold = take_str(table, "equalfold")?;
        self.inner.has_prefix = take_str(table, "hasprefix")?;
        self.inner.has_suffix = take_str(table, "hassuffix")?;
        Ok(())
    }

    fn build(&self) -> CoreResult<Filter> {
        if !self.inner.is_configured() {
            return Err(CoreError::invalid_filter(
                "strings",
                "expected at least one parameter, got 0",
            ));
        }
        Ok(Filter::Strings(self.inner.clone()))
    }
}

/// Config for [`Filter::Where`].
///
/// Unlike the other configs, the sub-table is free-form: every key is a tag
/// name mapped to a regex string.
#[derive(Debug, Default)]
pub struct WhereFilterConfig {
    /// Tag name → regex source.
    pub where_: BTreeMap<String, String>,
}

impl FilterConfig for WhereFilterConfig {
    fn sample(&self) -> &'static str {
        r#"
        cpu = "^(cpu0|cpu1)$"
        host = "my-host"
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        for (tag, value) in table.iter() {
            match value {
                toml::Value::String(pattern) => {
                    self.where_.insert(tag.clone(), pattern.clone());
                }
                other => {
                    return Err(CoreError::invalid_value(
                        tag,
                        format!("expected a string value, got {}", other.type_str()),
                    ))
                }
            }
        }
        Ok(())
    }

    fn build(&self) -> CoreResult<Filter> {
        Filter::where_tags(self.where_.clone())
    }
}

/// Config for [`Filter::Serie`].
#[derive(Debug, Default)]
pub struct SerieFilterConfig {
    /// Measurement filter (required).
    pub measurement: Option<Filter>,
    /// Tag filter (required), applied to the series key.
    pub tag: Option<Filter>,
    /// Field filter (optional).
    pub field: Option<Filter>,
}

impl FilterConfig for SerieFilterConfig {
    fn sample(&self) -> &'static str {
        r#"
        [measurement.strings]
            equal = "cpu"
        [tag.where]
            cpu = "cpu0"
        [field.pattern]
            pattern = "^(idle|usage_idle)$"
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        self.measurement = take_filter(table, "measurement")?;
        self.tag = take_filter(table, "tag")?;
        self.field = take_filter(table, "field")?;
        Ok(())
    }

    fn build(&self) -> CoreResult<Filter> {
        let measurement = self
            .measurement
            .clone()
            .ok_or(CoreError::MissingMeasurementFilter)?;
        let tag = self.tag.clone().ok_or(CoreError::MissingTagFilter)?;

        Ok(Filter::Serie(Box::new(SerieFilter {
            measurement,
            tag,
            field: self.field.clone(),
        })))
    }
}

/// Config for [`Filter::Pass`].
#[derive(Debug, Default)]
pub struct PassFilterConfig;

impl FilterConfig for PassFilterConfig {
    fn sample(&self) -> &'static str {
        "\n"
    }

    fn unmarshal(&mut self, _table: &mut toml::Table) -> CoreResult<()> {
        Ok(())
    }

    fn build(&self) -> CoreResult<Filter> {
        Ok(Filter::Pass)
    }
}

//! Renames measurements, moving their field index entries along.

use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};
use crate::filter::Filter;
use crate::filter::config::{take_filter, take_str};
use crate::logging::{LogBuffer, ScopedLogger};
use crate::rules::{Renamer, Rule, RuleConfig, STANDARD};
use crate::shard::ShardInfo;
use tsmfix_codec::{key, FieldIndex, Value};

/// Rewrites the measurement component of matching keys, keeping tags and
/// field untouched. At end of shard the old measurement's index entries are
/// recreated under the new name.
pub struct RenameMeasurementRule {
    filter: Filter,
    renamer: Renamer,
    renamed: BTreeMap<String, String>,
    logger: ScopedLogger,
}

impl RenameMeasurementRule {
    /// Creates a rule renaming measurements matched by `from`.
    pub fn new(from: Filter, renamer: Renamer, log: &LogBuffer) -> Self {
        Self {
            filter: Filter::measurement(from),
            renamer,
            renamed: BTreeMap::new(),
            logger: log.scoped("rename-measurement"),
        }
    }

    /// Returns the number of distinct measurements renamed so far in the
    /// current shard.
    pub fn count(&self) -> usize {
        self.renamed.len()
    }
}

impl Rule for RenameMeasurementRule {
    fn name(&self) -> &'static str {
        "rename-measurement"
    }

    fn check_mode(&mut self, _check: bool) {}

    fn flags(&self) -> u32 {
        STANDARD
    }

    fn filter_key(&self, _key: &[u8]) -> bool {
        true
    }

    fn start_shard(&mut self, _shard: &ShardInfo) -> bool {
        self.renamed.clear();
        true
    }

    fn end_shard(&mut self, index: &mut FieldIndex) -> CoreResult<()> {
        for (old_name, new_name) in std::mem::take(&mut self.renamed) {
            let old_fields = index.fields_by(&old_name).cloned().ok_or_else(|| {
                CoreError::invalid_value(
                    old_name.clone(),
                    "could not find fields in index for renamed measurement",
                )
            })?;

            self.logger
                .record(format!("deleting fields in index for measurement '{old_name}'"));
            index.delete(&old_name);
            index.delete(&new_name);

            self.logger.record(format!(
                "updating index with {} fields for new measurement '{new_name}'",
                old_fields.len()
            ));
            let new_fields = index.create_fields_if_not_exists(&new_name);
            for (name, field_type) in old_fields.iter() {
                new_fields.set(name, field_type);
            }
        }
        Ok(())
    }

    fn apply(
        &mut self,
        composite: &[u8],
        values: Vec<Value>,
    ) -> CoreResult<Option<(Vec<u8>, Vec<Value>)>> {
        if self.filter.filter(composite) {
            let (series_key, field) = key::series_and_field(composite);
            let (measurement, tags) = key::parse_key(series_key);

            let new_name = self.renamer.rename(&measurement);
            self.logger
                .record(format!("renaming '{measurement}' to '{new_name}'"));

            let new_series_key = key::make_key(new_name.as_bytes(), &tags);
            let new_key = key::composite_key(&new_series_key, field);
            self.renamed.insert(measurement, new_name);

            return Ok(Some((new_key, values)));
        }

        Ok(Some((composite.to_vec(), values)))
    }
}

/// TOML configuration for [`RenameMeasurementRule`].
#[derive(Default)]
pub struct RenameMeasurementRuleConfig {
    /// Filter selecting measurements to rename (required).
    pub from: Option<Filter>,
    /// Replacement template (required); expands captures when `from` is a
    /// pattern filter.
    pub to: String,
}

impl RuleConfig for RenameMeasurementRuleConfig {
    fn sample(&self) -> &'static str {
        r#"
        to = "linux.$1"
        [from.pattern]
            pattern = "^(cpu|disk)$"
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        self.from = take_filter(table, "from")?;
        if let Some(to) = take_str(table, "to")? {
            self.to = to;
        }
        Ok(())
    }

    fn build(&self, log: &LogBuffer) -> CoreResult<Box<dyn Rule>> {
        let from = self.from.clone().ok_or(CoreError::MissingFromFilter)?;
        if self.to.is_empty() {
            return Err(CoreError::MissingRenameTo);
        }

        let renamer = Renamer::from_filter(&from, &self.to);
        Ok(Box::new(RenameMeasurementRule::new(from, renamer, log)))
    }
}

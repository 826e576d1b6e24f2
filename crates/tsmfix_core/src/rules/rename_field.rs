//! Renames fields within matching measurements.

use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};
use crate::filter::Filter;
use crate::filter::config::{take_filter, take_str};
use crate::logging::{LogBuffer, ScopedLogger};
use crate::rules::{Renamer, Rule, RuleConfig, STANDARD};
use crate::shard::ShardInfo;
use tsmfix_codec::{key, FieldIndex, Value};

/// Rewrites the field component of matching keys. At end of shard each
/// affected measurement's field map is rebuilt with the renamed names,
/// types preserved, so old and new names never coexist in the index.
pub struct RenameFieldRule {
    measurement_filter: Filter,
    field_filter: Filter,
    renamer: Renamer,

    // Per measurement, the (old, new) pairs observed this shard.
    renamed: BTreeMap<String, BTreeMap<String, String>>,
    logger: ScopedLogger,
}

impl RenameFieldRule {
    /// Creates a rule renaming fields matched by `field` inside
    /// measurements matched by `measurement`.
    pub fn new(
        measurement: Filter,
        field: Filter,
        renamer: Renamer,
        log: &LogBuffer,
    ) -> Self {
        Self {
            measurement_filter: measurement,
            field_filter: field,
            renamer,
            renamed: BTreeMap::new(),
            logger: log.scoped("rename-field"),
        }
    }
}

impl Rule for RenameFieldRule {
    fn name(&self) -> &'static str {
        "rename-field"
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
        for (measurement, renames) in std::mem::take(&mut self.renamed) {
            let old_fields = index.fields_by(&measurement).cloned().ok_or_else(|| {
                CoreError::invalid_value(
                    measurement.clone(),
                    "failed to find fields in index for measurement",
                )
            })?;

            index.delete(&measurement);
            let new_fields = index.create_fields_if_not_exists(&measurement);
            for (name, field_type) in old_fields.iter() {
                match renames.get(name) {
                    Some(new_name) => {
                        self.logger.record(format!(
                            "renaming field '{name}' to '{new_name}' in index \
                             for measurement '{measurement}'"
                        ));
                        new_fields.set(new_name.clone(), field_type);
                    }
                    None => new_fields.set(name, field_type),
                }
            }
        }
        Ok(())
    }

    fn apply(
        &mut self,
        composite: &[u8],
        values: Vec<Value>,
    ) -> CoreResult<Option<(Vec<u8>, Vec<Value>)>> {
        let (series_key, field) = key::series_and_field(composite);
        let (measurement, _) = key::parse_key(series_key);

        if self.measurement_filter.filter(measurement.as_bytes())
            && self.field_filter.filter(field)
        {
            let old_field = String::from_utf8_lossy(field).into_owned();
            let new_field = self.renamer.rename(&old_field);
            self.logger.record(format!(
                "renaming field '{old_field}' to '{new_field}' for measurement '{measurement}'"
            ));

            let new_key = key::composite_key(series_key, new_field.as_bytes());
            self.renamed
                .entry(measurement)
                .or_default()
                .insert(old_field, new_field);

            return Ok(Some((new_key, values)));
        }

        Ok(Some((composite.to_vec(), values)))
    }
}

/// TOML configuration for [`RenameFieldRule`].
#[derive(Default)]
pub struct RenameFieldRuleConfig {
    /// Measurement filter (required).
    pub measurement: Option<Filter>,
    /// Field name filter (required).
    pub field: Option<Filter>,
    /// Replacement template (required); expands captures when `field` is a
    /// pattern filter.
    pub to: String,
}

impl RuleConfig for RenameFieldRuleConfig {
    fn sample(&self) -> &'static str {
        r#"
        to = "agg_5m_${1}_${2}"
        [measurement.strings]
            hasprefix = "linux."
        [field.pattern]
            pattern = "(.+)_(avg|sum)"
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        self.measurement = take_filter(table, "measurement")?;
        self.field = take_filter(table, "field")?;
        if let Some(to) = take_str(table, "to")? {
            self.to = to;
        }
        Ok(())
    }

    fn build(&self, log: &LogBuffer) -> CoreResult<Box<dyn Rule>> {
        let measurement = self
            .measurement
            .clone()
            .ok_or(CoreError::MissingMeasurementFilter)?;
        let field = self.field.clone().ok_or(CoreError::MissingFieldFilter)?;
        if self.to.is_empty() {
            return Err(CoreError::MissingRenameTo);
        }

        let renamer = Renamer::from_filter(&field, &self.to);
        Ok(Box::new(RenameFieldRule::new(
            measurement,
            field,
            renamer,
            log,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests_support::{composite, test_shard};
    use tsmfix_codec::FieldType;

    fn avg_rule() -> RenameFieldRule {
        let measurement = Filter::pattern("^linux\\.").unwrap();
        let field = Filter::pattern("^(.+)_(avg|sum)$").unwrap();
        let renamer = Renamer::from_filter(&field, "agg_5m_${1}_${2}");
        RenameFieldRule::new(measurement, field, renamer, &LogBuffer::new())
    }

    #[test]
    fn renames_field_component() {
        let mut rule = avg_rule();
        let tags = [("host", "h1")];
        let input = composite("linux.cpu", &tags, "idle_avg");
        let expected = composite("linux.cpu", &tags, "agg_5m_idle_avg");

        let (new_key, _) = rule
            .apply(&input, vec![Value::Float(1, 1.0)])
            .unwrap()
            .unwrap();
        assert_eq!(new_key, expected);
    }

    #[test]
    fn non_matching_fields_pass_through() {
        let mut rule = avg_rule();
        let input = composite("linux.cpu", &[], "idle");
        let (new_key, _) = rule
            .apply(&input, vec![Value::Float(1, 1.0)])
            .unwrap()
            .unwrap();
        assert_eq!(new_key, input);
    }

    #[test]
    fn end_shard_renames_index_fields() {
        let (mut index, _dir) = test_shard(&[(
            "linux.cpu",
            &[
                ("idle_avg", FieldType::Float),
                ("idle", FieldType::Float),
            ],
        )]);

        let mut rule = avg_rule();
        rule.apply(
            &composite("linux.cpu", &[], "idle_avg"),
            vec![Value::Float(1, 1.0)],
        )
        .unwrap();
        rule.end_shard(&mut index).unwrap();

        let fields = index.fields_by("linux.cpu").unwrap();
        assert!(fields.field("idle_avg").is_none());
        assert_eq!(fields.field("agg_5m_idle_avg"), Some(FieldType::Float));
        assert_eq!(fields.field("idle"), Some(FieldType::Float));
    }

    #[test]
    fn build_validates_required_fields() {
        let config = RenameFieldRuleConfig::default();
        assert!(matches!(
            config.build(&LogBuffer::new()),
            Err(CoreError::MissingMeasurementFilter)
        ));
    }
}

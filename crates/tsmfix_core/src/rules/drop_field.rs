//! Drops a field from matching measurements.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CoreError, CoreResult};
use crate::filter::Filter;
use crate::filter::config::take_filter;
use crate::logging::{LogBuffer, ScopedLogger};
use crate::rules::{Rule, RuleConfig, STANDARD};
use crate::shard::ShardInfo;
use tsmfix_codec::{key, values_type, FieldIndex, Value};

/// Drops `(key, values)` pairs whose measurement, field name and batch type
/// all match. At end of shard the affected measurements' field maps are
/// rebuilt without the dropped fields, other fields keeping their types.
pub struct DropFieldRule {
    measurement_filter: Filter,
    field_filter: Filter,
    type_filter: Filter,

    deleted: BTreeMap<String, BTreeSet<String>>,
    logger: ScopedLogger,
}

impl DropFieldRule {
    /// Creates a rule from the three component filters.
    pub fn new(
        measurement: Filter,
        field: Filter,
        type_filter: Filter,
        log: &LogBuffer,
    ) -> Self {
        Self {
            measurement_filter: Filter::measurement(measurement),
            field_filter: field,
            type_filter,
            deleted: BTreeMap::new(),
            logger: log.scoped("drop-field"),
        }
    }
}

impl Rule for DropFieldRule {
    fn name(&self) -> &'static str {
        "drop-field"
    }

    fn check_mode(&mut self, _check: bool) {}

    fn flags(&self) -> u32 {
        STANDARD
    }

    fn filter_key(&self, _key: &[u8]) -> bool {
        true
    }

    fn start_shard(&mut self, _shard: &ShardInfo) -> bool {
        self.deleted.clear();
        true
    }

    fn end_shard(&mut self, index: &mut FieldIndex) -> CoreResult<()> {
        for (measurement, dropped) in std::mem::take(&mut self.deleted) {
            let old_fields = index.fields_by(&measurement).cloned().ok_or_else(|| {
                CoreError::invalid_value(
                    measurement.clone(),
                    "failed to find fields in index for measurement",
                )
            })?;

            index.delete(&measurement);
            let new_fields = index.create_fields_if_not_exists(&measurement);
            for (name, field_type) in old_fields.iter() {
                if !dropped.contains(name) {
                    new_fields.set(name, field_type);
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
        let batch_type = values_type(&values)?;
        let (series_key, field) = key::series_and_field(composite);

        if self.measurement_filter.filter(composite)
            && self.field_filter.filter(field)
            && self.type_filter.filter(batch_type.as_str().as_bytes())
        {
            let (measurement, _) = key::parse_key(series_key);
            let field = String::from_utf8_lossy(field).into_owned();
            self.logger.record(format!(
                "dropping field '{field}' from measurement '{measurement}' (type '{batch_type}')"
            ));
            self.deleted.entry(measurement).or_default().insert(field);
            return Ok(None);
        }

        Ok(Some((composite.to_vec(), values)))
    }
}

/// TOML configuration for [`DropFieldRule`].
#[derive(Default)]
pub struct DropFieldRuleConfig {
    /// Measurement filter (required).
    pub measurement: Option<Filter>,
    /// Field name filter (required).
    pub field: Option<Filter>,
    /// Textual field type filter (optional, defaults to any).
    pub type_filter: Option<Filter>,
}

impl RuleConfig for DropFieldRuleConfig {
    fn sample(&self) -> &'static str {
        r#"
        [measurement.strings]
            equal = "mem"
        [field.strings]
            equal = "used"
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        self.measurement = take_filter(table, "measurement")?;
        self.field = take_filter(table, "field")?;
        self.type_filter = take_filter(table, "type")?;
        Ok(())
    }

    fn build(&self, log: &LogBuffer) -> CoreResult<Box<dyn Rule>> {
        let measurement = self
            .measurement
            .clone()
            .ok_or(CoreError::MissingMeasurementFilter)?;
        let field = self.field.clone().ok_or(CoreError::MissingFieldFilter)?;
        let type_filter = self.type_filter.clone().unwrap_or(Filter::AlwaysTrue);

        Ok(Box::new(DropFieldRule::new(
            measurement,
            field,
            type_filter,
            log,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests_support::{composite, test_shard};
    use tsmfix_codec::FieldType;

    fn mem_used_rule() -> DropFieldRule {
        DropFieldRule::new(
            Filter::include(vec!["mem".to_string()]),
            Filter::include(vec!["used".to_string()]),
            Filter::AlwaysTrue,
            &LogBuffer::new(),
        )
    }

    #[test]
    fn drops_matching_field_and_updates_index() {
        let (mut index, _dir) = test_shard(&[
            (
                "mem",
                &[
                    ("used", FieldType::Float),
                    ("available", FieldType::Integer),
                ],
            ),
            ("cpu", &[("idle", FieldType::Float)]),
        ]);

        let mut rule = mem_used_rule();
        let values = vec![Value::Float(1, 0.5)];

        assert!(rule
            .apply(&composite("mem", &[("host", "h1")], "used"), values.clone())
            .unwrap()
            .is_none());
        assert!(rule
            .apply(&composite("mem", &[("host", "h2")], "used"), values.clone())
            .unwrap()
            .is_none());
        assert!(rule
            .apply(
                &composite("mem", &[("host", "h1")], "available"),
                vec![Value::Integer(1, 3)]
            )
            .unwrap()
            .is_some());
        assert!(rule
            .apply(&composite("cpu", &[("host", "h1")], "idle"), values)
            .unwrap()
            .is_some());

        rule.end_shard(&mut index).unwrap();

        let mem = index.fields_by("mem").unwrap();
        assert!(mem.field("used").is_none());
        assert_eq!(mem.field("available"), Some(FieldType::Integer));
        assert_eq!(
            index.fields_by("cpu").unwrap().field("idle"),
            Some(FieldType::Float)
        );
    }

    #[test]
    fn type_filter_narrows_the_drop() {
        let mut rule = DropFieldRule::new(
            Filter::include(vec!["mem".to_string()]),
            Filter::include(vec!["used".to_string()]),
            Filter::include(vec!["integer".to_string()]),
            &LogBuffer::new(),
        );

        // Float batch does not match the integer type filter.
        assert!(rule
            .apply(
                &composite("mem", &[], "used"),
                vec![Value::Float(1, 0.5)]
            )
            .unwrap()
            .is_some());
        assert!(rule
            .apply(&composite("mem", &[], "used"), vec![Value::Integer(1, 5)])
            .unwrap()
            .is_none());
    }

    #[test]
    fn mixed_batch_is_fatal() {
        let mut rule = mem_used_rule();
        let values = vec![Value::Float(1, 0.5), Value::Integer(2, 1)];
        assert!(rule.apply(&composite("mem", &[], "used"), values).is_err());
    }

    #[test]
    fn build_requires_measurement_and_field() {
        let config = DropFieldRuleConfig::default();
        assert!(matches!(
            config.build(&LogBuffer::new()),
            Err(CoreError::MissingMeasurementFilter)
        ));
    }
}

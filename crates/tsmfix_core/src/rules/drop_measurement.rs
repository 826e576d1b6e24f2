//! Drops every series of matching measurements.

use std::collections::BTreeSet;

use crate::error::CoreResult;
use crate::filter::Filter;
use crate::filter::config::take_filter;
use crate::logging::{LogBuffer, ScopedLogger};
use crate::rules::{Rule, RuleConfig, STANDARD};
use crate::shard::ShardInfo;
use tsmfix_codec::{key, FieldIndex, Value};

/// Drops all `(key, values)` pairs whose measurement matches the filter and
/// removes the measurement from the field index at end of shard.
pub struct DropMeasurementRule {
    filter: Filter,
    dropped: BTreeSet<String>,
    logger: ScopedLogger,
}

impl DropMeasurementRule {
    /// Creates a rule dropping measurements that match `filter`.
    pub fn new(filter: Filter, log: &LogBuffer) -> Self {
        Self {
            filter: Filter::measurement(filter),
            dropped: BTreeSet::new(),
            logger: log.scoped("drop-measurement"),
        }
    }

    /// Returns the number of distinct measurements dropped so far in the
    /// current shard.
    pub fn count(&self) -> usize {
        self.dropped.len()
    }
}

impl Rule for DropMeasurementRule {
    fn name(&self) -> &'static str {
        "drop-measurement"
    }

    fn check_mode(&mut self, _check: bool) {}

    fn flags(&self) -> u32 {
        STANDARD
    }

    fn filter_key(&self, _key: &[u8]) -> bool {
        true
    }

    fn start_shard(&mut self, _shard: &ShardInfo) -> bool {
        self.dropped.clear();
        true
    }

    fn end_shard(&mut self, index: &mut FieldIndex) -> CoreResult<()> {
        for measurement in std::mem::take(&mut self.dropped) {
            self.logger
                .record(format!("deleting fields in index for measurement '{measurement}'"));
            index.delete(&measurement);
        }
        Ok(())
    }

    fn apply(
        &mut self,
        composite: &[u8],
        values: Vec<Value>,
    ) -> CoreResult<Option<(Vec<u8>, Vec<Value>)>> {
        if self.filter.filter(composite) {
            let measurement = key::measurement_from_composite(composite);
            self.logger.record(format!("dropping measurement '{measurement}'"));
            self.dropped.insert(measurement);
            return Ok(None);
        }

        Ok(Some((composite.to_vec(), values)))
    }
}

/// TOML configuration for [`DropMeasurementRule`].
#[derive(Default)]
pub struct DropMeasurementRuleConfig {
    /// The measurement filter driving the drop.
    pub drop_filter: Option<Filter>,
}

impl RuleConfig for DropMeasurementRuleConfig {
    fn sample(&self) -> &'static str {
        r#"
        [dropFilter.pattern]
            pattern = "^linux\\..*"
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        self.drop_filter = take_filter(table, "dropFilter")?;
        Ok(())
    }

    fn build(&self, log: &LogBuffer) -> CoreResult<Box<dyn Rule>> {
        let filter = self
            .drop_filter
            .clone()
            .ok_or(crate::error::CoreError::MissingMeasurementFilter)?;
        Ok(Box::new(DropMeasurementRule::new(filter, log)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests_support::{composite, test_shard};
    use tsmfix_codec::FieldType;

    fn rule(pattern: &str) -> DropMeasurementRule {
        DropMeasurementRule::new(Filter::pattern(pattern).unwrap(), &LogBuffer::new())
    }

    #[test]
    fn drops_matching_measurements() {
        let mut rule = rule("^cpu$");
        let values = vec![Value::Float(1, 0.5)];

        let result = rule
            .apply(&composite("cpu", &[("host", "h1")], "idle"), values.clone())
            .unwrap();
        assert!(result.is_none());

        let key = composite("mem", &[("host", "h1")], "used");
        let result = rule.apply(&key, values).unwrap().unwrap();
        assert_eq!(result.0, key);
        assert_eq!(rule.count(), 1);
    }

    #[test]
    fn end_shard_deletes_from_index() {
        let (mut index, _dir) = test_shard(&[
            ("cpu", &[("idle", FieldType::Float)]),
            ("mem", &[("used", FieldType::Integer)]),
        ]);

        let mut rule = rule("^cpu$");
        rule.apply(&composite("cpu", &[], "idle"), vec![Value::Float(1, 0.5)])
            .unwrap();
        rule.end_shard(&mut index).unwrap();

        assert!(index.fields_by("cpu").is_none());
        assert!(index.fields_by("mem").is_some());
        assert_eq!(rule.count(), 0);
    }

    #[test]
    fn missing_filter_fails_build() {
        let config = DropMeasurementRuleConfig::default();
        assert!(config.build(&LogBuffer::new()).is_err());
    }
}

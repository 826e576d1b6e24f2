//! Drops individual series matching a serie filter.

use crate::error::CoreResult;
use crate::filter::Filter;
use crate::filter::config::take_filter;
use crate::logging::{LogBuffer, ScopedLogger};
use crate::rules::{Rule, RuleConfig, STANDARD};
use crate::shard::ShardInfo;
use tsmfix_codec::{key, FieldIndex, Value};

/// Drops every `(key, values)` pair whose composite key matches the drop
/// filter. Fields and measurements survive elsewhere, so the field index is
/// left untouched.
pub struct DropSerieRule {
    drop_filter: Filter,
    logger: ScopedLogger,

    count: u64,
    total: u64,
    shard_count: u64,
    shard_total: u64,
}

impl DropSerieRule {
    /// Creates a rule dropping keys that match `drop_filter`.
    pub fn new(drop_filter: Filter, log: &LogBuffer) -> Self {
        Self {
            drop_filter,
            logger: log.scoped("drop-serie"),
            count: 0,
            total: 0,
            shard_count: 0,
            shard_total: 0,
        }
    }
}

impl Rule for DropSerieRule {
    fn name(&self) -> &'static str {
        "drop-serie"
    }

    fn check_mode(&mut self, _check: bool) {}

    fn flags(&self) -> u32 {
        STANDARD
    }

    fn filter_key(&self, _key: &[u8]) -> bool {
        true
    }

    fn start_shard(&mut self, _shard: &ShardInfo) -> bool {
        self.shard_count = 0;
        self.shard_total = 0;
        true
    }

    fn end_shard(&mut self, _index: &mut FieldIndex) -> CoreResult<()> {
        let percent = self.shard_count * 100 / self.shard_total.max(1);
        tracing::info!(
            "dropped {} ({percent}%) total keys in current shard",
            self.shard_count
        );
        Ok(())
    }

    fn start_tsm(&mut self, _path: &std::path::Path) -> bool {
        self.count = 0;
        self.total = 0;
        true
    }

    fn end_tsm(&mut self) {
        self.shard_count += self.count;
        self.shard_total += self.total;
        let percent = self.count * 100 / self.total.max(1);
        tracing::info!("dropped {} ({percent}%) total keys in current TSM", self.count);
    }

    fn start_wal(&mut self, _path: &std::path::Path) -> bool {
        self.count = 0;
        self.total = 0;
        true
    }

    fn end_wal(&mut self) {
        self.shard_count += self.count;
        self.shard_total += self.total;
        tracing::info!("dropped {} total keys in current WAL", self.count);
    }

    fn apply(
        &mut self,
        composite: &[u8],
        values: Vec<Value>,
    ) -> CoreResult<Option<(Vec<u8>, Vec<Value>)>> {
        self.total += 1;

        if self.drop_filter.filter(composite) {
            let measurement = key::measurement_from_composite(composite);
            self.logger
                .record(format!("dropping serie for measurement '{measurement}'"));
            self.count += 1;
            return Ok(None);
        }

        Ok(Some((composite.to_vec(), values)))
    }
}

/// TOML configuration for [`DropSerieRule`].
#[derive(Default)]
pub struct DropSerieRuleConfig {
    /// The filter selecting series to drop, applied to composite keys.
    pub drop_filter: Option<Filter>,
}

impl RuleConfig for DropSerieRuleConfig {
    fn sample(&self) -> &'static str {
        r#"
        [dropFilter.serie]
            [dropFilter.serie.measurement.strings]
                equal = "cpu"
            [dropFilter.serie.tag.where]
                cpu = "cpu0"
            [dropFilter.serie.field.pattern]
                pattern = "^(idle|usage_idle)$"
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        self.drop_filter = take_filter(table, "dropFilter")?;
        Ok(())
    }

    fn build(&self, log: &LogBuffer) -> CoreResult<Box<dyn Rule>> {
        let filter = self.drop_filter.clone().ok_or_else(|| {
            crate::error::CoreError::invalid_filter("dropFilter", "missing drop filter")
        })?;
        Ok(Box::new(DropSerieRule::new(filter, log)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::SerieFilter;
    use crate::rules::tests_support::composite;
    use std::collections::BTreeMap;

    fn cpu_filter() -> Filter {
        let mut pairs = BTreeMap::new();
        pairs.insert("cpu".to_string(), "^(cpu7|cpu8)$".to_string());
        Filter::Serie(Box::new(SerieFilter {
            measurement: Filter::include(vec!["cpu".to_string()]),
            tag: Filter::where_tags(pairs).unwrap(),
            field: None,
        }))
    }

    #[test]
    fn drops_matching_series_only() {
        let mut rule = DropSerieRule::new(cpu_filter(), &LogBuffer::new());
        let values = vec![Value::Float(1, 0.5)];

        for dropped in [
            composite("cpu", &[("host", "h1"), ("cpu", "cpu7")], "idle"),
            composite("cpu", &[("host", "h1"), ("cpu", "cpu8")], "idle"),
        ] {
            assert!(rule.apply(&dropped, values.clone()).unwrap().is_none());
        }

        for kept in [
            composite("cpu", &[("host", "h1"), ("cpu", "cpu0")], "idle"),
            composite("mem", &[("host", "h1")], "used"),
        ] {
            let (new_key, _) = rule.apply(&kept, values.clone()).unwrap().unwrap();
            assert_eq!(new_key, kept);
        }

        assert_eq!(rule.count, 2);
        assert_eq!(rule.total, 4);
    }

    #[test]
    fn counters_roll_up_per_shard() {
        let mut rule = DropSerieRule::new(cpu_filter(), &LogBuffer::new());
        let values = vec![Value::Float(1, 0.5)];

        rule.start_tsm(std::path::Path::new("a.tsm"));
        rule.apply(
            &composite("cpu", &[("cpu", "cpu7")], "idle"),
            values.clone(),
        )
        .unwrap();
        rule.end_tsm();

        rule.start_tsm(std::path::Path::new("b.tsm"));
        rule.apply(&composite("mem", &[], "used"), values).unwrap();
        rule.end_tsm();

        assert_eq!(rule.shard_count, 1);
        assert_eq!(rule.shard_total, 2);
    }

    #[test]
    fn missing_filter_fails_build() {
        let config = DropSerieRuleConfig::default();
        assert!(config.build(&LogBuffer::new()).is_err());
    }
}

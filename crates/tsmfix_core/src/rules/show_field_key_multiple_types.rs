//! Reports fields declared with different types across shards.

use std::collections::BTreeMap;

use crate::error::CoreResult;
use crate::filter::Filter;
use crate::filter::config::take_filter;
use crate::logging::{LogBuffer, ScopedLogger};
use crate::rules::{Rule, RuleConfig, READ_ONLY};
use crate::shard::ShardInfo;
use tsmfix_codec::{key, FieldIndex, FieldType, Value};

/// Read-only rule noting every measurement with an observed matching field
/// and, per shard, the types the index declares for that measurement's
/// entire field set. At the end of the run, fields that carried more than
/// one declared type across shards are reported.
pub struct ShowFieldKeyMultipleTypesRule {
    measurement_filter: Filter,
    field_filter: Filter,

    shard_id: u64,
    // measurement → field → (shard, declared type), one entry per distinct
    // type.
    measurements: BTreeMap<String, BTreeMap<String, Vec<(u64, FieldType)>>>,
    logger: ScopedLogger,
}

impl ShowFieldKeyMultipleTypesRule {
    /// Creates the rule; filters default to matching everything.
    pub fn new(measurement: Filter, field: Filter, log: &LogBuffer) -> Self {
        Self {
            measurement_filter: Filter::measurement(measurement),
            field_filter: field,
            shard_id: 0,
            measurements: BTreeMap::new(),
            logger: log.scoped("show-field-key-multiple-types"),
        }
    }
}

impl Rule for ShowFieldKeyMultipleTypesRule {
    fn name(&self) -> &'static str {
        "show-field-key-multiple-types"
    }

    fn check_mode(&mut self, _check: bool) {}

    fn flags(&self) -> u32 {
        READ_ONLY
    }

    fn filter_key(&self, composite: &[u8]) -> bool {
        let (_, field) = key::series_and_field(composite);
        self.measurement_filter.filter(composite) && self.field_filter.filter(field)
    }

    fn start_shard(&mut self, shard: &ShardInfo) -> bool {
        self.shard_id = shard.id;
        true
    }

    fn end_shard(&mut self, index: &mut FieldIndex) -> CoreResult<()> {
        let shard_id = self.shard_id;
        for (measurement, fields) in &mut self.measurements {
            let Some(declared) = index.fields_by(measurement) else {
                continue;
            };

            // Every field the index declares for a noted measurement is
            // tracked, not just the ones that were observed directly.
            for (field, field_type) in declared.iter() {
                let observed = fields.entry(field.to_string()).or_default();
                if !observed.iter().any(|&(_, ty)| ty == field_type) {
                    observed.push((shard_id, field_type));
                }
            }
        }
        Ok(())
    }

    fn end(&mut self) {
        for (measurement, fields) in &self.measurements {
            for (field, observed) in fields {
                if observed.len() > 1 {
                    let types: Vec<String> = observed
                        .iter()
                        .map(|(shard, ty)| format!("{ty} (shard {shard})"))
                        .collect();
                    self.logger.record(format!(
                        "detected multiple types for field '{field}' of measurement \
                         '{measurement}' [{}]",
                        types.join(", ")
                    ));
                }
            }
        }
    }

    fn apply(
        &mut self,
        composite: &[u8],
        _values: Vec<Value>,
    ) -> CoreResult<Option<(Vec<u8>, Vec<Value>)>> {
        let (series_key, field) = key::series_and_field(composite);
        if self.measurement_filter.filter(composite) && self.field_filter.filter(field) {
            let (measurement, _) = key::parse_key(series_key);
            self.measurements.entry(measurement).or_default();
        }
        Ok(None)
    }
}

/// TOML configuration for [`ShowFieldKeyMultipleTypesRule`].
#[derive(Default)]
pub struct ShowFieldKeyMultipleTypesConfig {
    /// Measurement filter (optional, defaults to all).
    pub measurement: Option<Filter>,
    /// Field filter (optional, defaults to all).
    pub field: Option<Filter>,
}

impl RuleConfig for ShowFieldKeyMultipleTypesConfig {
    fn sample(&self) -> &'static str {
        r#"
        [measurement.strings]
            hassuffix = ".gauge"
        [field.strings]
            equal = "value"
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        self.measurement = take_filter(table, "measurement")?;
        self.field = take_filter(table, "field")?;
        Ok(())
    }

    fn build(&self, log: &LogBuffer) -> CoreResult<Box<dyn Rule>> {
        let measurement = self.measurement.clone().unwrap_or(Filter::AlwaysTrue);
        let field = self.field.clone().unwrap_or(Filter::AlwaysTrue);
        Ok(Box::new(ShowFieldKeyMultipleTypesRule::new(
            measurement,
            field,
            log,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests_support::{composite, test_shard};

    fn shard_info(id: u64) -> ShardInfo {
        ShardInfo {
            id,
            path: std::path::PathBuf::from("/tmp/shard"),
            database: "db".to_string(),
            retention_policy: "rp".to_string(),
            tsm_files: Vec::new(),
            wal_files: Vec::new(),
        }
    }

    #[test]
    fn detects_types_diverging_across_shards() {
        let log = LogBuffer::new();
        let mut rule = ShowFieldKeyMultipleTypesRule::new(
            Filter::AlwaysTrue,
            Filter::AlwaysTrue,
            &log,
        );

        let key = composite("requests.gauge", &[], "value");

        // Shard 1 declares value as float.
        let (mut index1, _d1) =
            test_shard(&[("requests.gauge", &[("value", FieldType::Float)])]);
        rule.start_shard(&shard_info(1));
        rule.apply(&key, vec![Value::Float(1, 1.0)]).unwrap();
        rule.end_shard(&mut index1).unwrap();

        // Shard 2 declares it as integer.
        let (mut index2, _d2) =
            test_shard(&[("requests.gauge", &[("value", FieldType::Integer)])]);
        rule.start_shard(&shard_info(2));
        rule.apply(&key, vec![Value::Integer(1, 1)]).unwrap();
        rule.end_shard(&mut index2).unwrap();

        rule.end();

        let mut out = Vec::new();
        log.flush(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("multiple types for field 'value'"));
        assert!(text.contains("float (shard 1)"));
        assert!(text.contains("integer (shard 2)"));
    }

    #[test]
    fn consistent_types_stay_silent() {
        let log = LogBuffer::new();
        let mut rule = ShowFieldKeyMultipleTypesRule::new(
            Filter::AlwaysTrue,
            Filter::AlwaysTrue,
            &log,
        );

        let key = composite("cpu", &[], "idle");
        for shard in 1..=2 {
            let (mut index, _d) = test_shard(&[("cpu", &[("idle", FieldType::Float)])]);
            rule.start_shard(&shard_info(shard));
            rule.apply(&key, vec![Value::Float(1, 1.0)]).unwrap();
            rule.end_shard(&mut index).unwrap();
        }
        rule.end();

        assert!(log.is_empty());
    }

    #[test]
    fn sibling_fields_of_noted_measurements_are_tracked() {
        let log = LogBuffer::new();
        // Only the "value" field ever matches, but once the measurement is
        // noted every field the index declares for it is inspected.
        let mut rule = ShowFieldKeyMultipleTypesRule::new(
            Filter::AlwaysTrue,
            Filter::Strings(crate::filter::StringsFilter {
                equal: Some("value".to_string()),
                ..Default::default()
            }),
            &log,
        );

        let key = composite("requests.gauge", &[], "value");

        let (mut index1, _d1) = test_shard(&[(
            "requests.gauge",
            &[("value", FieldType::Float), ("count", FieldType::Float)],
        )]);
        rule.start_shard(&shard_info(1));
        rule.apply(&key, vec![Value::Float(1, 1.0)]).unwrap();
        rule.end_shard(&mut index1).unwrap();

        let (mut index2, _d2) = test_shard(&[(
            "requests.gauge",
            &[("value", FieldType::Float), ("count", FieldType::Integer)],
        )]);
        rule.start_shard(&shard_info(2));
        rule.apply(&key, vec![Value::Float(1, 1.0)]).unwrap();
        rule.end_shard(&mut index2).unwrap();

        rule.end();

        let mut out = Vec::new();
        log.flush(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("multiple types for field 'count'"));
        assert!(!text.contains("multiple types for field 'value'"));
    }

    #[test]
    fn non_matching_keys_leave_measurements_unnoted() {
        let mut rule = ShowFieldKeyMultipleTypesRule::new(
            Filter::AlwaysTrue,
            Filter::Strings(crate::filter::StringsFilter {
                equal: Some("value".to_string()),
                ..Default::default()
            }),
            &LogBuffer::new(),
        );

        rule.apply(&composite("cpu", &[], "idle"), vec![Value::Float(1, 1.0)])
            .unwrap();
        assert!(rule.measurements.is_empty());
    }

    #[test]
    fn filter_key_narrows_observation() {
        let rule = ShowFieldKeyMultipleTypesRule::new(
            Filter::Strings(crate::filter::StringsFilter {
                has_suffix: Some(".gauge".to_string()),
                ..Default::default()
            }),
            Filter::AlwaysTrue,
            &LogBuffer::new(),
        );

        assert!(rule.filter_key(&composite("requests.gauge", &[], "value")));
        assert!(!rule.filter_key(&composite("cpu", &[], "idle")));
    }
}

//! Rewrites tag values within matching measurements.

use crate::error::{CoreError, CoreResult};
use crate::filter::Filter;
use crate::filter::config::{take_filter, take_str};
use crate::logging::{LogBuffer, ScopedLogger};
use crate::rules::{Renamer, Rule, RuleConfig, STANDARD};
use tsmfix_codec::{key, Tag, Value};

/// Within matching measurements, replaces the value of every tag whose key
/// passes the key filter and whose value passes the value filter.
pub struct UpdateTagValueRule {
    measurement_filter: Filter,
    key_filter: Filter,
    value_filter: Filter,
    renamer: Renamer,
    logger: ScopedLogger,
}

impl UpdateTagValueRule {
    /// Creates a rule rewriting matching tag values.
    pub fn new(
        measurement: Filter,
        key_filter: Filter,
        value_filter: Filter,
        renamer: Renamer,
        log: &LogBuffer,
    ) -> Self {
        Self {
            measurement_filter: Filter::measurement(measurement),
            key_filter,
            value_filter,
            renamer,
            logger: log.scoped("update-tag-value"),
        }
    }
}

impl Rule for UpdateTagValueRule {
    fn name(&self) -> &'static str {
        "update-tag-value"
    }

    fn check_mode(&mut self, _check: bool) {}

    fn flags(&self) -> u32 {
        STANDARD
    }

    fn filter_key(&self, _key: &[u8]) -> bool {
        true
    }

    fn apply(
        &mut self,
        composite: &[u8],
        values: Vec<Value>,
    ) -> CoreResult<Option<(Vec<u8>, Vec<Value>)>> {
        if !self.measurement_filter.filter(composite) {
            return Ok(Some((composite.to_vec(), values)));
        }

        let (series_key, field) = key::series_and_field(composite);
        let (measurement, tags) = key::parse_key(series_key);

        let mut new_tags = Vec::with_capacity(tags.len());
        for tag in tags {
            if self.key_filter.filter(&tag.key) && self.value_filter.filter(&tag.value) {
                let tag_key = String::from_utf8_lossy(&tag.key).into_owned();
                let old_value = String::from_utf8_lossy(&tag.value).into_owned();
                let new_value = self.renamer.rename(&old_value);
                self.logger.record(format!(
                    "updating tag for measurement '{measurement}' \
                     {tag_key}={old_value} to {tag_key}={new_value}"
                ));
                new_tags.push(Tag::new(tag.key, new_value));
            } else {
                new_tags.push(tag);
            }
        }

        let new_series_key = key::make_key(measurement.as_bytes(), &new_tags);
        let new_key = key::composite_key(&new_series_key, field);
        Ok(Some((new_key, values)))
    }
}

/// TOML configuration for [`UpdateTagValueRule`].
#[derive(Default)]
pub struct UpdateTagValueRuleConfig {
    /// Measurement filter (required).
    pub measurement: Option<Filter>,
    /// Tag key filter (required).
    pub key: Option<Filter>,
    /// Tag value filter (required).
    pub value: Option<Filter>,
    /// Replacement template (required); expands captures when `value` is a
    /// pattern filter.
    pub to: String,
}

impl RuleConfig for UpdateTagValueRuleConfig {
    fn sample(&self) -> &'static str {
        r#"
        to = "aws-$1"
        [measurement.strings]
            hasprefix = "linux."
        [key.strings]
            equal = "region"
        [value.pattern]
            pattern = "amazon-(.*)"
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        self.measurement = take_filter(table, "measurement")?;
        self.key = take_filter(table, "key")?;
        self.value = take_filter(table, "value")?;
        if let Some(to) = take_str(table, "to")? {
            self.to = to;
        }
        Ok(())
    }

    fn build(&self, log: &LogBuffer) -> CoreResult<Box<dyn Rule>> {
        if self.to.is_empty() {
            return Err(CoreError::MissingRenameTo);
        }
        let measurement = self
            .measurement
            .clone()
            .ok_or(CoreError::MissingMeasurementFilter)?;
        let key_filter = self.key.clone().ok_or(CoreError::MissingTagKeyFilter)?;
        let value_filter = self.value.clone().ok_or(CoreError::MissingTagValueFilter)?;

        let renamer = Renamer::from_filter(&value_filter, &self.to);
        Ok(Box::new(UpdateTagValueRule::new(
            measurement,
            key_filter,
            value_filter,
            renamer,
            log,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests_support::composite;

    fn region_rule() -> UpdateTagValueRule {
        let measurement = Filter::pattern("^linux\\.").unwrap();
        let key_filter = Filter::include(vec!["region".to_string()]);
        let value_filter = Filter::pattern("^amazon-(.*)$").unwrap();
        let renamer = Renamer::from_filter(&value_filter, "aws-$1");
        UpdateTagValueRule::new(
            measurement,
            key_filter,
            value_filter,
            renamer,
            &LogBuffer::new(),
        )
    }

    #[test]
    fn rewrites_matching_tag_values() {
        let mut rule = region_rule();
        let input = composite(
            "linux.cpu",
            &[("host", "h1"), ("region", "amazon-eu-west")],
            "idle",
        );
        let expected = composite(
            "linux.cpu",
            &[("host", "h1"), ("region", "aws-eu-west")],
            "idle",
        );

        let (new_key, _) = rule
            .apply(&input, vec![Value::Float(1, 1.0)])
            .unwrap()
            .unwrap();
        assert_eq!(new_key, expected);
    }

    #[test]
    fn value_filter_gates_the_rewrite() {
        let mut rule = region_rule();
        let input = composite("linux.cpu", &[("region", "on-prem")], "idle");
        let (new_key, _) = rule
            .apply(&input, vec![Value::Float(1, 1.0)])
            .unwrap()
            .unwrap();
        assert_eq!(new_key, input);
    }

    #[test]
    fn build_requires_all_filters() {
        let mut config = UpdateTagValueRuleConfig {
            to: "x".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.build(&LogBuffer::new()),
            Err(CoreError::MissingMeasurementFilter)
        ));

        config.measurement = Some(Filter::AlwaysTrue);
        assert!(matches!(
            config.build(&LogBuffer::new()),
            Err(CoreError::MissingTagKeyFilter)
        ));

        config.key = Some(Filter::AlwaysTrue);
        assert!(matches!(
            config.build(&LogBuffer::new()),
            Err(CoreError::MissingTagValueFilter)
        ));
    }
}

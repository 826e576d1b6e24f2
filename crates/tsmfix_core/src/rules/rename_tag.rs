//! Renames tag keys within matching measurements.

use crate::error::{CoreError, CoreResult};
use crate::filter::Filter;
use crate::filter::config::{take_filter, take_str};
use crate::logging::{LogBuffer, ScopedLogger};
use crate::rules::{Renamer, Rule, RuleConfig, STANDARD};
use tsmfix_codec::{key, Tag, Value};

/// Replaces every tag key matching the tag filter with its renamed form.
/// Tag order and values are preserved; fields and the index are untouched.
pub struct RenameTagRule {
    measurement_filter: Filter,
    tag_filter: Filter,
    renamer: Renamer,
    logger: ScopedLogger,
}

impl RenameTagRule {
    /// Creates a rule renaming tag keys inside matching measurements.
    pub fn new(
        measurement: Filter,
        tag: Filter,
        renamer: Renamer,
        log: &LogBuffer,
    ) -> Self {
        Self {
            measurement_filter: Filter::measurement(measurement),
            tag_filter: tag,
            renamer,
            logger: log.scoped("rename-tag"),
        }
    }
}

impl Rule for RenameTagRule {
    fn name(&self) -> &'static str {
        "rename-tag"
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
            if self.tag_filter.filter(&tag.key) {
                let old_key = String::from_utf8_lossy(&tag.key).into_owned();
                let new_key = self.renamer.rename(&old_key);
                self.logger.record(format!(
                    "renaming tag '{old_key}' from measurement '{measurement}' to '{new_key}'"
                ));
                new_tags.push(Tag::new(new_key, tag.value));
            } else {
                new_tags.push(tag);
            }
        }

        let new_series_key = key::make_key(measurement.as_bytes(), &new_tags);
        let new_key = key::composite_key(&new_series_key, field);
        Ok(Some((new_key, values)))
    }
}

/// TOML configuration for [`RenameTagRule`].
#[derive(Default)]
pub struct RenameTagRuleConfig {
    /// Measurement filter (required).
    pub measurement: Option<Filter>,
    /// Tag key filter (required).
    pub tag: Option<Filter>,
    /// Replacement template (required); expands captures when `tag` is a
    /// pattern filter.
    pub to: String,
}

impl RuleConfig for RenameTagRuleConfig {
    fn sample(&self) -> &'static str {
        r#"
        to = "hostname"
        [measurement.strings]
            hasprefix = "linux."
        [tag.strings]
            equal = "host"
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        self.measurement = take_filter(table, "measurement")?;
        self.tag = take_filter(table, "tag")?;
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
        let tag = self.tag.clone().ok_or(CoreError::MissingTagFilter)?;

        let renamer = Renamer::from_filter(&tag, &self.to);
        Ok(Box::new(RenameTagRule::new(measurement, tag, renamer, log)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests_support::composite;

    fn host_to_hostname() -> RenameTagRule {
        let measurement = Filter::pattern("^linux\\.").unwrap();
        let tag = Filter::include(vec!["host".to_string()]);
        let renamer = Renamer::from_filter(&tag, "hostname");
        RenameTagRule::new(measurement, tag, renamer, &LogBuffer::new())
    }

    #[test]
    fn renames_matching_tag_keys() {
        let mut rule = host_to_hostname();
        let values = vec![Value::Float(1, 1.0)];

        let input = composite("linux.cpu", &[("host", "h1"), ("region", "eu")], "idle");
        let expected = composite(
            "linux.cpu",
            &[("hostname", "h1"), ("region", "eu")],
            "idle",
        );

        let (new_key, _) = rule.apply(&input, values).unwrap().unwrap();
        assert_eq!(new_key, expected);
    }

    #[test]
    fn untouched_outside_matching_measurements() {
        let mut rule = host_to_hostname();
        let input = composite("windows.cpu", &[("host", "h1")], "idle");
        let (new_key, _) = rule
            .apply(&input, vec![Value::Float(1, 1.0)])
            .unwrap()
            .unwrap();
        assert_eq!(new_key, input);
    }

    #[test]
    fn pattern_tag_rename_expands_captures() {
        let measurement = Filter::AlwaysTrue;
        let tag = Filter::pattern("^dc_(.*)$").unwrap();
        let renamer = Renamer::from_filter(&tag, "datacenter_$1");
        let mut rule = RenameTagRule::new(measurement, tag, renamer, &LogBuffer::new());

        let input = composite("cpu", &[("dc_eu", "fr")], "idle");
        let expected = composite("cpu", &[("datacenter_eu", "fr")], "idle");
        let (new_key, _) = rule
            .apply(&input, vec![Value::Float(1, 1.0)])
            .unwrap()
            .unwrap();
        assert_eq!(new_key, expected);
    }

    #[test]
    fn build_validates_required_fields() {
        let config = RenameTagRuleConfig::default();
        assert!(matches!(
            config.build(&LogBuffer::new()),
            Err(CoreError::MissingRenameTo)
        ));
    }
}

//! Converts a field's value batches from one type to another.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CoreError, CoreResult};
use crate::filter::Filter;
use crate::filter::config::{take_filter, take_str};
use crate::logging::{LogBuffer, ScopedLogger};
use crate::rules::{Rule, RuleConfig, STANDARD};
use crate::shard::ShardInfo;
use tsmfix_codec::{key, values_type, FieldIndex, FieldType, Value};

/// Casts matching batches from `from_type` to `to_type` and updates the
/// declared type in the field index at end of shard.
///
/// Only batches whose current type equals `from_type` are touched; the
/// index is updated for `(measurement, field)` pairs where at least one
/// value actually changed.
pub struct UpdateFieldTypeRule {
    measurement_filter: Filter,
    field_filter: Filter,
    from_type: FieldType,
    to_type: FieldType,

    updates: BTreeMap<String, BTreeSet<String>>,
    logger: ScopedLogger,
}

impl UpdateFieldTypeRule {
    /// Creates a rule converting matching fields between the two types.
    pub fn new(
        measurement: Filter,
        field: Filter,
        from_type: FieldType,
        to_type: FieldType,
        log: &LogBuffer,
    ) -> Self {
        Self {
            measurement_filter: measurement,
            field_filter: field,
            from_type,
            to_type,
            updates: BTreeMap::new(),
            logger: log.scoped("update-field-type"),
        }
    }
}

impl Rule for UpdateFieldTypeRule {
    fn name(&self) -> &'static str {
        "update-field-type"
    }

    fn check_mode(&mut self, _check: bool) {}

    fn flags(&self) -> u32 {
        STANDARD
    }

    fn filter_key(&self, _key: &[u8]) -> bool {
        true
    }

    fn start_shard(&mut self, _shard: &ShardInfo) -> bool {
        self.updates.clear();
        true
    }

    fn end_shard(&mut self, index: &mut FieldIndex) -> CoreResult<()> {
        for (measurement, fields) in std::mem::take(&mut self.updates) {
            let field_set = index.fields_by(&measurement).cloned().ok_or_else(|| {
                CoreError::invalid_value(
                    measurement.clone(),
                    "could not find fields in index for measurement",
                )
            })?;

            for field in fields {
                let declared = field_set.field(&field).ok_or_else(|| {
                    CoreError::invalid_value(
                        field.clone(),
                        format!("could not find field in index for measurement '{measurement}'"),
                    )
                })?;

                if declared != self.to_type {
                    self.logger.record(format!(
                        "converting type of field '{field}' measurement '{measurement}' \
                         from '{}' to '{}'",
                        self.from_type, self.to_type
                    ));
                    index
                        .create_fields_if_not_exists(&measurement)
                        .set(field, self.to_type);
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

        if !self.measurement_filter.filter(measurement.as_bytes())
            || !self.field_filter.filter(field)
        {
            return Ok(Some((composite.to_vec(), values)));
        }

        let batch_type = values_type(&values)?;
        if batch_type != self.from_type || batch_type == self.to_type {
            return Ok(Some((composite.to_vec(), values)));
        }

        let field = String::from_utf8_lossy(field).into_owned();
        let mut new_values = Vec::with_capacity(values.len());
        for value in values {
            let (converted, changed) = ensure_value_type(value, self.to_type)?;
            if changed {
                self.logger.record(format!(
                    "converting value to type '{}' for field '{field}' \
                     of measurement '{measurement}'",
                    self.to_type
                ));
                self.updates
                    .entry(measurement.clone())
                    .or_default()
                    .insert(field.clone());
            }
            new_values.push(converted);
        }

        Ok(Some((composite.to_vec(), new_values)))
    }
}

/// Casts `value` to `expected`, returning the value and whether it changed.
pub fn ensure_value_type(value: Value, expected: FieldType) -> CoreResult<(Value, bool)> {
    match expected {
        FieldType::Float => cast_to_float(value),
        FieldType::Integer => cast_to_integer(value),
        FieldType::Boolean => cast_to_boolean(value),
        FieldType::String => cast_to_string(value),
        FieldType::Unsigned => Err(CoreError::type_cast(
            "invalid cast for data type 'unsigned'",
        )),
    }
}

fn cast_to_float(value: Value) -> CoreResult<(Value, bool)> {
    match value {
        Value::Float(..) => Ok((value, false)),
        Value::Integer(ts, v) => Ok((Value::Float(ts, v as f64), true)),
        Value::Unsigned(ts, v) => Ok((Value::Float(ts, v as f64), true)),
        Value::Boolean(..) => Err(CoreError::type_cast("could not cast bool value to float")),
        Value::String(ts, v) => {
            let parsed: f64 = v
                .parse()
                .map_err(|_| CoreError::type_cast(format!("could not parse '{v}' as float")))?;
            Ok((Value::Float(ts, parsed), true))
        }
    }
}

fn cast_to_integer(value: Value) -> CoreResult<(Value, bool)> {
    match value {
        Value::Float(ts, v) => Ok((Value::Integer(ts, v as i64), true)),
        Value::Integer(..) | Value::Unsigned(..) => Ok((value, false)),
        Value::Boolean(ts, v) => Ok((Value::Integer(ts, i64::from(v)), true)),
        Value::String(ts, v) => {
            let parsed: i64 = v
                .parse()
                .map_err(|_| CoreError::type_cast(format!("could not parse '{v}' as integer")))?;
            Ok((Value::Integer(ts, parsed), true))
        }
    }
}

fn cast_to_boolean(value: Value) -> CoreResult<(Value, bool)> {
    match value {
        Value::Float(ts, v) => Ok((Value::Boolean(ts, v != 0.0), true)),
        Value::Integer(ts, v) => Ok((Value::Boolean(ts, v == 1), true)),
        Value::Unsigned(ts, v) => Ok((Value::Boolean(ts, v == 1), true)),
        Value::Boolean(..) => Ok((value, false)),
        Value::String(ts, v) => {
            let parsed = parse_bool(&v)
                .ok_or_else(|| CoreError::type_cast(format!("could not parse '{v}' as bool")))?;
            Ok((Value::Boolean(ts, parsed), true))
        }
    }
}

fn cast_to_string(value: Value) -> CoreResult<(Value, bool)> {
    match value {
        Value::Float(ts, v) => Ok((Value::String(ts, format!("{v:.6}")), true)),
        Value::Integer(ts, v) => Ok((Value::String(ts, v.to_string()), true)),
        Value::Unsigned(ts, v) => Ok((Value::String(ts, v.to_string()), true)),
        Value::Boolean(ts, v) => Ok((Value::String(ts, v.to_string()), true)),
        Value::String(..) => Ok((value, false)),
    }
}

// Accepts the same spellings as Go's strconv.ParseBool, which the original
// data may rely on.
fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// TOML configuration for [`UpdateFieldTypeRule`].
#[derive(Default)]
pub struct UpdateFieldTypeRuleConfig {
    /// Measurement filter (required).
    pub measurement: Option<Filter>,
    /// Field name filter (required).
    pub field: Option<Filter>,
    /// Source type name (required).
    pub from_type: String,
    /// Target type name (required).
    pub to_type: String,
}

impl RuleConfig for UpdateFieldTypeRuleConfig {
    fn sample(&self) -> &'static str {
        r#"
        fromType = "float"
        toType = "integer"
        [measurement.strings]
            equal = "cpu"
        [field.pattern]
            pattern = "^(idle|active)"
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        self.measurement = take_filter(table, "measurement")?;
        self.field = take_filter(table, "field")?;
        if let Some(from) = take_str(table, "fromType")? {
            self.from_type = from;
        }
        if let Some(to) = take_str(table, "toType")? {
            self.to_type = to;
        }
        Ok(())
    }

    fn build(&self, log: &LogBuffer) -> CoreResult<Box<dyn Rule>> {
        let from_type: FieldType = self
            .from_type
            .parse()
            .map_err(|_| CoreError::unknown_field_type(&self.from_type))?;
        let to_type: FieldType = self
            .to_type
            .parse()
            .map_err(|_| CoreError::unknown_field_type(&self.to_type))?;

        let measurement = self
            .measurement
            .clone()
            .ok_or(CoreError::MissingMeasurementFilter)?;
        let field = self.field.clone().ok_or(CoreError::MissingFieldFilter)?;

        Ok(Box::new(UpdateFieldTypeRule::new(
            measurement,
            field,
            from_type,
            to_type,
            log,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests_support::{composite, test_shard};

    fn gauge_rule(from: FieldType, to: FieldType) -> UpdateFieldTypeRule {
        UpdateFieldTypeRule::new(
            Filter::Strings(crate::filter::StringsFilter {
                has_suffix: Some(".gauge".to_string()),
                ..Default::default()
            }),
            Filter::Strings(crate::filter::StringsFilter {
                equal: Some("value".to_string()),
                ..Default::default()
            }),
            from,
            to,
            &LogBuffer::new(),
        )
    }

    fn strings(points: &[(i64, &str)]) -> Vec<Value> {
        points
            .iter()
            .map(|&(ts, v)| Value::String(ts, v.to_string()))
            .collect()
    }

    #[test]
    fn string_to_integer() {
        let mut rule = gauge_rule(FieldType::String, FieldType::Integer);
        let key = composite("requests.gauge", &[], "value");

        let (_, values) = rule
            .apply(&key, strings(&[(1, "12"), (2, "15"), (3, "20")]))
            .unwrap()
            .unwrap();
        assert_eq!(
            values,
            vec![
                Value::Integer(1, 12),
                Value::Integer(2, 15),
                Value::Integer(3, 20)
            ]
        );
        assert!(rule.updates["requests.gauge"].contains("value"));
    }

    #[test]
    fn string_to_integer_parse_failure_is_fatal() {
        let mut rule = gauge_rule(FieldType::String, FieldType::Integer);
        let key = composite("requests.gauge", &[], "value");
        assert!(matches!(
            rule.apply(&key, strings(&[(1, "12.8")])),
            Err(CoreError::TypeCast { .. })
        ));
    }

    #[test]
    fn string_to_boolean() {
        let mut rule = gauge_rule(FieldType::String, FieldType::Boolean);
        let key = composite("up.gauge", &[], "value");

        let (_, values) = rule
            .apply(
                &key,
                strings(&[(1, "0"), (2, "1"), (3, "false"), (4, "true")]),
            )
            .unwrap()
            .unwrap();
        assert_eq!(
            values,
            vec![
                Value::Boolean(1, false),
                Value::Boolean(2, true),
                Value::Boolean(3, false),
                Value::Boolean(4, true)
            ]
        );

        assert!(matches!(
            rule.apply(&key, strings(&[(1, "up"), (2, "down")])),
            Err(CoreError::TypeCast { .. })
        ));
    }

    #[test]
    fn bool_to_float_is_forbidden() {
        let mut rule = gauge_rule(FieldType::Boolean, FieldType::Float);
        let key = composite("up.gauge", &[], "value");
        assert!(rule
            .apply(&key, vec![Value::Boolean(1, true)])
            .is_err());
    }

    #[test]
    fn float_to_string_uses_six_decimals() {
        let (value, changed) =
            ensure_value_type(Value::Float(1, 1.5), FieldType::String).unwrap();
        assert_eq!(value, Value::String(1, "1.500000".to_string()));
        assert!(changed);
    }

    #[test]
    fn non_matching_type_passes_through() {
        let mut rule = gauge_rule(FieldType::String, FieldType::Integer);
        let key = composite("requests.gauge", &[], "value");
        let values = vec![Value::Float(1, 1.0)];

        let (_, out) = rule.apply(&key, values.clone()).unwrap().unwrap();
        assert_eq!(out, values);
        assert!(rule.updates.is_empty());
    }

    #[test]
    fn end_shard_updates_declared_type() {
        let (mut index, _dir) =
            test_shard(&[("requests.gauge", &[("value", FieldType::String)])]);

        let mut rule = gauge_rule(FieldType::String, FieldType::Integer);
        rule.apply(
            &composite("requests.gauge", &[], "value"),
            strings(&[(1, "12")]),
        )
        .unwrap();
        rule.end_shard(&mut index).unwrap();

        assert_eq!(
            index.fields_by("requests.gauge").unwrap().field("value"),
            Some(FieldType::Integer)
        );
    }

    #[test]
    fn build_rejects_unknown_types() {
        let config = UpdateFieldTypeRuleConfig {
            measurement: Some(Filter::AlwaysTrue),
            field: Some(Filter::AlwaysTrue),
            from_type: "floaty".to_string(),
            to_type: "integer".to_string(),
        };
        assert!(matches!(
            config.build(&LogBuffer::new()),
            Err(CoreError::UnknownFieldType { .. })
        ));
    }
}

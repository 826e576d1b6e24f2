//! Rule configuration loading.
//!
//! The configuration is a TOML file with one `[[rules.<name>]]` array entry
//! per rule instance. Filters are embedded as dotted child tables whose
//! last segment is the registered filter name:
//!
//! ```toml
//! [[rules.rename-measurement]]
//!     to = "linux.$1"
//!     [rules.rename-measurement.from.pattern]
//!         pattern = "^(cpu|disk)$"
//! ```
//!
//! Rules are returned in file order, which is also their application order
//! in the pipeline.

use std::fs;
use std::path::Path;

use crate::error::{CoreError, CoreResult};
use crate::logging::LogBuffer;
use crate::rules::{Rule, RuleRegistry};

/// Loads and builds every rule declared in the configuration file.
pub fn load_config(path: &Path, log: &LogBuffer) -> CoreResult<Vec<Box<dyn Rule>>> {
    let text = fs::read_to_string(path)?;
    let table: toml::Table = text
        .parse()
        .map_err(|e| CoreError::config_parse(path, e))?;

    let registry = RuleRegistry::builtin();
    let mut rules: Vec<Box<dyn Rule>> = Vec::new();

    for (section, value) in table {
        match section.as_str() {
            "rules" => {
                let rule_tables = value.as_table().ok_or_else(|| {
                    CoreError::config_parse(path, "expected a table of rules")
                })?;

                for (rule_name, entries) in rule_tables {
                    let entries = entries.as_array().ok_or_else(|| {
                        CoreError::config_parse(
                            path,
                            format!("rule '{rule_name}' must be an array of tables"),
                        )
                    })?;

                    for entry in entries {
                        let mut entry_table = entry
                            .as_table()
                            .cloned()
                            .ok_or_else(|| {
                                CoreError::config_parse(
                                    path,
                                    format!("rule '{rule_name}' must be an array of tables"),
                                )
                            })?;

                        let mut config = registry.create(rule_name)?;
                        config.unmarshal(&mut entry_table)?;
                        rules.push(config.build(log)?);
                    }
                }
            }
            // Reserved for pre-built named filters.
            "filters" => {}
            other => {
                return Err(CoreError::config_parse(
                    path,
                    format!("unsupported config file section '{other}'"),
                ))
            }
        }
    }

    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn load(text: &str) -> CoreResult<Vec<Box<dyn Rule>>> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file.flush().unwrap();
        load_config(file.path(), &LogBuffer::new())
    }

    #[test]
    fn loads_rules_in_file_order() {
        let rules = load(
            r#"
            [[rules.rename-measurement]]
                to = "linux.$1"
                [rules.rename-measurement.from.pattern]
                    pattern = "^(cpu|disk)$"

            [[rules.drop-measurement]]
                [rules.drop-measurement.dropFilter.strings]
                    equal = "swap"
        "#,
        )
        .unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name(), "rename-measurement");
        assert_eq!(rules[1].name(), "drop-measurement");
    }

    #[test]
    fn multiple_entries_per_rule_name() {
        let rules = load(
            r#"
            [[rules.drop-measurement]]
                [rules.drop-measurement.dropFilter.strings]
                    equal = "swap"
            [[rules.drop-measurement]]
                [rules.drop-measurement.dropFilter.strings]
                    equal = "processes"
        "#,
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn nested_serie_filter() {
        let rules = load(
            r#"
            [[rules.drop-serie]]
                [rules.drop-serie.dropFilter.serie]
                    [rules.drop-serie.dropFilter.serie.measurement.include]
                        includes = ["cpu"]
                    [rules.drop-serie.dropFilter.serie.tag.where]
                        cpu = "^(cpu7|cpu8)$"
        "#,
        )
        .unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn unknown_rule_is_fatal() {
        assert!(matches!(
            load("[[rules.no-such-rule]]\nx = 1\n"),
            Err(CoreError::UnknownRule { .. })
        ));
    }

    #[test]
    fn unknown_section_is_fatal() {
        assert!(matches!(
            load("[bogus]\nx = 1\n"),
            Err(CoreError::ConfigParse { .. })
        ));
    }

    #[test]
    fn filters_section_is_reserved_but_accepted() {
        assert!(load("[filters]\n").unwrap().is_empty());
    }

    #[test]
    fn invalid_toml_is_fatal() {
        assert!(matches!(
            load("not [valid toml"),
            Err(CoreError::ConfigParse { .. })
        ));
    }

    #[test]
    fn missing_rule_filter_is_fatal() {
        assert!(matches!(
            load("[[rules.rename-measurement]]\nto = \"x\"\n"),
            Err(CoreError::MissingFromFilter)
        ));
    }
}

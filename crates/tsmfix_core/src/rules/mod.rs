//! The rule contract and registry.
//!
//! A rule observes the full lifecycle of a run:
//!
//! ```text
//! start
//!   per shard: start_shard
//!     per segment: start_tsm, apply*, end_tsm
//!     per wal:     start_wal, apply*, end_wal
//!   end_shard
//! end
//! ```
//!
//! [`Rule::apply`] either passes a `(key, values)` pair through (possibly
//! rewritten) or drops it by returning `None`. Rules keep plain mutable
//! state; the pipeline is single-threaded and applies them strictly in
//! configuration order. Sidecar accumulators reset in `start_shard` and are
//! replayed against the field index in `end_shard`.

pub mod drop_field;
pub mod drop_measurement;
pub mod drop_serie;
pub mod old_serie;
pub mod rename_field;
pub mod rename_measurement;
pub mod rename_tag;
pub mod show_field_key_multiple_types;
pub mod update_field_type;
pub mod update_tag_value;

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{CoreError, CoreResult};
use crate::filter::Filter;
use crate::logging::LogBuffer;
use crate::shard::ShardInfo;
use tsmfix_codec::{FieldIndex, Value};

/// Flag: the rule reads segment files.
pub const TSM_READ: u32 = 1;
/// Flag: the rule reads WAL files.
pub const WAL_READ: u32 = TSM_READ << 1;
/// Flag: the rule rewrites segment files.
pub const TSM_WRITE: u32 = WAL_READ << 1;
/// Flag: the rule rewrites WAL files.
pub const WAL_WRITE: u32 = TSM_WRITE << 1;

/// Flag set for purely observing rules; the pipeline elides writers when
/// only these are active.
pub const READ_ONLY: u32 = TSM_READ | WAL_READ;
/// Flag set for ordinary rewriting rules.
pub const STANDARD: u32 = TSM_WRITE | WAL_WRITE;

/// A transformation applied to every streamed `(key, values)` pair.
pub trait Rule {
    /// The registered name of this rule.
    fn name(&self) -> &'static str;

    /// Disables mutation while keeping observation and reporting.
    fn check_mode(&mut self, check: bool);

    /// Returns this rule's read/write flag set.
    fn flags(&self) -> u32;

    /// Cheap pre-check; a `false` skips `apply` for this key.
    ///
    /// Write rules must stay conservative here: a skipped key is never
    /// forwarded to the rewriter, so narrowing is only safe for read-only
    /// observation.
    fn filter_key(&self, key: &[u8]) -> bool;

    /// Called once before any shard.
    fn start(&mut self) {}

    /// Called once after the last shard.
    fn end(&mut self) {}

    /// Called at the start of a shard; `false` skips the shard entirely.
    fn start_shard(&mut self, _shard: &ShardInfo) -> bool {
        true
    }

    /// Called at the end of a shard with exclusive access to its field
    /// index; sidecar accumulators are replayed and cleared here.
    fn end_shard(&mut self, _index: &mut FieldIndex) -> CoreResult<()> {
        Ok(())
    }

    /// Called before a segment; `false` skips the segment for this rule.
    fn start_tsm(&mut self, _path: &Path) -> bool {
        true
    }

    /// Called after a segment.
    fn end_tsm(&mut self) {}

    /// Called before a WAL segment; `false` skips it for this rule.
    fn start_wal(&mut self, _path: &Path) -> bool {
        true
    }

    /// Called after a WAL segment.
    fn end_wal(&mut self) {}

    /// Transforms one `(key, values)` pair; `None` drops it.
    fn apply(&mut self, key: &[u8], values: Vec<Value>)
        -> CoreResult<Option<(Vec<u8>, Vec<Value>)>>;
}

/// Renames a measurement, tag or field name.
///
/// When derived from a pattern filter the replacement expands capture
/// groups (`$1`, `${name}`); otherwise the target is a constant.
#[derive(Debug, Clone)]
pub enum Renamer {
    /// Always produces the same name.
    Constant(String),
    /// Expands the pattern's capture groups into the template.
    Pattern {
        /// The compiled source pattern.
        pattern: regex::bytes::Regex,
        /// The replacement template.
        to: String,
    },
}

impl Renamer {
    /// Builds a renamer from the filter driving the rename.
    pub fn from_filter(filter: &Filter, to: &str) -> Self {
        match filter {
            Filter::Pattern(p) => Renamer::Pattern {
                pattern: p.pattern.clone(),
                to: to.to_string(),
            },
            _ => Renamer::Constant(to.to_string()),
        }
    }

    /// Renames `name`.
    pub fn rename(&self, name: &str) -> String {
        match self {
            Renamer::Constant(to) => to.clone(),
            Renamer::Pattern { pattern, to } => {
                let replaced = pattern.replace_all(name.as_bytes(), to.as_bytes());
                String::from_utf8_lossy(&replaced).into_owned()
            }
        }
    }
}

/// Configuration of a single rule, populated from its TOML table.
pub trait RuleConfig {
    /// An example configuration, used for listings and self-tests.
    fn sample(&self) -> &'static str;

    /// Populates the config from its table.
    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()>;

    /// Builds the rule, validating the configuration.
    fn build(&self, log: &LogBuffer) -> CoreResult<Box<dyn Rule>>;
}

type NewRuleFn = fn() -> Box<dyn RuleConfig>;

/// Name → config constructor map for rules.
///
/// Registering the same name twice is a programming bug and panics. The
/// map iterates in sorted order, which is also the listing order.
pub struct RuleRegistry {
    builders: BTreeMap<&'static str, NewRuleFn>,
}

impl RuleRegistry {
    /// Creates a registry holding every built-in rule.
    pub fn builtin() -> Self {
        let mut registry = Self {
            builders: BTreeMap::new(),
        };
        registry.register("drop-field", || {
            Box::<drop_field::DropFieldRuleConfig>::default()
        });
        registry.register("drop-measurement", || {
            Box::<drop_measurement::DropMeasurementRuleConfig>::default()
        });
        registry.register("drop-serie", || {
            Box::<drop_serie::DropSerieRuleConfig>::default()
        });
        registry.register("old-serie", || {
            Box::<old_serie::OldSerieRuleConfig>::default()
        });
        registry.register("rename-field", || {
            Box::<rename_field::RenameFieldRuleConfig>::default()
        });
        registry.register("rename-measurement", || {
            Box::<rename_measurement::RenameMeasurementRuleConfig>::default()
        });
        registry.register("rename-tag", || {
            Box::<rename_tag::RenameTagRuleConfig>::default()
        });
        registry.register("show-field-key-multiple-types", || {
            Box::<show_field_key_multiple_types::ShowFieldKeyMultipleTypesConfig>::default()
        });
        registry.register("update-field-type", || {
            Box::<update_field_type::UpdateFieldTypeRuleConfig>::default()
        });
        registry.register("update-tag-value", || {
            Box::<update_tag_value::UpdateTagValueRuleConfig>::default()
        });
        registry
    }

    /// Registers a rule; panics if the name is taken.
    pub fn register(&mut self, name: &'static str, f: NewRuleFn) {
        if self.builders.insert(name, f).is_some() {
            panic!("rule {name} has already been registered");
        }
    }

    /// Creates a fresh config for `name`.
    pub fn create(&self, name: &str) -> CoreResult<Box<dyn RuleConfig>> {
        self.builders
            .get(name)
            .map(|f| f())
            .ok_or_else(|| CoreError::unknown_rule(name))
    }

    /// Iterates registered names in canonical (sorted) order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.builders.keys().copied()
    }

    /// Writes every registered rule with its sample config.
    pub fn print_list(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        for name in self.names() {
            let config = self.builders[name]();
            writeln!(out, "{name}")?;
            writeln!(out, "{}", config.sample())?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogBuffer;

    #[test]
    fn renamer_constant() {
        let filter = Filter::include(vec!["cpu".to_string()]);
        let renamer = Renamer::from_filter(&filter, "linux.cpu");
        assert_eq!(renamer.rename("cpu"), "linux.cpu");
        assert_eq!(renamer.rename("anything"), "linux.cpu");
    }

    #[test]
    fn renamer_pattern_expands_captures() {
        let filter = Filter::pattern("^(cpu|disk)$").unwrap();
        let renamer = Renamer::from_filter(&filter, "linux.$1");
        assert_eq!(renamer.rename("cpu"), "linux.cpu");
        assert_eq!(renamer.rename("disk"), "linux.disk");
        // Non-matching names pass through untouched by replace_all.
        assert_eq!(renamer.rename("mem"), "mem");
    }

    #[test]
    fn registry_lists_all_builtins() {
        let registry = RuleRegistry::builtin();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(
            names,
            vec![
                "drop-field",
                "drop-measurement",
                "drop-serie",
                "old-serie",
                "rename-field",
                "rename-measurement",
                "rename-tag",
                "show-field-key-multiple-types",
                "update-field-type",
                "update-tag-value",
            ]
        );
    }

    #[test]
    #[should_panic(expected = "already been registered")]
    fn duplicate_registration_panics() {
        let mut registry = RuleRegistry::builtin();
        registry.register("drop-field", || {
            Box::<drop_field::DropFieldRuleConfig>::default()
        });
    }

    #[test]
    fn builtin_samples_build() {
        let registry = RuleRegistry::builtin();
        let log = LogBuffer::new();
        for name in registry.names() {
            let mut config = registry.create(name).unwrap();
            let mut table: toml::Table = config.sample().parse().unwrap_or_else(|e| {
                panic!("sample for rule '{name}' is not valid TOML: {e}")
            });
            config.unmarshal(&mut table).unwrap();
            config
                .build(&log)
                .unwrap_or_else(|e| panic!("sample for rule '{name}' failed to build: {e}"));
        }
    }
}

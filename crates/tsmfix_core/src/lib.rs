//! # tsmfix core
//!
//! The rule engine and rewrite pipeline of tsmfix, an offline maintenance
//! tool that streams every series of a shard through an ordered chain of
//! declarative transformation rules and compacts the survivors back in
//! place:
//!
//! - `filter` — composable predicates over composite keys
//! - `rules` — the rule contract, registry and the built-in rules
//! - `config` — the TOML rule configuration loader
//! - `shard` — on-disk shard discovery
//! - `pipeline` — the per-shard streaming rewrite loop
//! - `rewriter` — the bounded sort/dedup cache behind segment rewrites
//! - `logging` — deduplicating action-log aggregation
//! - `bytesize` — human-readable byte sizes for flags

pub mod bytesize;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod pipeline;
pub mod rewriter;
pub mod rules;
pub mod shard;

pub use bytesize::ByteSize;
pub use config::load_config;
pub use error::{CoreError, CoreResult};
pub use filter::Filter;
pub use logging::LogBuffer;
pub use pipeline::{Pipeline, DEFAULT_CACHE_SNAPSHOT_BYTES, DEFAULT_MAX_CACHE_BYTES};
pub use rules::{Rule, RuleRegistry};
pub use shard::{load_shards, ShardInfo};

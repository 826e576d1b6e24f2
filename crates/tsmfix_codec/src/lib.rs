//! # tsmfix codec
//!
//! On-disk formats consumed by the tsmfix rewrite pipeline:
//!
//! - `segment` — immutable, sorted columnar segment files (TSM)
//! - `wal` — snappy-compressed write-ahead log segments
//! - `index` — the per-shard `fields.idx` field-type sidecar
//! - `key` — composite key split/parse/make helpers
//! - `value` — timestamped values and their field types

pub mod error;
pub mod index;
pub mod key;
pub mod limiter;
pub mod segment;
pub mod value;
pub mod wal;

pub use error::{CodecError, CodecResult};
pub use index::{FieldIndex, FieldSet, FIELD_INDEX_FILE_NAME};
pub use key::Tag;
pub use segment::{
    Compactor, SegmentReader, SegmentWriter, Snapshot, SEGMENT_EXTENSION,
    DEFAULT_COMPACT_THROUGHPUT, DEFAULT_COMPACT_THROUGHPUT_BURST,
};
pub use value::{values_type, FieldType, Value};
pub use wal::{
    DeleteEntry, WalEntry, WalEntryType, WalReader, WalSegmentWriter, WriteEntry,
    WAL_FILE_EXTENSION, WAL_FILE_PREFIX,
};

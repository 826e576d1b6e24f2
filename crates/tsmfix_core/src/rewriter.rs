//! Segment rewriters.
//!
//! The pipeline funnels surviving `(key, values)` pairs into a rewriter.
//! [`CachedRewriter`] buffers them in a bounded in-memory cache, snapshots
//! the cache to intermediate segment files when it grows past the soft
//! threshold, and finally full-compacts everything into a single segment.
//! [`NoopRewriter`] has the same surface and does nothing; it backs check
//! mode and read-only rule sets.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use tsmfix_codec::{Compactor, Snapshot, Value};

/// Destination of surviving keys during a segment pass.
pub trait SegmentRewriter {
    /// Buffers one `(key, values)` pair.
    fn write(&mut self, key: &[u8], values: Vec<Value>) -> CoreResult<()>;

    /// Flushes the in-memory cache to an intermediate segment file.
    fn write_snapshot(&mut self) -> CoreResult<()>;

    /// Full-compacts every intermediate segment written so far.
    fn compact_full(&mut self) -> CoreResult<Vec<PathBuf>>;

    /// Removes the scratch directory and its contents.
    fn close(&mut self) -> CoreResult<()>;
}

/// Rewriter backed by a bounded in-memory sort/dedup cache.
pub struct CachedRewriter {
    cache: BTreeMap<Vec<u8>, Vec<Value>>,
    cache_size: u64,
    max_cache_bytes: u64,
    flush_threshold_bytes: u64,

    compactor: Compactor,
    scratch_dir: PathBuf,
    segments: Vec<PathBuf>,
}

impl CachedRewriter {
    /// Creates a rewriter writing intermediate files into `scratch_dir`.
    ///
    /// `max_cache_bytes` is a hard cap: a write pushing the cache past it
    /// fails. `flush_threshold_bytes` is the soft cap that triggers an
    /// automatic snapshot.
    pub fn new(max_cache_bytes: u64, flush_threshold_bytes: u64, scratch_dir: &Path) -> Self {
        Self {
            cache: BTreeMap::new(),
            cache_size: 0,
            max_cache_bytes,
            flush_threshold_bytes,
            compactor: Compactor::new(scratch_dir),
            scratch_dir: scratch_dir.to_path_buf(),
            segments: Vec::new(),
        }
    }

    fn entry_size(key: &[u8], values: &[Value]) -> u64 {
        let payload: usize = values
            .iter()
            .map(|v| match v {
                Value::String(_, s) => 16 + s.len(),
                _ => 16,
            })
            .sum();
        (key.len() + payload) as u64
    }

    /// Sorts and deduplicates the cache contents; within one key the last
    /// written value wins on timestamp collisions.
    fn take_snapshot(&mut self) -> Snapshot {
        let cache = std::mem::take(&mut self.cache);
        self.cache_size = 0;

        let mut snapshot = Snapshot::new();
        for (key, values) in cache {
            let mut deduped: BTreeMap<i64, Value> = BTreeMap::new();
            for value in values {
                deduped.insert(value.unix_nanos(), value);
            }
            snapshot.insert(key, deduped.into_values().collect());
        }
        snapshot
    }

    fn restore(&mut self, snapshot: Snapshot) {
        for (key, values) in snapshot {
            self.cache_size += Self::entry_size(&key, &values);
            self.cache.insert(key, values);
        }
    }
}

impl SegmentRewriter for CachedRewriter {
    fn write(&mut self, key: &[u8], values: Vec<Value>) -> CoreResult<()> {
        let size = Self::entry_size(key, &values);
        if self.cache_size + size > self.max_cache_bytes {
            return Err(CoreError::CacheFull {
                requested: self.cache_size + size,
                max: self.max_cache_bytes,
            });
        }

        self.cache
            .entry(key.to_vec())
            .or_default()
            .extend(values);
        self.cache_size += size;

        if self.cache_size > self.flush_threshold_bytes {
            return self.write_snapshot();
        }

        Ok(())
    }

    fn write_snapshot(&mut self) -> CoreResult<()> {
        if self.cache.is_empty() {
            return Ok(());
        }

        debug!("snapshotting rewrite cache");
        let snapshot = self.take_snapshot();

        match self.compactor.write_snapshot(&snapshot) {
            Ok(files) => {
                for file in &files {
                    info!("wrote new segment file '{}'", file.display());
                }
                self.segments.extend(files);
                Ok(())
            }
            Err(e) => {
                // Partial files were already unlinked by the compactor;
                // put the data back so the caller may retry or bail out.
                self.restore(snapshot);
                Err(e.into())
            }
        }
    }

    fn compact_full(&mut self) -> CoreResult<Vec<PathBuf>> {
        if self.segments.is_empty() {
            debug!("skipping full compaction, no segment files have been written");
            return Ok(Vec::new());
        }

        let files = self.compactor.compact_full(&self.segments)?;
        Ok(files)
    }

    fn close(&mut self) -> CoreResult<()> {
        if self.scratch_dir.exists() {
            fs::remove_dir_all(&self.scratch_dir)?;
        }
        Ok(())
    }
}

/// Rewriter that swallows every write. Used in check mode and when all
/// active rules are read-only.
#[derive(Debug, Default)]
pub struct NoopRewriter;

impl SegmentRewriter for NoopRewriter {
    fn write(&mut self, _key: &[u8], _values: Vec<Value>) -> CoreResult<()> {
        Ok(())
    }

    fn write_snapshot(&mut self) -> CoreResult<()> {
        Ok(())
    }

    fn compact_full(&mut self) -> CoreResult<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    fn close(&mut self) -> CoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tsmfix_codec::SegmentReader;

    fn floats(points: &[(i64, f64)]) -> Vec<Value> {
        points.iter().map(|&(ts, v)| Value::Float(ts, v)).collect()
    }

    #[test]
    fn buffers_snapshots_and_compacts() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("seg.tsm.rewriting");
        fs::create_dir_all(&scratch).unwrap();

        let mut rewriter = CachedRewriter::new(1 << 20, 1 << 16, &scratch);
        rewriter
            .write(b"b#!~#f", floats(&[(2, 2.0)]))
            .unwrap();
        rewriter
            .write(b"a#!~#f", floats(&[(1, 1.0)]))
            .unwrap();
        rewriter.write_snapshot().unwrap();

        let files = rewriter.compact_full().unwrap();
        assert_eq!(files.len(), 1);

        let reader = SegmentReader::open(&files[0]).unwrap();
        assert_eq!(reader.key_at(0), b"a#!~#f");
        assert_eq!(reader.key_at(1), b"b#!~#f");

        rewriter.close().unwrap();
        assert!(!scratch.exists());
    }

    #[test]
    fn duplicate_timestamps_last_write_wins() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("seg.tsm.rewriting");
        fs::create_dir_all(&scratch).unwrap();

        let mut rewriter = CachedRewriter::new(1 << 20, 1 << 16, &scratch);
        rewriter.write(b"k#!~#f", floats(&[(1, 1.0)])).unwrap();
        rewriter.write(b"k#!~#f", floats(&[(1, 9.0), (2, 2.0)])).unwrap();
        rewriter.write_snapshot().unwrap();

        let files = rewriter.compact_full().unwrap();
        let mut reader = SegmentReader::open(&files[0]).unwrap();
        assert_eq!(
            reader.read_all(b"k#!~#f").unwrap(),
            floats(&[(1, 9.0), (2, 2.0)])
        );
    }

    #[test]
    fn hard_cap_rejects_oversized_writes() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("seg.tsm.rewriting");
        fs::create_dir_all(&scratch).unwrap();

        let mut rewriter = CachedRewriter::new(32, 1 << 16, &scratch);
        let err = rewriter
            .write(b"key#!~#field", floats(&[(1, 1.0), (2, 2.0), (3, 3.0)]))
            .unwrap_err();
        assert!(matches!(err, CoreError::CacheFull { .. }));
    }

    #[test]
    fn soft_threshold_triggers_auto_snapshot() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("seg.tsm.rewriting");
        fs::create_dir_all(&scratch).unwrap();

        let mut rewriter = CachedRewriter::new(1 << 20, 24, &scratch);
        rewriter.write(b"a#!~#f", floats(&[(1, 1.0)])).unwrap();
        rewriter.write(b"b#!~#f", floats(&[(1, 1.0)])).unwrap();

        assert!(!rewriter.segments.is_empty());
        assert!(rewriter.cache.is_empty());
    }

    #[test]
    fn compacting_nothing_yields_nothing() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("seg.tsm.rewriting");
        fs::create_dir_all(&scratch).unwrap();

        let mut rewriter = CachedRewriter::new(1 << 20, 1 << 16, &scratch);
        assert!(rewriter.compact_full().unwrap().is_empty());
    }

    #[test]
    fn noop_rewriter_does_nothing() {
        let mut rewriter = NoopRewriter;
        rewriter.write(b"k", floats(&[(1, 1.0)])).unwrap();
        rewriter.write_snapshot().unwrap();
        assert!(rewriter.compact_full().unwrap().is_empty());
        rewriter.close().unwrap();
    }
}

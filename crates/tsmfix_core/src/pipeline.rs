//! The shard rewrite pipeline.
//!
//! Single-threaded and strictly sequential: one shard at a time, one
//! segment at a time, one key at a time, rules applied in configuration
//! order. Segments and WAL files are processed in lexicographic path order
//! so that last-write-wins inside the rewrite cache matches the original
//! ingestion order.
//!
//! Originals are never touched until the atomic rename at the end of a
//! file pass; a crashed run leaves only scratch files
//! (`<segment>.rewriting/`, `<wal>.rewriting.tmp`), which the next run
//! clears before writing.

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::filter::Filter;
use crate::logging::LogBuffer;
use crate::rewriter::{CachedRewriter, NoopRewriter, SegmentRewriter};
use crate::rules::{Rule, TSM_READ, TSM_WRITE, WAL_READ, WAL_WRITE};
use crate::shard::ShardInfo;
use tsmfix_codec::{FieldIndex, SegmentReader, Value, WalEntry, WalReader, WalSegmentWriter};

/// Default hard cap of the rewrite cache: 1 GiB.
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 1 << 30;

/// Default soft snapshot threshold of the rewrite cache: 25 MiB.
pub const DEFAULT_CACHE_SNAPSHOT_BYTES: u64 = 25 * (1 << 20);

/// Drives the configured rules over a set of shards.
pub struct Pipeline {
    rules: Vec<Box<dyn Rule>>,
    global_filter: Filter,
    log: LogBuffer,
    check: bool,
    max_cache_bytes: u64,
    flush_threshold_bytes: u64,
}

impl Pipeline {
    /// Creates a pipeline with the default pre-filter and cache sizing.
    pub fn new(rules: Vec<Box<dyn Rule>>, log: LogBuffer) -> Self {
        Self {
            rules,
            global_filter: Filter::Pass,
            log,
            check: false,
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            flush_threshold_bytes: DEFAULT_CACHE_SNAPSHOT_BYTES,
        }
    }

    /// Sets a global pre-filter; keys it matches are excluded from
    /// processing.
    pub fn with_global_filter(mut self, filter: Filter) -> Self {
        self.global_filter = filter;
        self
    }

    /// Enables or disables check mode (observe and report, never mutate).
    pub fn with_check_mode(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// Overrides the rewrite cache sizing.
    pub fn with_cache_sizes(mut self, max_bytes: u64, snapshot_bytes: u64) -> Self {
        self.max_cache_bytes = max_bytes;
        self.flush_threshold_bytes = snapshot_bytes;
        self
    }

    /// Returns the shared log buffer.
    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    /// Flushes the aggregated action log.
    pub fn flush_log(&self, out: &mut impl Write) -> std::io::Result<()> {
        self.log.flush(out)
    }

    /// Runs every rule over every shard.
    pub fn run(&mut self, shards: &[ShardInfo]) -> CoreResult<()> {
        for rule in &mut self.rules {
            rule.check_mode(self.check);
            rule.start();
        }

        for shard in shards {
            self.process_shard(shard)?;
        }

        for rule in &mut self.rules {
            rule.end();
        }

        Ok(())
    }

    fn process_shard(&mut self, shard: &ShardInfo) -> CoreResult<()> {
        info!("enforcing shard {}...", shard.id);

        let active: Vec<usize> = (0..self.rules.len())
            .filter(|&i| self.rules[i].start_shard(shard))
            .collect();

        let mut index = FieldIndex::open(&shard.fields_index_path())?;

        let mut tsm_files = shard.tsm_files.clone();
        tsm_files.sort();
        debug!("shard {}: enforcing {} tsm file(s)", shard.id, tsm_files.len());
        for file in &tsm_files {
            self.process_tsm(&active, file)?;
        }

        let mut wal_files = shard.wal_files.clone();
        wal_files.sort();
        debug!("shard {}: enforcing {} wal file(s)", shard.id, wal_files.len());
        for file in &wal_files {
            self.process_wal(&active, file)?;
        }

        for rule in &mut self.rules {
            rule.end_shard(&mut index)?;
        }

        if !self.check {
            index
                .save()
                .map_err(|e| CoreError::index_persist(index.path(), e))?;
        }

        Ok(())
    }

    fn process_tsm(&mut self, shard_active: &[usize], path: &Path) -> CoreResult<()> {
        info!("enforcing TSM file '{}'...", path.display());

        let active: Vec<usize> = shard_active
            .iter()
            .copied()
            .filter(|&i| self.rules[i].start_tsm(path))
            .collect();
        if active.is_empty() {
            debug!("no candidate rule found for processing TSM file, skipping");
            return Ok(());
        }

        let mut reader = match SegmentReader::open(path) {
            Ok(reader) => reader,
            Err(e) => {
                warn!("unable to read {}, skipping: {e}", path.display());
                return Ok(());
            }
        };

        let read_rules: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&i| self.rules[i].flags() & TSM_READ != 0)
            .collect();
        let write_rules: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&i| self.rules[i].flags() & TSM_WRITE != 0)
            .collect();

        let mut rewriter = self.create_rewriter(path, &write_rules)?;

        let key_count = reader.key_count();
        debug!("{key_count} total keys");
        let mut filtered = 0usize;

        for i in 0..key_count {
            let key = reader.key_at(i).to_vec();

            if self.global_filter.filter(&key) {
                filtered += 1;
                continue;
            }

            let matching_read: Vec<usize> = read_rules
                .iter()
                .copied()
                .filter(|&r| self.rules[r].filter_key(&key))
                .collect();
            let matching_write: Vec<usize> = write_rules
                .iter()
                .copied()
                .filter(|&r| self.rules[r].filter_key(&key))
                .collect();
            if matching_read.is_empty() && matching_write.is_empty() {
                filtered += 1;
                continue;
            }

            let values = match reader.read_all(&key) {
                Ok(values) => values,
                Err(e) => {
                    warn!(
                        "unable to read key {:?} in {}, skipping: {e}",
                        String::from_utf8_lossy(&key),
                        path.display()
                    );
                    continue;
                }
            };

            for &r in &matching_read {
                self.rules[r].apply(&key, values.clone())?;
            }

            let mut current = Some((key, values));
            for &r in &matching_write {
                let (k, v) = current.take().expect("set before the loop");
                match self.rules[r].apply(&k, v)? {
                    Some(next) => current = Some(next),
                    None => break,
                }
            }

            if let Some((k, v)) = current {
                rewriter.write(&k, v)?;
            }
        }

        rewriter.write_snapshot()?;
        let files = rewriter.compact_full()?;
        if !files.is_empty() {
            if files.len() > 1 {
                return Err(CoreError::FullCompaction { files });
            }
            let new_file = &files[0];
            debug!("renaming '{}' to '{}'", new_file.display(), path.display());
            fs::rename(new_file, path).map_err(|e| CoreError::rename(new_file, path, e))?;
        }

        debug!(
            "{filtered} ({}%) total filtered keys",
            filtered * 100 / key_count.max(1)
        );
        rewriter.close()?;

        for rule in &mut self.rules {
            rule.end_tsm();
        }

        Ok(())
    }

    fn create_rewriter(
        &self,
        path: &Path,
        write_rules: &[usize],
    ) -> CoreResult<Box<dyn SegmentRewriter>> {
        if self.check || write_rules.is_empty() {
            return Ok(Box::new(NoopRewriter));
        }

        // Clear stale scratch files from a previous (possibly crashed) run.
        let output_dir = path_with_suffix(path, ".rewriting");
        if output_dir.exists() {
            for entry in fs::read_dir(&output_dir)? {
                fs::remove_file(entry?.path())?;
            }
        } else {
            fs::create_dir(&output_dir)?;
        }

        let stale_index = path_with_suffix(path, ".idx.tmp");
        if stale_index.exists() {
            fs::remove_file(&stale_index)?;
        }

        debug!(
            "creating cached rewriter to directory '{}'",
            output_dir.display()
        );
        Ok(Box::new(CachedRewriter::new(
            self.max_cache_bytes,
            self.flush_threshold_bytes,
            &output_dir,
        )))
    }

    fn process_wal(&mut self, shard_active: &[usize], path: &Path) -> CoreResult<()> {
        info!("enforcing WAL file '{}'...", path.display());

        let active: Vec<usize> = shard_active
            .iter()
            .copied()
            .filter(|&i| self.rules[i].start_wal(path))
            .collect();
        if active.is_empty() {
            debug!("no candidate rule found for processing WAL file, skipping");
            return Ok(());
        }

        if !path.exists() {
            return Ok(());
        }
        let mut reader = WalReader::open(path)?;

        let read_rules: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&i| self.rules[i].flags() & WAL_READ != 0)
            .collect();
        let write_rules: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&i| self.rules[i].flags() & WAL_WRITE != 0)
            .collect();

        let output_path = path_with_suffix(path, ".rewriting.tmp");
        let mut writer = if self.check || write_rules.is_empty() {
            None
        } else {
            if output_path.exists() {
                fs::remove_file(&output_path)?;
            }
            Some(WalSegmentWriter::create(&output_path)?)
        };

        let mut count = 0usize;
        let mut corrupt = false;

        loop {
            let mut entry = match reader.next_entry() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        "file {} corrupt at position {}: {e}",
                        path.display(),
                        reader.entries_read()
                    );
                    corrupt = true;
                    break;
                }
            };

            if let WalEntry::Write(write) = &mut entry {
                // Snapshot the batches first: a rename may insert under a
                // key that is itself still pending.
                let entries: Vec<(Vec<u8>, Vec<Value>)> = write
                    .values
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let mut to_delete = Vec::new();

                for (key, values) in entries {
                    for &r in &read_rules {
                        self.rules[r].apply(&key, values.clone())?;
                    }

                    let mut current = Some((key.clone(), values));
                    for &r in &write_rules {
                        let (k, v) = current.take().expect("set before the loop");
                        match self.rules[r].apply(&k, v)? {
                            Some(next) => current = Some(next),
                            None => break,
                        }
                    }

                    match current {
                        None => to_delete.push(key),
                        Some((new_key, new_values)) => {
                            if new_key != key {
                                to_delete.push(key);
                            }
                            write.values.insert(new_key, new_values);
                        }
                    }
                }

                for key in to_delete {
                    write.values.remove(&key);
                }
            }

            if let Some(w) = writer.as_mut() {
                w.write_entry(&entry)?;
            }
            count += 1;
        }

        if corrupt {
            // Leave the original WAL alone; the rewrite is abandoned.
            drop(writer.take());
            if output_path.exists() {
                fs::remove_file(&output_path)?;
            }
        } else if let Some(w) = writer.take() {
            w.finish()?;
            debug!(
                "renaming '{}' to '{}'",
                output_path.display(),
                path.display()
            );
            fs::rename(&output_path, path)
                .map_err(|e| CoreError::rename(&output_path, path, e))?;
        }

        debug!("{count} entries");

        for rule in &mut self.rules {
            rule.end_wal();
        }

        Ok(())
    }
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

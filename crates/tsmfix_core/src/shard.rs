//! Shard discovery.
//!
//! The on-disk tree mirrors the database layout:
//!
//! ```text
//! <datadir>/<database>/<retention-policy>/<shard-id>/*.tsm + fields.idx
//! <waldir>/<database>/<retention-policy>/<shard-id>/_*.wal
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use tsmfix_codec::{FIELD_INDEX_FILE_NAME, SEGMENT_EXTENSION, WAL_FILE_EXTENSION, WAL_FILE_PREFIX};

/// Directory name reserved for the series file, never a retention policy or
/// shard.
const SERIES_FILE_DIRECTORY: &str = "_series";

/// One shard selected for processing.
#[derive(Debug, Clone)]
pub struct ShardInfo {
    /// Shard ID (the numeric directory name).
    pub id: u64,
    /// Shard directory under the data root.
    pub path: PathBuf,
    /// Database the shard belongs to.
    pub database: String,
    /// Retention policy the shard belongs to.
    pub retention_policy: String,
    /// Segment files, unsorted as discovered.
    pub tsm_files: Vec<PathBuf>,
    /// WAL segment files, unsorted as discovered.
    pub wal_files: Vec<PathBuf>,
}

impl ShardInfo {
    /// Returns the path of the shard's field-type index.
    pub fn fields_index_path(&self) -> PathBuf {
        self.path.join(FIELD_INDEX_FILE_NAME)
    }
}

/// Scans the data and WAL roots for shards matching the optional selectors.
pub fn load_shards(
    data_dir: &Path,
    wal_dir: &Path,
    database: Option<&str>,
    retention_policy: Option<&str>,
    shard_filter: Option<&str>,
) -> CoreResult<Vec<ShardInfo>> {
    let mut shards = Vec::new();

    for db_entry in read_sorted_dirs(data_dir)? {
        let db_name = dir_name(&db_entry);
        if database.is_some_and(|db| db != db_name) {
            continue;
        }

        for rp_entry in read_sorted_dirs(&db_entry)? {
            let rp_name = dir_name(&rp_entry);
            if rp_name == SERIES_FILE_DIRECTORY {
                continue;
            }
            if retention_policy.is_some_and(|rp| rp != rp_name) {
                continue;
            }

            for shard_entry in read_sorted_dirs(&rp_entry)? {
                let shard_name = dir_name(&shard_entry);
                if shard_name == SERIES_FILE_DIRECTORY {
                    continue;
                }
                if shard_filter.is_some_and(|s| s != shard_name) {
                    continue;
                }

                let id: u64 = shard_name.parse().map_err(|_| CoreError::InvalidShardId {
                    path: shard_entry.clone(),
                })?;

                let wal_path = wal_dir.join(&db_name).join(&rp_name).join(&shard_name);
                let tsm_files = list_files(&shard_entry, |name| {
                    name.ends_with(&format!(".{SEGMENT_EXTENSION}"))
                })?;
                let wal_files = list_files(&wal_path, |name| {
                    name.starts_with(WAL_FILE_PREFIX)
                        && name.ends_with(&format!(".{WAL_FILE_EXTENSION}"))
                })?;

                info!(
                    "found shard '{}' ({id}) with WAL '{}'",
                    shard_entry.display(),
                    wal_path.display()
                );

                shards.push(ShardInfo {
                    id,
                    path: shard_entry,
                    database: db_name.clone(),
                    retention_policy: rp_name.clone(),
                    tsm_files,
                    wal_files,
                });
            }
        }
    }

    Ok(shards)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn read_sorted_dirs(path: &Path) -> CoreResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        } else {
            debug!("skipping non-directory entry '{}'", entry.path().display());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn list_files(dir: &Path, matches: impl Fn(&str) -> bool) -> CoreResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if matches(&name) {
            files.push(entry.path());
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(path: &Path) {
        fs::write(path, b"").unwrap();
    }

    fn make_tree(data: &Path, wal: &Path) {
        let shard = data.join("metrics/autogen/1");
        fs::create_dir_all(&shard).unwrap();
        touch(&shard.join("00000001-02.tsm"));
        touch(&shard.join("fields.idx"));

        let shard2 = data.join("metrics/autogen/2");
        fs::create_dir_all(&shard2).unwrap();
        touch(&shard2.join("00000001-02.tsm"));

        let other = data.join("other/weekly/7");
        fs::create_dir_all(&other).unwrap();
        touch(&other.join("00000004-02.tsm"));

        fs::create_dir_all(data.join("metrics/_series")).unwrap();

        let wal_shard = wal.join("metrics/autogen/1");
        fs::create_dir_all(&wal_shard).unwrap();
        touch(&wal_shard.join("_00001.wal"));
        touch(&wal_shard.join("notawal.txt"));
    }

    #[test]
    fn scans_the_full_tree() {
        let data = tempdir().unwrap();
        let wal = tempdir().unwrap();
        make_tree(data.path(), wal.path());

        let shards = load_shards(data.path(), wal.path(), None, None, None).unwrap();
        assert_eq!(shards.len(), 3);

        let first = &shards[0];
        assert_eq!(first.id, 1);
        assert_eq!(first.database, "metrics");
        assert_eq!(first.retention_policy, "autogen");
        assert_eq!(first.tsm_files.len(), 1);
        assert_eq!(first.wal_files.len(), 1);
    }

    #[test]
    fn filters_by_database_and_shard() {
        let data = tempdir().unwrap();
        let wal = tempdir().unwrap();
        make_tree(data.path(), wal.path());

        let shards =
            load_shards(data.path(), wal.path(), Some("metrics"), None, None).unwrap();
        assert_eq!(shards.len(), 2);

        let shards =
            load_shards(data.path(), wal.path(), Some("metrics"), None, Some("2")).unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].id, 2);

        let shards =
            load_shards(data.path(), wal.path(), Some("nosuchdb"), None, None).unwrap();
        assert!(shards.is_empty());
    }

    #[test]
    fn non_numeric_shard_is_an_error() {
        let data = tempdir().unwrap();
        let wal = tempdir().unwrap();
        fs::create_dir_all(data.path().join("db/rp/notanumber")).unwrap();

        assert!(matches!(
            load_shards(data.path(), wal.path(), None, None, None),
            Err(CoreError::InvalidShardId { .. })
        ));
    }

    #[test]
    fn missing_wal_dir_is_fine() {
        let data = tempdir().unwrap();
        let wal = tempdir().unwrap();
        let shard = data.path().join("db/rp/3");
        fs::create_dir_all(&shard).unwrap();
        touch(&shard.join("00000001-02.tsm"));

        let shards = load_shards(data.path(), wal.path(), None, None, None).unwrap();
        assert_eq!(shards.len(), 1);
        assert!(shards[0].wal_files.is_empty());
    }
}

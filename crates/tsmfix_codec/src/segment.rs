//! Immutable columnar segment files.
//!
//! A segment stores sorted `(composite key, value batch)` pairs:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Header: magic "TSXF" (4) | version u16 (2)   │
//! ├──────────────────────────────────────────────┤
//! │ Blocks, one per key:                         │
//! │   key_len u16 | key | type u8 | count u32    │
//! │   | values | crc32 u32                       │
//! ├──────────────────────────────────────────────┤
//! │ Index: count u32, then per key:              │
//! │   key_len u16 | key | offset u64 | size u32  │
//! ├──────────────────────────────────────────────┤
//! │ Footer: index_offset u64 | magic "FXST" (4)  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Keys are stored and indexed in bytewise-sorted order; each block carries
//! a CRC32 over everything before the checksum. All integers little-endian.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{CodecError, CodecResult};
use crate::limiter::RateLimiter;
use crate::value::{decode_values, encode_values, Cursor, Value};

/// Magic bytes at the start of a segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"TSXF";

/// Magic bytes at the end of a segment file.
pub const SEGMENT_MAGIC_REVERSE: [u8; 4] = *b"FXST";

/// Current segment format version.
pub const SEGMENT_VERSION: u16 = 1;

/// File extension of segment files.
pub const SEGMENT_EXTENSION: &str = "tsm";

/// Header size: magic + version.
const HEADER_SIZE: u64 = 6;

/// Footer size: index offset + reverse magic.
const FOOTER_SIZE: u64 = 12;

/// Sorted, deduplicated cache contents ready to be written out.
pub type Snapshot = BTreeMap<Vec<u8>, Vec<Value>>;

#[derive(Debug, Clone)]
struct IndexEntry {
    key: Vec<u8>,
    offset: u64,
    size: u32,
}

/// Writes a segment file key by key.
///
/// Keys must be written in ascending bytewise order; a violation is a
/// [`CodecError::UnsortedKey`].
pub struct SegmentWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    position: u64,
    entries: Vec<IndexEntry>,
    last_key: Option<Vec<u8>>,
}

impl SegmentWriter {
    /// Creates a new segment file at `path`.
    pub fn create(path: &Path) -> CodecResult<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&SEGMENT_MAGIC)?;
        writer.write_all(&SEGMENT_VERSION.to_le_bytes())?;

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            position: HEADER_SIZE,
            entries: Vec::new(),
            last_key: None,
        })
    }

    /// Returns the path of the file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a key's value batch, returning the block size in bytes.
    pub fn write(&mut self, key: &[u8], values: &[Value]) -> CodecResult<usize> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(CodecError::UnsortedKey {
                    key: String::from_utf8_lossy(key).into_owned(),
                });
            }
        }

        let mut block = Vec::with_capacity(key.len() + values.len() * 16 + 16);
        block.extend_from_slice(&(key.len() as u16).to_le_bytes());
        block.extend_from_slice(key);
        encode_values(&mut block, values)?;

        let crc = crc32fast::hash(&block);
        block.extend_from_slice(&crc.to_le_bytes());

        self.writer.write_all(&block)?;
        self.entries.push(IndexEntry {
            key: key.to_vec(),
            offset: self.position,
            size: block.len() as u32,
        });
        self.position += block.len() as u64;
        self.last_key = Some(key.to_vec());

        Ok(block.len())
    }

    /// Writes the index and footer, then syncs the file to disk.
    pub fn finish(mut self) -> CodecResult<PathBuf> {
        let index_offset = self.position;

        self.writer
            .write_all(&(self.entries.len() as u32).to_le_bytes())?;
        for entry in &self.entries {
            self.writer
                .write_all(&(entry.key.len() as u16).to_le_bytes())?;
            self.writer.write_all(&entry.key)?;
            self.writer.write_all(&entry.offset.to_le_bytes())?;
            self.writer.write_all(&entry.size.to_le_bytes())?;
        }

        self.writer.write_all(&index_offset.to_le_bytes())?;
        self.writer.write_all(&SEGMENT_MAGIC_REVERSE)?;

        self.writer.flush()?;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        file.sync_all()?;

        Ok(self.path)
    }
}

/// Reads a segment file.
pub struct SegmentReader {
    file: File,
    entries: Vec<IndexEntry>,
}

impl SegmentReader {
    /// Opens a segment file and loads its index.
    pub fn open(path: &Path) -> CodecResult<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();

        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(CodecError::corrupt("file shorter than header and footer"));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if header[..4] != SEGMENT_MAGIC {
            return Err(CodecError::InvalidMagic {
                actual: header[..4].try_into().expect("header length"),
            });
        }
        let version = u16::from_le_bytes(header[4..6].try_into().expect("header length"));
        if version > SEGMENT_VERSION {
            return Err(CodecError::UnsupportedVersion { version });
        }

        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        file.read_exact(&mut footer)?;
        if footer[8..12] != SEGMENT_MAGIC_REVERSE {
            return Err(CodecError::InvalidMagic {
                actual: footer[8..12].try_into().expect("footer length"),
            });
        }

        let index_offset = u64::from_le_bytes(footer[..8].try_into().expect("footer length"));
        if index_offset < HEADER_SIZE || index_offset > file_size - FOOTER_SIZE {
            return Err(CodecError::corrupt("index offset out of bounds"));
        }

        let index_size = (file_size - FOOTER_SIZE - index_offset) as usize;
        let mut index_bytes = vec![0u8; index_size];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut index_bytes)?;

        let entries = Self::decode_index(&index_bytes)?;

        Ok(Self { file, entries })
    }

    fn decode_index(bytes: &[u8]) -> CodecResult<Vec<IndexEntry>> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor.u32()? as usize;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = cursor.u16()? as usize;
            let key = cursor.bytes(key_len)?.to_vec();
            let offset = cursor.u64()?;
            let size = cursor.u32()?;
            entries.push(IndexEntry { key, offset, size });
        }

        Ok(entries)
    }

    /// Returns the number of keys in the segment.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns the key at index `i` of the sorted enumeration.
    pub fn key_at(&self, i: usize) -> &[u8] {
        &self.entries[i].key
    }

    /// Reads and verifies the full value batch for `key`.
    pub fn read_all(&mut self, key: &[u8]) -> CodecResult<Vec<Value>> {
        let entry = self
            .entries
            .binary_search_by(|e| e.key.as_slice().cmp(key))
            .map(|i| self.entries[i].clone())
            .map_err(|_| {
                CodecError::value_decode(format!(
                    "key {:?} not present in segment",
                    String::from_utf8_lossy(key)
                ))
            })?;

        let mut block = vec![0u8; entry.size as usize];
        self.file.seek(SeekFrom::Start(entry.offset))?;
        self.file.read_exact(&mut block)?;

        if block.len() < 4 {
            return Err(CodecError::value_decode("block shorter than checksum"));
        }
        let (payload, crc_bytes) = block.split_at(block.len() - 4);
        let expected = u32::from_le_bytes(crc_bytes.try_into().expect("split length"));
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = Cursor::new(payload);
        let key_len = cursor.u16()? as usize;
        let stored_key = cursor.bytes(key_len)?;
        if stored_key != key {
            return Err(CodecError::value_decode("index points at the wrong block"));
        }

        let (values, _) = decode_values(&payload[cursor.position..])?;
        Ok(values)
    }
}

/// Default sustained compaction throughput: 48 MiB/s.
pub const DEFAULT_COMPACT_THROUGHPUT: u64 = 48 * 1024 * 1024;

/// Default compaction burst allowance: 48 MiB.
pub const DEFAULT_COMPACT_THROUGHPUT_BURST: u64 = 48 * 1024 * 1024;

/// Writes snapshots and runs full compactions inside a scratch directory.
pub struct Compactor {
    dir: PathBuf,
    limiter: RateLimiter,
    sequence: u32,
}

impl Compactor {
    /// Creates a compactor writing into `dir` with the default rate limit.
    pub fn new(dir: &Path) -> Self {
        Self::with_rate_limit(
            dir,
            DEFAULT_COMPACT_THROUGHPUT,
            DEFAULT_COMPACT_THROUGHPUT_BURST,
        )
    }

    /// Creates a compactor with an explicit throughput limit.
    ///
    /// A throughput of zero disables rate limiting.
    pub fn with_rate_limit(dir: &Path, bytes_per_sec: u64, burst: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            limiter: RateLimiter::new(bytes_per_sec, burst),
            sequence: 0,
        }
    }

    fn next_path(&mut self, level: u8) -> PathBuf {
        self.sequence += 1;
        self.dir
            .join(format!("{:08}-{:02}.{}", self.sequence, level, SEGMENT_EXTENSION))
    }

    /// Writes a snapshot to a new level-1 segment file.
    ///
    /// Empty snapshots produce no file; a failed write unlinks the partial
    /// file before returning.
    pub fn write_snapshot(&mut self, snapshot: &Snapshot) -> CodecResult<Vec<PathBuf>> {
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let path = self.next_path(1);
        self.write_segment(&path, snapshot.iter().map(|(k, v)| (k.as_slice(), v)))
            .map(|path| vec![path])
    }

    fn write_segment<'a>(
        &mut self,
        path: &Path,
        entries: impl Iterator<Item = (&'a [u8], &'a Vec<Value>)>,
    ) -> CodecResult<PathBuf> {
        let result = (|| {
            let mut writer = SegmentWriter::create(path)?;
            for (key, values) in entries {
                let written = writer.write(key, values)?;
                self.limiter.take(written);
            }
            writer.finish()
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(path);
        }
        result
    }

    /// Merges the given segments into a single level-2 segment.
    ///
    /// Inputs must be passed in write order: when two segments carry the
    /// same timestamp for a key, the later segment wins.
    pub fn compact_full(&mut self, paths: &[PathBuf]) -> CodecResult<Vec<PathBuf>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        let out_path = self.next_path(2);
        let result = (|| {
            let mut readers = paths
                .iter()
                .map(|p| SegmentReader::open(p))
                .collect::<CodecResult<Vec<_>>>()?;
            let mut cursors = vec![0usize; readers.len()];
            let mut writer = SegmentWriter::create(&out_path)?;

            loop {
                // Smallest key among the per-segment cursors.
                let mut min_key: Option<Vec<u8>> = None;
                for (reader, &cursor) in readers.iter().zip(&cursors) {
                    if cursor >= reader.key_count() {
                        continue;
                    }
                    let key = reader.key_at(cursor);
                    if min_key.as_deref().map_or(true, |min| key < min) {
                        min_key = Some(key.to_vec());
                    }
                }
                let Some(key) = min_key else {
                    break;
                };

                // Merge every segment's batch for that key, later files
                // winning on timestamp collisions.
                let mut merged: BTreeMap<i64, Value> = BTreeMap::new();
                for (reader, cursor) in readers.iter_mut().zip(cursors.iter_mut()) {
                    if *cursor >= reader.key_count() || reader.key_at(*cursor) != key.as_slice()
                    {
                        continue;
                    }
                    for value in reader.read_all(&key)? {
                        merged.insert(value.unix_nanos(), value);
                    }
                    *cursor += 1;
                }

                let values: Vec<Value> = merged.into_values().collect();
                let written = writer.write(&key, &values)?;
                self.limiter.take(written);
            }

            writer.finish()
        })();

        match result {
            Ok(path) => Ok(vec![path]),
            Err(e) => {
                let _ = std::fs::remove_file(&out_path);
                Err(e)
            }
        }
    }
}

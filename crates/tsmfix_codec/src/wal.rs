//! Write-ahead log segments.
//!
//! A WAL segment is an append-only stream of entries, each snappy-compressed:
//!
//! ```text
//! entry: type u8 | len u32 | snappy(payload)
//! ```
//!
//! A write entry's payload carries one value batch per composite key; a
//! delete entry carries a list of keys. Decoded write entries expose their
//! batches as a mutable map so a rewrite pass can drop and rename keys in
//! place before re-encoding.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{CodecError, CodecResult};
use crate::value::{decode_values, encode_values, Cursor, Value};

/// File name prefix of WAL segments.
pub const WAL_FILE_PREFIX: &str = "_";

/// File extension of WAL segments.
pub const WAL_FILE_EXTENSION: &str = "wal";

/// Discriminant for WAL entry framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalEntryType {
    /// A batch of writes.
    Write = 1,
    /// A batch of key deletions.
    Delete = 2,
}

impl WalEntryType {
    fn from_byte(byte: u8) -> CodecResult<Self> {
        match byte {
            1 => Ok(WalEntryType::Write),
            2 => Ok(WalEntryType::Delete),
            other => Err(CodecError::corrupt(format!(
                "unknown WAL entry type {other}"
            ))),
        }
    }
}

/// A decoded WAL entry.
#[derive(Debug, Clone, PartialEq)]
pub enum WalEntry {
    /// Writes, keyed by composite key.
    Write(WriteEntry),
    /// Key deletions.
    Delete(DeleteEntry),
}

/// A batch of writes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteEntry {
    /// Value batches by composite key, mutable in place.
    pub values: BTreeMap<Vec<u8>, Vec<Value>>,
}

/// A batch of key deletions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeleteEntry {
    /// The keys being deleted.
    pub keys: Vec<Vec<u8>>,
}

impl WalEntry {
    /// Returns the framing type of this entry.
    pub fn entry_type(&self) -> WalEntryType {
        match self {
            WalEntry::Write(_) => WalEntryType::Write,
            WalEntry::Delete(_) => WalEntryType::Delete,
        }
    }

    /// Encodes the entry payload (uncompressed).
    pub fn encode_payload(&self) -> CodecResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            WalEntry::Write(entry) => {
                buf.extend_from_slice(&(entry.values.len() as u32).to_le_bytes());
                for (key, values) in &entry.values {
                    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
                    buf.extend_from_slice(key);
                    encode_values(&mut buf, values)?;
                }
            }
            WalEntry::Delete(entry) => {
                buf.extend_from_slice(&(entry.keys.len() as u32).to_le_bytes());
                for key in &entry.keys {
                    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
                    buf.extend_from_slice(key);
                }
            }
        }
        Ok(buf)
    }

    /// Decodes an entry payload.
    pub fn decode_payload(entry_type: WalEntryType, payload: &[u8]) -> CodecResult<Self> {
        let mut cursor = Cursor::new(payload);
        let count = cursor.u32()? as usize;

        match entry_type {
            WalEntryType::Write => {
                let mut values = BTreeMap::new();
                for _ in 0..count {
                    let key_len = cursor.u16()? as usize;
                    let key = cursor.bytes(key_len)?.to_vec();
                    let (batch, consumed) = decode_values(&payload[cursor.position..])?;
                    cursor.position += consumed;
                    values.insert(key, batch);
                }
                Ok(WalEntry::Write(WriteEntry { values }))
            }
            WalEntryType::Delete => {
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_len = cursor.u16()? as usize;
                    keys.push(cursor.bytes(key_len)?.to_vec());
                }
                Ok(WalEntry::Delete(DeleteEntry { keys }))
            }
        }
    }
}

/// Reads WAL entries from a segment file.
pub struct WalReader {
    reader: BufReader<File>,
    path: PathBuf,
    entries_read: usize,
}

impl WalReader {
    /// Opens a WAL segment for reading.
    pub fn open(path: &Path) -> CodecResult<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            path: path.to_path_buf(),
            entries_read: 0,
        })
    }

    /// Returns the number of entries decoded so far.
    pub fn entries_read(&self) -> usize {
        self.entries_read
    }

    /// Reads the next entry; `None` at a clean end of file.
    pub fn next_entry(&mut self) -> CodecResult<Option<WalEntry>> {
        let mut type_byte = [0u8; 1];
        match self.reader.read_exact(&mut type_byte) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let entry_type = WalEntryType::from_byte(type_byte[0])?;

        let mut len_bytes = [0u8; 4];
        self.reader.read_exact(&mut len_bytes).map_err(|_| {
            CodecError::corrupt(format!(
                "truncated WAL entry at position {} in {}",
                self.entries_read,
                self.path.display()
            ))
        })?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut compressed = vec![0u8; len];
        self.reader.read_exact(&mut compressed).map_err(|_| {
            CodecError::corrupt(format!(
                "truncated WAL entry at position {} in {}",
                self.entries_read,
                self.path.display()
            ))
        })?;

        let payload = snap::raw::Decoder::new().decompress_vec(&compressed)?;
        let entry = WalEntry::decode_payload(entry_type, &payload)?;
        self.entries_read += 1;
        Ok(Some(entry))
    }
}

impl Iterator for WalReader {
    type Item = CodecResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

/// Writes WAL entries to a segment file.
pub struct WalSegmentWriter {
    writer: BufWriter<File>,
}

impl WalSegmentWriter {
    /// Creates a new WAL segment at `path`.
    pub fn create(path: &Path) -> CodecResult<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Writes a pre-compressed payload with its framing.
    pub fn write(&mut self, entry_type: WalEntryType, compressed: &[u8]) -> CodecResult<()> {
        self.writer.write_all(&[entry_type as u8])?;
        self.writer
            .write_all(&(compressed.len() as u32).to_le_bytes())?;
        self.writer.write_all(compressed)?;
        Ok(())
    }

    /// Encodes, compresses and writes an entry.
    pub fn write_entry(&mut self, entry: &WalEntry) -> CodecResult<()> {
        let payload = entry.encode_payload()?;
        let compressed = snap::raw::Encoder::new().compress_vec(&payload)?;
        self.write(entry.entry_type(), &compressed)
    }

    /// Flushes and syncs the segment to disk.
    pub fn finish(self) -> CodecResult<()> {
        let mut writer = self.writer;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        file.sync_all()?;
        Ok(())
    }
}

//! Per-shard field-type index.
//!
//! Each shard carries a `fields.idx` sidecar mapping every measurement to
//! its declared `field → type` set. The index is loaded into memory for the
//! duration of a shard pass, mutated there, and saved exactly once at the
//! end of the pass using the write-then-rename pattern for crash safety.
//!
//! On-disk layout, little-endian, CRC32 over everything before the trailing
//! checksum:
//!
//! ```text
//! magic "TSXI" (4) | version u16 (2)
//! measurement_count u32
//!   per measurement: name_len u16 | name | field_count u32
//!     per field: name_len u16 | name | type u8
//! crc32 u32
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{CodecError, CodecResult};
use crate::value::{Cursor, FieldType};

/// File name of the index inside a shard directory.
pub const FIELD_INDEX_FILE_NAME: &str = "fields.idx";

/// Magic bytes at the start of the index file.
pub const FIELD_INDEX_MAGIC: [u8; 4] = *b"TSXI";

/// Current index format version.
pub const FIELD_INDEX_VERSION: u16 = 1;

/// The declared fields of a single measurement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    fields: BTreeMap<String, FieldType>,
}

impl FieldSet {
    /// Returns the declared type of `name`, if present.
    pub fn field(&self, name: &str) -> Option<FieldType> {
        self.fields.get(name).copied()
    }

    /// Declares or overwrites a field's type.
    pub fn set(&mut self, name: impl Into<String>, field_type: FieldType) {
        self.fields.insert(name.into(), field_type);
    }

    /// Removes a field, returning its former type.
    pub fn remove(&mut self, name: &str) -> Option<FieldType> {
        self.fields.remove(name)
    }

    /// Iterates fields in sorted name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldType)> {
        self.fields.iter().map(|(name, ty)| (name.as_str(), *ty))
    }

    /// Returns the number of declared fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if no fields are declared.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// The field-type index of one shard.
#[derive(Debug)]
pub struct FieldIndex {
    path: PathBuf,
    measurements: BTreeMap<String, FieldSet>,
}

impl FieldIndex {
    /// Opens the index at `path`; a missing file yields an empty index.
    pub fn open(path: &Path) -> CodecResult<Self> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                measurements: BTreeMap::new(),
            });
        }

        let bytes = fs::read(path)?;
        let measurements = Self::decode(&bytes)?;
        Ok(Self {
            path: path.to_path_buf(),
            measurements,
        })
    }

    fn decode(bytes: &[u8]) -> CodecResult<BTreeMap<String, FieldSet>> {
        if bytes.len() < 10 {
            return Err(CodecError::corrupt("field index shorter than header"));
        }

        let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let expected = u32::from_le_bytes(crc_bytes.try_into().expect("split length"));
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = Cursor::new(payload);
        let magic: [u8; 4] = cursor.array()?;
        if magic != FIELD_INDEX_MAGIC {
            return Err(CodecError::InvalidMagic { actual: magic });
        }
        let version = cursor.u16()?;
        if version > FIELD_INDEX_VERSION {
            return Err(CodecError::UnsupportedVersion { version });
        }

        let measurement_count = cursor.u32()? as usize;
        let mut measurements = BTreeMap::new();
        for _ in 0..measurement_count {
            let name_len = cursor.u16()? as usize;
            let name = String::from_utf8(cursor.bytes(name_len)?.to_vec())
                .map_err(|_| CodecError::corrupt("measurement name is not valid UTF-8"))?;

            let field_count = cursor.u32()? as usize;
            let mut set = FieldSet::default();
            for _ in 0..field_count {
                let field_len = cursor.u16()? as usize;
                let field = String::from_utf8(cursor.bytes(field_len)?.to_vec())
                    .map_err(|_| CodecError::corrupt("field name is not valid UTF-8"))?;
                let ty = FieldType::from_byte(cursor.u8()?)?;
                set.set(field, ty);
            }
            measurements.insert(name, set);
        }

        Ok(measurements)
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&FIELD_INDEX_MAGIC);
        buf.extend_from_slice(&FIELD_INDEX_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.measurements.len() as u32).to_le_bytes());

        for (name, set) in &self.measurements {
            buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&(set.len() as u32).to_le_bytes());
            for (field, ty) in set.iter() {
                buf.extend_from_slice(&(field.len() as u16).to_le_bytes());
                buf.extend_from_slice(field.as_bytes());
                buf.push(ty.as_byte());
            }
        }

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Returns the path this index persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the field set of `measurement`, if present.
    pub fn fields_by(&self, measurement: &str) -> Option<&FieldSet> {
        self.measurements.get(measurement)
    }

    /// Returns the field set of `measurement`, creating it if absent.
    pub fn create_fields_if_not_exists(&mut self, measurement: &str) -> &mut FieldSet {
        self.measurements.entry(measurement.to_string()).or_default()
    }

    /// Removes a measurement and all its fields.
    pub fn delete(&mut self, measurement: &str) {
        self.measurements.remove(measurement);
    }

    /// Iterates measurements in sorted name order.
    pub fn measurements(&self) -> impl Iterator<Item = (&str, &FieldSet)> {
        self.measurements
            .iter()
            .map(|(name, set)| (name.as_str(), set))
    }

    /// Persists the index atomically: write a temp file, sync, rename.
    pub fn save(&self) -> CodecResult<()> {
        let tmp_path = self.path.with_extension("idx.tmp");

        let data = self.encode();
        let mut file = File::create(&tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let index = FieldIndex::open(&dir.path().join(FIELD_INDEX_FILE_NAME)).unwrap();
        assert_eq!(index.measurements().count(), 0);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(FIELD_INDEX_FILE_NAME);

        let mut index = FieldIndex::open(&path).unwrap();
        let fields = index.create_fields_if_not_exists("cpu");
        fields.set("idle", FieldType::Float);
        fields.set("count", FieldType::Integer);
        index
            .create_fields_if_not_exists("mem")
            .set("used", FieldType::Unsigned);
        index.save().unwrap();

        let reloaded = FieldIndex::open(&path).unwrap();
        let cpu = reloaded.fields_by("cpu").unwrap();
        assert_eq!(cpu.field("idle"), Some(FieldType::Float));
        assert_eq!(cpu.field("count"), Some(FieldType::Integer));
        assert_eq!(
            reloaded.fields_by("mem").unwrap().field("used"),
            Some(FieldType::Unsigned)
        );
    }

    #[test]
    fn delete_measurement() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(FIELD_INDEX_FILE_NAME);

        let mut index = FieldIndex::open(&path).unwrap();
        index
            .create_fields_if_not_exists("cpu")
            .set("idle", FieldType::Float);
        index.delete("cpu");
        assert!(index.fields_by("cpu").is_none());
    }

    #[test]
    fn corrupted_index_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(FIELD_INDEX_FILE_NAME);

        let mut index = FieldIndex::open(&path).unwrap();
        index
            .create_fields_if_not_exists("cpu")
            .set("idle", FieldType::Float);
        index.save().unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(FieldIndex::open(&path).is_err());
    }

    #[test]
    fn save_replaces_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(FIELD_INDEX_FILE_NAME);

        let mut index = FieldIndex::open(&path).unwrap();
        index
            .create_fields_if_not_exists("cpu")
            .set("idle", FieldType::Float);
        index.save().unwrap();
        index.delete("cpu");
        index
            .create_fields_if_not_exists("disk")
            .set("usage", FieldType::Float);
        index.save().unwrap();

        let reloaded = FieldIndex::open(&path).unwrap();
        assert!(reloaded.fields_by("cpu").is_none());
        assert!(reloaded.fields_by("disk").is_some());
        assert!(!path.with_extension("idx.tmp").exists());
    }
}

//! Timestamped values and their field types.
//!
//! Every point stored in a segment or WAL entry is a `(unix_nanos, payload)`
//! pair. All values within a single key's batch share the same payload
//! variant; that shared variant is the batch's [`FieldType`], which is also
//! what the per-shard field index declares for each field.

use std::fmt;
use std::str::FromStr;

use crate::error::{CodecError, CodecResult};

/// A single timestamped value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 64-bit float.
    Float(i64, f64),
    /// Signed 64-bit integer.
    Integer(i64, i64),
    /// Unsigned 64-bit integer.
    Unsigned(i64, u64),
    /// Boolean.
    Boolean(i64, bool),
    /// UTF-8 string.
    String(i64, String),
}

impl Value {
    /// Returns the timestamp in nanoseconds since the Unix epoch.
    pub fn unix_nanos(&self) -> i64 {
        match self {
            Value::Float(ts, _)
            | Value::Integer(ts, _)
            | Value::Unsigned(ts, _)
            | Value::Boolean(ts, _)
            | Value::String(ts, _) => *ts,
        }
    }

    /// Returns the field type of this value's payload.
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Float(..) => FieldType::Float,
            Value::Integer(..) => FieldType::Integer,
            Value::Unsigned(..) => FieldType::Unsigned,
            Value::Boolean(..) => FieldType::Boolean,
            Value::String(..) => FieldType::String,
        }
    }
}

/// Declared type of a field.
///
/// Unsigned integers share the `integer` declaration in queries but are kept
/// distinct on disk, mirroring the storage engine's value encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldType {
    /// 64-bit float.
    Float,
    /// Signed 64-bit integer.
    Integer,
    /// Unsigned 64-bit integer.
    Unsigned,
    /// Boolean.
    Boolean,
    /// UTF-8 string.
    String,
}

impl FieldType {
    /// All field types, in on-disk tag order.
    pub const ALL: [FieldType; 5] = [
        FieldType::Float,
        FieldType::Integer,
        FieldType::Unsigned,
        FieldType::Boolean,
        FieldType::String,
    ];

    /// Returns the canonical textual name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Float => "float",
            FieldType::Integer => "integer",
            FieldType::Unsigned => "unsigned",
            FieldType::Boolean => "boolean",
            FieldType::String => "string",
        }
    }

    /// Returns the on-disk type tag.
    pub fn as_byte(&self) -> u8 {
        match self {
            FieldType::Float => 0,
            FieldType::Integer => 1,
            FieldType::Unsigned => 2,
            FieldType::Boolean => 3,
            FieldType::String => 4,
        }
    }

    /// Decodes an on-disk type tag.
    pub fn from_byte(byte: u8) -> CodecResult<Self> {
        match byte {
            0 => Ok(FieldType::Float),
            1 => Ok(FieldType::Integer),
            2 => Ok(FieldType::Unsigned),
            3 => Ok(FieldType::Boolean),
            4 => Ok(FieldType::String),
            other => Err(CodecError::value_decode(format!(
                "unknown field type tag {other}"
            ))),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float" => Ok(FieldType::Float),
            "integer" => Ok(FieldType::Integer),
            "unsigned" => Ok(FieldType::Unsigned),
            "boolean" => Ok(FieldType::Boolean),
            "string" => Ok(FieldType::String),
            _ => Err(()),
        }
    }
}

/// Returns the field type shared by every value in the batch.
///
/// # Errors
///
/// Returns an error if the batch is empty or mixes payload variants.
pub fn values_type(values: &[Value]) -> CodecResult<FieldType> {
    let first = values
        .first()
        .ok_or_else(|| CodecError::value_decode("empty value batch"))?
        .field_type();

    for value in &values[1..] {
        let ty = value.field_type();
        if ty != first {
            return Err(CodecError::MixedTypes {
                first: first.as_str(),
                second: ty.as_str(),
            });
        }
    }

    Ok(first)
}

/// Appends the binary encoding of a value batch to `buf`.
///
/// Layout: type tag (1), count (4), then per value the timestamp (8)
/// followed by the payload. Strings are u32-length-prefixed UTF-8.
///
/// # Errors
///
/// Returns an error if the batch is empty or mixes payload variants.
pub fn encode_values(buf: &mut Vec<u8>, values: &[Value]) -> CodecResult<()> {
    let ty = values_type(values)?;
    buf.push(ty.as_byte());
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());

    for value in values {
        buf.extend_from_slice(&value.unix_nanos().to_le_bytes());
        match value {
            Value::Float(_, v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Integer(_, v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Unsigned(_, v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Boolean(_, v) => buf.push(u8::from(*v)),
            Value::String(_, v) => {
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                buf.extend_from_slice(v.as_bytes());
            }
        }
    }

    Ok(())
}

/// Decodes a value batch from `data`, returning the values and the number of
/// bytes consumed.
pub fn decode_values(data: &[u8]) -> CodecResult<(Vec<Value>, usize)> {
    let mut cursor = Cursor::new(data);

    let ty = FieldType::from_byte(cursor.u8()?)?;
    let count = cursor.u32()? as usize;

    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let ts = cursor.i64()?;
        let value = match ty {
            FieldType::Float => Value::Float(ts, f64::from_le_bytes(cursor.array()?)),
            FieldType::Integer => Value::Integer(ts, i64::from_le_bytes(cursor.array()?)),
            FieldType::Unsigned => Value::Unsigned(ts, u64::from_le_bytes(cursor.array()?)),
            FieldType::Boolean => Value::Boolean(ts, cursor.u8()? != 0),
            FieldType::String => {
                let len = cursor.u32()? as usize;
                let bytes = cursor.bytes(len)?;
                let text = String::from_utf8(bytes.to_vec()).map_err(|_| {
                    CodecError::value_decode("string value is not valid UTF-8")
                })?;
                Value::String(ts, text)
            }
        };
        values.push(value);
    }

    Ok((values, cursor.position))
}

/// Bounds-checked little-endian reader over a byte slice.
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pub(crate) position: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub(crate) fn bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self
            .position
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| CodecError::value_decode("truncated value block"))?;
        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        Ok(self.bytes(N)?.try_into().expect("length checked"))
    }

    pub(crate) fn u8(&mut self) -> CodecResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> CodecResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> CodecResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> CodecResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn i64(&mut self) -> CodecResult<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }
}

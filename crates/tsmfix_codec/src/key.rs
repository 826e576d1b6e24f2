//! Composite key helpers.
//!
//! A composite key encodes `measurement,tag1=v1,tag2=v2` followed by a
//! separator and the field name:
//!
//! ```text
//! cpu,host=server-1,region=eu#!~#idle
//! └────────── series key ─────┘    └ field
//! ```
//!
//! Tags appear in bytewise-sorted key order and keys compare bytewise, which
//! is also the order segments store them in. `make_key` is the exact inverse
//! of `parse_key`: byte-identical input produces byte-identical output.

/// Separator between the series key and the field name.
pub const KEY_FIELD_SEPARATOR: &[u8] = b"#!~#";

/// A single tag key/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Tag key.
    pub key: Vec<u8>,
    /// Tag value.
    pub value: Vec<u8>,
}

impl Tag {
    /// Creates a tag from key and value bytes.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Splits a composite key into its series key and field name.
///
/// A key without a separator is treated as a bare series key with an empty
/// field.
pub fn series_and_field(composite: &[u8]) -> (&[u8], &[u8]) {
    match find_separator(composite) {
        Some(at) => (
            &composite[..at],
            &composite[at + KEY_FIELD_SEPARATOR.len()..],
        ),
        None => (composite, &[]),
    }
}

/// Joins a series key and a field name into a composite key.
pub fn composite_key(series_key: &[u8], field: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(series_key.len() + KEY_FIELD_SEPARATOR.len() + field.len());
    key.extend_from_slice(series_key);
    key.extend_from_slice(KEY_FIELD_SEPARATOR);
    key.extend_from_slice(field);
    key
}

/// Parses a series key into its measurement and ordered tag list.
///
/// Tag entries without an `=` are ignored, matching the storage engine's
/// lenient parser. Escaping of `,` and `=` inside names is not supported.
pub fn parse_key(series_key: &[u8]) -> (String, Vec<Tag>) {
    let mut parts = series_key.split(|&b| b == b',');

    let measurement = parts
        .next()
        .map(|m| String::from_utf8_lossy(m).into_owned())
        .unwrap_or_default();

    let mut tags = Vec::new();
    for part in parts {
        if part.is_empty() {
            continue;
        }
        if let Some(eq) = part.iter().position(|&b| b == b'=') {
            tags.push(Tag::new(&part[..eq], &part[eq + 1..]));
        }
    }

    (measurement, tags)
}

/// Builds a series key from a measurement and an ordered tag list.
pub fn make_key(measurement: &[u8], tags: &[Tag]) -> Vec<u8> {
    let mut key = Vec::with_capacity(
        measurement.len() + tags.iter().map(|t| t.key.len() + t.value.len() + 2).sum::<usize>(),
    );
    key.extend_from_slice(measurement);
    for tag in tags {
        key.push(b',');
        key.extend_from_slice(&tag.key);
        key.push(b'=');
        key.extend_from_slice(&tag.value);
    }
    key
}

/// Extracts the measurement from a composite key.
pub fn measurement_from_composite(composite: &[u8]) -> String {
    let (series_key, _) = series_and_field(composite);
    let (measurement, _) = parse_key(series_key);
    measurement
}

fn find_separator(key: &[u8]) -> Option<usize> {
    key.windows(KEY_FIELD_SEPARATOR.len())
        .position(|w| w == KEY_FIELD_SEPARATOR)
}

//! Line Codec
//!
//! Converts between one line of the backing file and a [`Record`].
//!
//! ## Format
//!
//! ```text
//! name, score, expires_at
//! alice, 100, 1760000000000
//! bob, 200, 1760000050000
//! ```
//!
//! Fields are joined with `", "`. There is no escaping: a field value must
//! never contain the separator itself. Line terminators (`\n` or `\r\n`) are
//! not part of a line as far as the codec is concerned; blank lines and the
//! optional header line are handled by the store.

use crate::codec::record::Record;
use thiserror::Error;

/// The sequence that separates fields on a line.
pub const FIELD_SEPARATOR: &str = ", ";

/// Errors produced while decoding or validating a record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The line had no content
    #[error("empty record")]
    Empty,

    /// The line has a different number of fields than the rest of the file
    #[error("arity mismatch: expected {expected} fields, found {found}")]
    ArityMismatch { expected: usize, found: usize },

    /// The record is too short to contain its key field
    #[error("missing key field: key index {key_index} but record has {arity} fields")]
    MissingKeyField { key_index: usize, arity: usize },

    /// The record is too short to contain its lifetime field
    #[error("missing lifetime field: lifetime index {lifetime_index} but record has {arity} fields")]
    MissingLifetimeField { lifetime_index: usize, arity: usize },

    /// The lifetime field is not a millisecond timestamp
    #[error("invalid lifetime {0:?}: expected milliseconds since the epoch")]
    InvalidLifetime(String),

    /// A field contains the separator and would not survive a round trip
    #[error("field {0:?} contains the field separator")]
    SeparatorInField(String),
}

/// Decodes one line into a record.
///
/// A trailing `\r` is ignored so CRLF files decode the same as LF files.
/// When `expected_arity` is known, a line with any other number of fields is
/// rejected.
///
/// # Example
///
/// ```
/// use flatkv::codec::{decode, Record};
///
/// let record = decode("bob, 200\r", Some(2)).unwrap();
/// assert_eq!(record, Record::from(["bob", "200"]));
/// assert!(decode("bob, 200, extra", Some(2)).is_err());
/// ```
pub fn decode(line: &str, expected_arity: Option<usize>) -> Result<Record, CodecError> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.is_empty() {
        return Err(CodecError::Empty);
    }

    let record: Record = line.split(FIELD_SEPARATOR).map(str::to_string).collect();

    match expected_arity {
        Some(expected) if expected != record.len() => Err(CodecError::ArityMismatch {
            expected,
            found: record.len(),
        }),
        _ => Ok(record),
    }
}

/// Encodes a record into a line, without a terminator.
///
/// Callers must not pass fields containing [`FIELD_SEPARATOR`]; the store
/// checks this before writing.
pub fn encode(record: &Record) -> String {
    record.fields().join(FIELD_SEPARATOR)
}

/// Which fields of a record play a role in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    /// Index of the unique key field
    pub key_index: usize,

    /// Index of the absolute expiry timestamp (ms since epoch), TTL mode only
    pub lifetime_index: Option<usize>,
}

impl Default for RecordLayout {
    fn default() -> Self {
        Self {
            key_index: 0,
            lifetime_index: None,
        }
    }
}

impl RecordLayout {
    /// Layout keyed on `key_index` with no lifetime field.
    pub fn keyed(key_index: usize) -> Self {
        Self {
            key_index,
            lifetime_index: None,
        }
    }

    /// Sets the lifetime field index.
    pub fn with_lifetime(mut self, lifetime_index: usize) -> Self {
        self.lifetime_index = Some(lifetime_index);
        self
    }

    /// Returns the key of a record, trimmed of surrounding whitespace.
    pub fn key_of<'a>(&self, record: &'a Record) -> Result<&'a str, CodecError> {
        record
            .get(self.key_index)
            .map(str::trim)
            .ok_or(CodecError::MissingKeyField {
                key_index: self.key_index,
                arity: record.len(),
            })
    }

    /// Returns `true` if the record's key field equals `key`.
    ///
    /// Records too short to hold a key never match.
    pub fn matches(&self, record: &Record, key: &str) -> bool {
        self.key_of(record)
            .map(|own| own == key.trim())
            .unwrap_or(false)
    }

    /// Returns the record's expiry timestamp in milliseconds since the epoch.
    ///
    /// `Ok(None)` when the layout has no lifetime field.
    pub fn expiry_millis(&self, record: &Record) -> Result<Option<u64>, CodecError> {
        let Some(lifetime_index) = self.lifetime_index else {
            return Ok(None);
        };

        let raw = record
            .get(lifetime_index)
            .ok_or(CodecError::MissingLifetimeField {
                lifetime_index,
                arity: record.len(),
            })?;

        raw.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| CodecError::InvalidLifetime(raw.to_string()))
    }

    /// Checks that a record can be written under this layout.
    ///
    /// A record whose encoded line is blank is rejected as [`CodecError::Empty`]:
    /// the store skips blank lines, so it could never be read back.
    pub fn validate(&self, record: &Record) -> Result<(), CodecError> {
        if record.is_empty() || encode(record).trim().is_empty() {
            return Err(CodecError::Empty);
        }
        if let Some(field) = record.field_with_separator() {
            return Err(CodecError::SeparatorInField(field.to_string()));
        }
        self.key_of(record)?;
        if let Some(lifetime_index) = self.lifetime_index {
            if lifetime_index >= record.len() {
                return Err(CodecError::MissingLifetimeField {
                    lifetime_index,
                    arity: record.len(),
                });
            }
        }
        Ok(())
    }
}

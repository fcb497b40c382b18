//! Record Type
//!
//! A record is one decoded line of the backing file: an ordered,
//! fixed-arity list of string fields. Records carry no schema of their own;
//! which field is the key (and which holds an expiry timestamp) is decided by
//! a [`RecordLayout`](crate::codec::RecordLayout).

use crate::codec::line::{encode, FIELD_SEPARATOR};
use std::fmt;

/// An ordered sequence of string fields.
///
/// # Example
///
/// ```
/// use flatkv::codec::Record;
///
/// let record = Record::from(["alice", "100"]);
/// assert_eq!(record.len(), 2);
/// assert_eq!(record.get(0), Some("alice"));
/// assert_eq!(record.to_string(), "alice, 100");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Record {
    fields: Vec<String>,
}

impl Record {
    /// Creates a record from its fields, in file order.
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    /// Number of fields.
    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if the record has no fields.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the field at `index`, if present.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// All fields in order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Consumes the record, returning its fields.
    pub fn into_fields(self) -> Vec<String> {
        self.fields
    }

    /// Returns the first field that contains the separator sequence.
    ///
    /// Such a record cannot be written without changing its arity when read back.
    pub(crate) fn field_with_separator(&self) -> Option<&str> {
        self.fields
            .iter()
            .map(String::as_str)
            .find(|field| field.contains(FIELD_SEPARATOR))
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self))
    }
}

impl From<Vec<String>> for Record {
    fn from(fields: Vec<String>) -> Self {
        Self::new(fields)
    }
}

impl<const N: usize> From<[&str; N]> for Record {
    fn from(fields: [&str; N]) -> Self {
        Self::new(fields.iter().map(|field| field.to_string()).collect())
    }
}

impl From<&[&str]> for Record {
    fn from(fields: &[&str]) -> Self {
        Self::new(fields.iter().map(|field| field.to_string()).collect())
    }
}

impl FromIterator<String> for Record {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

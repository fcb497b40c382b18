//! Record Codec Module
//!
//! This module defines how one line of the backing file maps to a
//! [`Record`] and back.
//!
//! ## Modules
//!
//! - `record`: The `Record` type (an ordered field list)
//! - `line`: Line decoding/encoding and the `RecordLayout` that names the
//!   key and lifetime fields
//!
//! ## Example
//!
//! ```
//! use flatkv::codec::{decode, encode, Record, RecordLayout};
//!
//! let layout = RecordLayout::keyed(0);
//! let record = decode("alice, 100", None).unwrap();
//!
//! assert_eq!(layout.key_of(&record).unwrap(), "alice");
//! assert_eq!(encode(&record), "alice, 100");
//! ```

pub mod line;
pub mod record;

// Re-export commonly used types for convenience
pub use line::{decode, encode, CodecError, RecordLayout, FIELD_SEPARATOR};
pub use record::Record;

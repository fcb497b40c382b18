//! Storage Module
//!
//! This module provides the flat-file record store and the TTL expiry layer
//! built on top of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ExpiryManager                           │
//! │   one timer per key ──> read_and_delete ──> on_expiry       │
//! └────────────────────────────┬────────────────────────────────┘
//!                              │ RecordBackend
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │           Arbiter (or LockedBackend)                        │
//! └────────────────────────────┬────────────────────────────────┘
//!                              │ one call at a time
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   RecordStore  ──>  scores.txt  (rewrite via scores.txt.tmp)│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Single source of truth**: No in-memory cache; every call reads the file
//! - **Atomic rewrites**: Deletions commit by renaming a synced temp file
//! - **Header support**: An optional label line that is never matched as a key
//! - **TTL**: Absolute expiry timestamps, re-armed from the file on restart

pub mod expiry;
pub mod store;

// Re-export commonly used types
pub use expiry::{now_millis, ExpiryChannel, ExpiryConfig, ExpiryHandler, ExpiryManager};
pub use store::{RecordStore, StoreConfig, StoreError, StoreResult};

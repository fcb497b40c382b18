//! # FlatKV - A Keyed Record Store over a Flat Text File
//!
//! FlatKV keeps small keyed tables (IDs, sessions, applications) in plain
//! text files, one record per line, and serializes every access through a
//! single priority-scheduled worker per file.
//!
//! ## Features
//!
//! - **Plain text**: `alice, 100` lines with an optional header; readable and
//!   editable by hand
//! - **Crash-safe rewrites**: Deletions write a temp file and rename it over
//!   the original
//! - **Priority scheduling**: One worker per store, destructive operations
//!   favored among contemporaneous requests, starved requests promoted
//! - **TTL Support**: Records can carry an absolute expiry time; an expiry
//!   callback fires when they age out, and timers survive restarts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              FlatKV                                     │
//! │                                                                         │
//! │  ┌─────────────────────┐          ┌──────────────────────────────────┐  │
//! │  │   ExpiryManager     │─────────>│          RecordBackend           │  │
//! │  │ (timers per key)    │          │  ┌────────────┐  ┌────────────┐  │  │
//! │  └─────────────────────┘          │  │  Arbiter   │  │  Locked    │  │  │
//! │                                   │  │ (1 worker) │  │ (RwLock)   │  │  │
//! │  ┌─────────────────────┐          │  └─────┬──────┘  └─────┬──────┘  │  │
//! │  │   Callers           │─────────>│        └───────┬───────┘         │  │
//! │  │ (any thread/task)   │          └────────────────┼─────────────────┘  │
//! │  └─────────────────────┘                           ▼                    │
//! │                                   ┌──────────────────────────────────┐  │
//! │                                   │  RecordStore  +  Record Codec    │  │
//! │                                   │        (one flat file)           │  │
//! │                                   └──────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flatkv::arbiter::{Arbiter, ArbiterConfig};
//! use flatkv::codec::Record;
//! use flatkv::storage::{now_millis, ExpiryConfig, ExpiryManager, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = StoreConfig::new("data/sessions.txt").with_header(["user", "expires_at"]);
//!     let arbiter = Arbiter::open(store, ArbiterConfig::default())?;
//!
//!     let manager = ExpiryManager::start(arbiter.handle(), ExpiryConfig::new(0, 1), |record: Record| {
//!         println!("session expired: {record}");
//!     })
//!     .await?;
//!
//!     let expires = (now_millis() + 15 * 60 * 1000).to_string();
//!     manager.append_with_expiry(Record::from(["user-1", expires.as_str()])).await?;
//!
//!     let session = arbiter.read("user-1").await?;
//!     println!("{session:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`codec`]: Record type and line encoding
//! - [`storage`]: The flat-file store and the TTL expiry manager
//! - [`arbiter`]: The single-worker priority scheduler
//! - [`backend`]: The backend trait and the lock-based alternative
//!
//! ## Caveats
//!
//! - Field values must not contain `", "`; there is no escaping.
//! - Keys are not forced unique unless
//!   [`StoreConfig::reject_duplicate_keys`](storage::StoreConfig::reject_duplicate_keys)
//!   is set. Reads return the first match; deletes remove every match.
//! - The whole file is rewritten on every delete, so stores should stay small.

pub mod arbiter;
pub mod backend;
pub mod codec;
pub mod storage;

// Re-export commonly used types for convenience
pub use arbiter::{Arbiter, ArbiterConfig, ArbiterHandle, OperationKind, Pending};
pub use backend::{LockedBackend, RecordBackend};
pub use codec::{CodecError, Record, RecordLayout};
pub use storage::{
    ExpiryChannel, ExpiryConfig, ExpiryHandler, ExpiryManager, RecordStore, StoreConfig,
    StoreError, StoreResult,
};

/// Version of FlatKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

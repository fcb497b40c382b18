//! Store Backends
//!
//! A [`RecordBackend`] is anything that can run store operations and hand
//! back [`Pending`] results. Two are provided:
//!
//! - [`ArbiterHandle`]: single worker, priority ordered, starvation-free.
//!   The default.
//! - [`LockedBackend`]: a read/write lock over the store with operations run
//!   on the Tokio blocking pool. Reads proceed in parallel; there is no
//!   priority or starvation guarantee beyond what the lock provides.
//!
//! The [`ExpiryManager`](crate::storage::ExpiryManager) works with either.

pub mod locked;

pub use locked::LockedBackend;

use crate::arbiter::{ArbiterHandle, Pending};
use crate::codec::Record;

/// Asynchronous access to one record store.
pub trait RecordBackend: Send + Sync + 'static {
    fn append(&self, record: Record) -> Pending<()>;

    /// Resolves to the number of records removed.
    fn delete(&self, key: &str) -> Pending<usize>;

    fn read(&self, key: &str) -> Pending<Option<Record>>;

    /// Resolves to `true` if the key is present.
    fn scan(&self, key: &str) -> Pending<bool>;

    fn read_and_delete(&self, key: &str) -> Pending<Option<Record>>;

    fn dump(&self, include_header: bool) -> Pending<Vec<Record>>;
}

impl RecordBackend for ArbiterHandle {
    fn append(&self, record: Record) -> Pending<()> {
        ArbiterHandle::append(self, record)
    }

    fn delete(&self, key: &str) -> Pending<usize> {
        ArbiterHandle::delete(self, key)
    }

    fn read(&self, key: &str) -> Pending<Option<Record>> {
        ArbiterHandle::read(self, key)
    }

    fn scan(&self, key: &str) -> Pending<bool> {
        ArbiterHandle::scan(self, key)
    }

    fn read_and_delete(&self, key: &str) -> Pending<Option<Record>> {
        ArbiterHandle::read_and_delete(self, key)
    }

    fn dump(&self, include_header: bool) -> Pending<Vec<Record>> {
        ArbiterHandle::dump(self, include_header)
    }
}

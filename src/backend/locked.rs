//! Read/Write-Lock Backend
//!
//! Shares one [`RecordStore`] behind an `RwLock` and runs each operation on
//! the Tokio blocking pool. Many reads may run at once; a mutation waits for
//! exclusive access. Suited to read-heavy stores that don't need the
//! arbiter's ordering guarantees.

use crate::arbiter::Pending;
use crate::backend::RecordBackend;
use crate::codec::Record;
use crate::storage::{RecordStore, StoreConfig, StoreResult};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::runtime::Handle;
use tracing::debug;

/// A [`RecordBackend`] guarded by a read/write lock.
#[derive(Debug, Clone)]
pub struct LockedBackend {
    store: Arc<RwLock<RecordStore>>,
    runtime: Handle,
}

impl LockedBackend {
    /// Serves `store` using the blocking pool of `runtime`.
    pub fn new(store: RecordStore, runtime: Handle) -> Self {
        debug!(path = %store.path().display(), "Lock-based backend created");
        Self {
            store: Arc::new(RwLock::new(store)),
            runtime,
        }
    }

    /// Opens the store described by `config`.
    pub fn open(config: StoreConfig, runtime: Handle) -> StoreResult<Self> {
        Ok(Self::new(RecordStore::open(config)?, runtime))
    }

    fn shared<T, F>(&self, operation: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&RecordStore) -> StoreResult<T> + Send + 'static,
    {
        let (reply, pending) = Pending::channel();
        let store = Arc::clone(&self.store);
        self.runtime.spawn_blocking(move || {
            let guard = store.read().unwrap_or_else(PoisonError::into_inner);
            let _ = reply.send(operation(&guard));
        });
        pending
    }

    fn exclusive<T, F>(&self, operation: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RecordStore) -> StoreResult<T> + Send + 'static,
    {
        let (reply, pending) = Pending::channel();
        let store = Arc::clone(&self.store);
        self.runtime.spawn_blocking(move || {
            let mut guard = store.write().unwrap_or_else(PoisonError::into_inner);
            let _ = reply.send(operation(&mut guard));
        });
        pending
    }
}

impl RecordBackend for LockedBackend {
    fn append(&self, record: Record) -> Pending<()> {
        self.exclusive(move |store| store.append(record))
    }

    fn delete(&self, key: &str) -> Pending<usize> {
        let key = key.to_string();
        self.exclusive(move |store| store.delete(&key))
    }

    fn read(&self, key: &str) -> Pending<Option<Record>> {
        let key = key.to_string();
        self.shared(move |store| store.read(&key))
    }

    fn scan(&self, key: &str) -> Pending<bool> {
        let key = key.to_string();
        self.shared(move |store| store.contains(&key))
    }

    fn read_and_delete(&self, key: &str) -> Pending<Option<Record>> {
        let key = key.to_string();
        self.exclusive(move |store| store.read_and_delete(&key))
    }

    fn dump(&self, include_header: bool) -> Pending<Vec<Record>> {
        self.shared(move |store| store.dump(include_header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_operations() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("scores.txt")).with_header(["name", "score"]);
        let backend = LockedBackend::open(config, Handle::current()).unwrap();

        backend.append(Record::from(["alice", "100"])).await.unwrap();
        backend.append(Record::from(["bob", "200"])).await.unwrap();

        assert_eq!(
            backend.read("bob").await.unwrap(),
            Some(Record::from(["bob", "200"]))
        );
        assert_eq!(backend.delete("alice").await.unwrap(), 1);
        assert!(!backend.scan("alice").await.unwrap());
        assert_eq!(
            backend.dump(false).await.unwrap(),
            vec![Record::from(["bob", "200"])]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_read_and_delete_yields_once() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("sessions.txt"));
        let backend = LockedBackend::open(config, Handle::current()).unwrap();
        backend.append(Record::from(["session", "1"])).await.unwrap();

        let takers: Vec<_> = (0..16).map(|_| backend.read_and_delete("session")).collect();

        let mut found = 0;
        for taker in takers {
            if taker.await.unwrap().is_some() {
                found += 1;
            }
        }
        assert_eq!(found, 1);
    }
}

//! TTL Expiry Manager
//!
//! Gives records an absolute lifetime. Each record carries its expiry time
//! (milliseconds since the Unix epoch) in a dedicated field; the manager
//! keeps one timer per live key and, when a timer fires, atomically removes
//! the record through the backend and hands it to an [`ExpiryHandler`].
//!
//! ## Design
//!
//! ```text
//! append_with_expiry(record) ──> backend.append ──> spawn timer(key)
//!                                                      │ sleep until expiry
//!                                                      ▼
//!                                      backend.read_and_delete(key)
//!                                          │ Some(record)   │ None
//!                                          ▼                ▼
//!                                   handler.on_expiry    (already deleted)
//!
//! delete_key(key) ──> abort timer(key) ──> backend.delete(key)
//! ```
//!
//! A timer leaves the timer map as soon as its sleep ends, before it submits
//! `read_and_delete`. Cancelling or replacing a key therefore only ever
//! aborts a timer that is still sleeping; a timer that has fired always runs
//! to the handler. `delete_key` aborts the timer before submitting the
//! delete, and the backend serializes store calls, so a fired expiry either
//! removes the record first (and the delete finds nothing) or finds nothing
//! itself (and the handler is skipped).
//!
//! On restart, [`ExpiryManager::start`] re-creates timers for every record in
//! the store from its stored timestamp; records that expired while the
//! process was down fire immediately.

use crate::backend::RecordBackend;
use crate::codec::{CodecError, Record, RecordLayout};
use crate::storage::{StoreError, StoreResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Receives records removed by expiry.
///
/// Called from a Tokio task; implementations must not block indefinitely.
pub trait ExpiryHandler: Send + Sync + 'static {
    fn on_expiry(&self, record: Record);
}

impl<F> ExpiryHandler for F
where
    F: Fn(Record) + Send + Sync + 'static,
{
    fn on_expiry(&self, record: Record) {
        self(record)
    }
}

/// An [`ExpiryHandler`] that forwards expired records into a bounded channel.
///
/// When the channel is full the record is dropped with a warning.
#[derive(Debug, Clone)]
pub struct ExpiryChannel {
    tx: mpsc::Sender<Record>,
}

impl ExpiryChannel {
    /// Creates a channel handler and the receiver it feeds.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Record>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl ExpiryHandler for ExpiryChannel {
    fn on_expiry(&self, record: Record) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(record = %record, "Expiry channel full, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Expiry channel closed");
            }
        }
    }
}

/// Configuration for the expiry manager.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryConfig {
    /// Index of the key field
    pub key_index: usize,

    /// Index of the absolute expiry timestamp field
    pub lifetime_index: usize,
}

impl ExpiryConfig {
    pub fn new(key_index: usize, lifetime_index: usize) -> Self {
        Self {
            key_index,
            lifetime_index,
        }
    }

    fn layout(&self) -> RecordLayout {
        RecordLayout::keyed(self.key_index).with_lifetime(self.lifetime_index)
    }
}

#[derive(Debug)]
struct TimerEntry {
    id: u64,
    expires_at: u64,
    task: AbortHandle,
}

/// State shared by the manager, its pending appends and its timers.
struct Shared<B> {
    backend: B,
    handler: Arc<dyn ExpiryHandler>,
    timers: Mutex<HashMap<String, TimerEntry>>,
    next_id: AtomicU64,
}

impl<B> Shared<B> {
    fn timers(&self) -> MutexGuard<'_, HashMap<String, TimerEntry>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: RecordBackend + Clone> Shared<B> {
    /// Starts (or replaces) the timer for `key`.
    fn schedule(self: &Arc<Self>, key: String, expires_at: u64) {
        let delay = Duration::from_millis(expires_at.saturating_sub(now_millis()));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Held across the spawn so the task can't claim its entry before it exists
        let mut timers = self.timers();

        let task = tokio::spawn(expire_after(
            delay,
            key.clone(),
            id,
            self.backend.clone(),
            Arc::clone(&self.handler),
            Arc::downgrade(self),
        ));

        let entry = TimerEntry {
            id,
            expires_at,
            task: task.abort_handle(),
        };
        if let Some(previous) = timers.insert(key.clone(), entry) {
            previous.task.abort();
            debug!(key = %key, "Replaced existing expiry timer");
        }

        trace!(key = %key, delay_ms = delay.as_millis(), "Expiry timer scheduled");
    }
}

impl<B> Drop for Shared<B> {
    fn drop(&mut self) {
        for (_, entry) in self.timers().drain() {
            entry.task.abort();
        }
    }
}

/// Expires records through a [`RecordBackend`].
///
/// Dropping the manager aborts every timer that is still sleeping. A timer
/// that has already fired finishes removing its record and notifies the
/// handler.
///
/// # Example
///
/// ```ignore
/// use flatkv::arbiter::{Arbiter, ArbiterConfig};
/// use flatkv::storage::{now_millis, ExpiryConfig, ExpiryManager, StoreConfig};
/// use flatkv::codec::Record;
///
/// let arbiter = Arbiter::open(StoreConfig::new("sessions.txt"), ArbiterConfig::default())?;
/// let manager = ExpiryManager::start(arbiter.handle(), ExpiryConfig::new(0, 1), |record: Record| {
///     println!("session {} expired", record);
/// })
/// .await?;
///
/// let expires = (now_millis() + 60_000).to_string();
/// manager.append_with_expiry(Record::from(["user-1", expires.as_str()])).await?;
/// ```
pub struct ExpiryManager<B: RecordBackend + Clone> {
    layout: RecordLayout,
    shared: Arc<Shared<B>>,
}

impl<B: RecordBackend + Clone> std::fmt::Debug for ExpiryManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryManager")
            .field("layout", &self.layout)
            .field("timers", &self.pending_timers())
            .finish()
    }
}

impl<B: RecordBackend + Clone> ExpiryManager<B> {
    /// Creates a manager over `backend`, notifying `handler` on expiry.
    ///
    /// No timers exist until records are appended or [`rehydrate`](Self::rehydrate)
    /// runs; use [`start`](Self::start) when the store may already hold records.
    pub fn new(backend: B, config: ExpiryConfig, handler: impl ExpiryHandler) -> Self {
        Self {
            layout: config.layout(),
            shared: Arc::new(Shared {
                backend,
                handler: Arc::new(handler),
                timers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a manager and re-arms a timer for every record already stored.
    pub async fn start(
        backend: B,
        config: ExpiryConfig,
        handler: impl ExpiryHandler,
    ) -> StoreResult<Self> {
        let manager = Self::new(backend, config, handler);
        manager.rehydrate().await?;
        Ok(manager)
    }

    /// The backend this manager wraps, for operations that don't touch timers.
    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Number of timers still waiting for their expiry time.
    pub fn pending_timers(&self) -> usize {
        self.shared.timers().len()
    }

    /// Expiry timestamp of the waiting timer for `key`, if any.
    pub fn expires_at(&self, key: &str) -> Option<u64> {
        self.shared.timers().get(key).map(|entry| entry.expires_at)
    }

    /// Appends a record and schedules its expiry.
    ///
    /// The lifetime field is validated before anything is written. Once the
    /// append is submitted, dropping the returned future does not prevent
    /// the timer from being scheduled.
    pub async fn append_with_expiry(&self, record: Record) -> StoreResult<()> {
        let key = self.layout.key_of(&record)?.to_string();
        let expires_at = self.lifetime_of(&record)?;

        let appended = self.shared.backend.append(record);
        let shared = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            appended.await?;
            match shared.upgrade() {
                Some(shared) => shared.schedule(key, expires_at),
                None => debug!(key = %key, "Manager dropped before expiry was scheduled"),
            }
            Ok::<(), StoreError>(())
        });

        task.await.map_err(|_| StoreError::WorkerLost)?
    }

    /// Cancels the timer for `key` and deletes it.
    ///
    /// Resolves to the number of records removed.
    pub async fn delete_key(&self, key: &str) -> StoreResult<usize> {
        self.cancel(key);
        self.shared.backend.delete(key).await
    }

    /// Aborts the timer for `key` without touching the store.
    ///
    /// Returns `true` if a timer was still waiting. A timer that has already
    /// fired can't be cancelled.
    pub fn cancel(&self, key: &str) -> bool {
        match self.shared.timers().remove(key) {
            Some(entry) => {
                entry.task.abort();
                trace!(key = %key, "Expiry timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Schedules a timer for every record currently in the store.
    ///
    /// Records whose lifetime field can't be read are skipped with a warning.
    /// Returns the number of timers scheduled.
    pub async fn rehydrate(&self) -> StoreResult<usize> {
        let records = self.shared.backend.dump(false).await?;
        let now = now_millis();
        let mut scheduled = 0;
        let mut overdue = 0;

        for record in records {
            let key = match self.layout.key_of(&record) {
                Ok(key) => key.to_string(),
                Err(err) => {
                    warn!(record = %record, error = %err, "Skipping record without key");
                    continue;
                }
            };
            let expires_at = match self.lifetime_of(&record) {
                Ok(expires_at) => expires_at,
                Err(err) => {
                    warn!(key = %key, error = %err, "Skipping record with unreadable lifetime");
                    continue;
                }
            };

            if expires_at <= now {
                overdue += 1;
            }
            self.shared.schedule(key, expires_at);
            scheduled += 1;
        }

        info!(scheduled, overdue, "Expiry timers rehydrated");
        Ok(scheduled)
    }

    fn lifetime_of(&self, record: &Record) -> StoreResult<u64> {
        let expires_at = self.layout.expiry_millis(record)?;
        // The layout always has a lifetime index, so `None` can't happen
        expires_at.ok_or_else(|| CodecError::InvalidLifetime(String::new()).into())
    }
}

/// Timer body: wait, claim the entry, take the record out of the store, notify.
async fn expire_after<B: RecordBackend>(
    delay: Duration,
    key: String,
    id: u64,
    backend: B,
    handler: Arc<dyn ExpiryHandler>,
    shared: Weak<Shared<B>>,
) {
    tokio::time::sleep(delay).await;

    // Claim the entry; once removed the timer can no longer be replaced or cancelled
    {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut timers = shared.timers();
        if !timers.get(&key).is_some_and(|entry| entry.id == id) {
            trace!(key = %key, "Expiry timer superseded");
            return;
        }
        timers.remove(&key);
    }

    match backend.read_and_delete(&key).await {
        Ok(Some(record)) => {
            debug!(key = %key, "Record expired");
            handler.on_expiry(record);
        }
        Ok(None) => {
            debug!(key = %key, "Expired record already removed");
        }
        Err(err) => {
            warn!(key = %key, error = %err, "Failed to remove expired record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{Arbiter, ArbiterConfig, OperationKind};
    use crate::backend::LockedBackend;
    use crate::storage::{StoreConfig, StoreError};
    use std::fs;
    use tempfile::{tempdir, TempDir};
    use tokio::time::{sleep, timeout};
    use tokio_test::{assert_pending, task};

    fn sessions() -> (TempDir, Arbiter) {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("sessions.txt"))
            .with_header(["user", "expires_at"]);
        let arbiter = Arbiter::open(config, ArbiterConfig::default()).unwrap();
        (dir, arbiter)
    }

    fn session(user: &str, expires_at: u64) -> Record {
        Record::new(vec![user.to_string(), expires_at.to_string()])
    }

    #[tokio::test]
    async fn test_expiry_fires_and_removes_record() {
        let (_dir, arbiter) = sessions();
        let (handler, mut expired) = ExpiryChannel::bounded(8);
        let manager = ExpiryManager::new(arbiter.handle(), ExpiryConfig::new(0, 1), handler);

        let record = session("A", now_millis() + 50);
        manager.append_with_expiry(record.clone()).await.unwrap();
        assert_eq!(manager.pending_timers(), 1);
        assert!(arbiter.scan("A").await.unwrap());

        let fired = timeout(Duration::from_secs(2), expired.recv()).await.unwrap();
        assert_eq!(fired, Some(record));
        assert!(!arbiter.scan("A").await.unwrap());
        assert_eq!(manager.pending_timers(), 0);
    }

    #[tokio::test]
    async fn test_delete_key_prevents_expiry() {
        let (_dir, arbiter) = sessions();
        let (handler, mut expired) = ExpiryChannel::bounded(8);
        let manager = ExpiryManager::new(arbiter.handle(), ExpiryConfig::new(0, 1), handler);

        manager
            .append_with_expiry(session("A", now_millis() + 50))
            .await
            .unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.delete_key("A").await.unwrap(), 1);
        assert_eq!(manager.pending_timers(), 0);

        sleep(Duration::from_millis(150)).await;
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_manual_removal_skips_handler() {
        let (_dir, arbiter) = sessions();
        let (handler, mut expired) = ExpiryChannel::bounded(8);
        let manager = ExpiryManager::new(arbiter.handle(), ExpiryConfig::new(0, 1), handler);

        manager
            .append_with_expiry(session("A", now_millis() + 30))
            .await
            .unwrap();
        // Bypasses the manager, so the timer still fires but finds nothing
        assert!(arbiter.read_and_delete("A").await.unwrap().is_some());

        sleep(Duration::from_millis(150)).await;
        assert!(expired.try_recv().is_err());
        assert_eq!(manager.pending_timers(), 0);
    }

    #[tokio::test]
    async fn test_dropped_append_still_schedules_expiry() {
        let (_dir, arbiter) = sessions();
        let (handler, mut expired) = ExpiryChannel::bounded(8);
        let manager = ExpiryManager::new(arbiter.handle(), ExpiryConfig::new(0, 1), handler);

        let record = session("A", now_millis() + 30);
        let mut append = task::spawn(manager.append_with_expiry(record.clone()));
        assert_pending!(append.poll());
        drop(append);

        let fired = timeout(Duration::from_secs(2), expired.recv()).await.unwrap();
        assert_eq!(fired, Some(record));
        assert!(!arbiter.scan("A").await.unwrap());
        assert_eq!(manager.pending_timers(), 0);
    }

    #[tokio::test]
    async fn test_replacing_fired_timer_still_notifies() {
        let (_dir, arbiter) = sessions();
        let (handler, mut expired) = ExpiryChannel::bounded(8);
        let manager = ExpiryManager::new(arbiter.handle(), ExpiryConfig::new(0, 1), handler);

        let first = session("A", now_millis() + 20);
        manager.append_with_expiry(first.clone()).await.unwrap();

        // Hold the worker so the expiry's read-and-delete waits in the queue
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
        let blocker = arbiter.submit(OperationKind::Read, move |_| {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            Ok(())
        });
        started_rx.recv().unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(arbiter.pending(), 1);
        assert_eq!(manager.pending_timers(), 0);
        assert_eq!(manager.expires_at("A"), None);

        let second = session("A", now_millis() + 3_600_000);
        let mut replace = task::spawn(manager.append_with_expiry(second.clone()));
        assert_pending!(replace.poll());
        assert_eq!(arbiter.pending(), 2);

        release_tx.send(()).unwrap();
        blocker.await.unwrap();
        replace.await.unwrap();

        let fired = timeout(Duration::from_secs(2), expired.recv()).await.unwrap();
        assert_eq!(fired, Some(first));
        assert_eq!(arbiter.read("A").await.unwrap(), Some(second));
        assert_eq!(manager.pending_timers(), 1);
    }

    #[tokio::test]
    async fn test_invalid_lifetime_rejected() {
        let (dir, arbiter) = sessions();
        let manager = ExpiryManager::new(arbiter.handle(), ExpiryConfig::new(0, 1), |_: Record| {});

        let result = manager
            .append_with_expiry(Record::from(["A", "tomorrow"]))
            .await;
        assert!(matches!(
            result,
            Err(StoreError::InvalidRecord(CodecError::InvalidLifetime(_)))
        ));
        assert_eq!(manager.pending_timers(), 0);
        assert_eq!(
            fs::read_to_string(dir.path().join("sessions.txt")).unwrap(),
            "user, expires_at\n"
        );
    }

    #[tokio::test]
    async fn test_rehydrate_from_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.txt");
        let now = now_millis();
        fs::write(
            &path,
            format!(
                "user, expires_at\nold, {}\nsoon, {}\nlater, {}\nbroken, never\n",
                now - 1_000,
                now + 60,
                now + 3_600_000
            ),
        )
        .unwrap();

        let config = StoreConfig::new(&path).with_header(["user", "expires_at"]);
        let arbiter = Arbiter::open(config, ArbiterConfig::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let manager = ExpiryManager::new(
            arbiter.handle(),
            ExpiryConfig::new(0, 1),
            move |record: Record| sink.lock().unwrap().push(record.get(0).unwrap().to_string()),
        );

        assert_eq!(manager.rehydrate().await.unwrap(), 3);
        assert!(manager.expires_at("later").is_some());
        assert!(manager.expires_at("broken").is_none());

        sleep(Duration::from_millis(300)).await;

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["old".to_string(), "soon".to_string()]);
        assert_eq!(manager.pending_timers(), 1);
        assert!(arbiter.scan("later").await.unwrap());
    }

    #[tokio::test]
    async fn test_start_rehydrates() {
        let (_dir, arbiter) = sessions();
        let later = now_millis() + 3_600_000;
        arbiter.append(session("a", later)).await.unwrap();
        arbiter.append(session("b", later)).await.unwrap();

        let manager = ExpiryManager::start(arbiter.handle(), ExpiryConfig::new(0, 1), |_: Record| {})
            .await
            .unwrap();

        assert_eq!(manager.pending_timers(), 2);
        assert_eq!(manager.expires_at("a"), Some(later));
    }

    #[tokio::test]
    async fn test_rehydrate_twice_keeps_one_timer_per_key() {
        let (_dir, arbiter) = sessions();
        let manager = ExpiryManager::new(arbiter.handle(), ExpiryConfig::new(0, 1), |_: Record| {});
        let later = now_millis() + 3_600_000;

        arbiter.append(session("a", later)).await.unwrap();
        arbiter.append(session("b", later)).await.unwrap();

        assert_eq!(manager.rehydrate().await.unwrap(), 2);
        assert_eq!(manager.rehydrate().await.unwrap(), 2);
        assert_eq!(manager.pending_timers(), 2);
    }

    #[tokio::test]
    async fn test_drop_aborts_timers() {
        let (_dir, arbiter) = sessions();
        let (handler, mut expired) = ExpiryChannel::bounded(8);
        let manager = ExpiryManager::new(arbiter.handle(), ExpiryConfig::new(0, 1), handler);

        manager
            .append_with_expiry(session("A", now_millis() + 30))
            .await
            .unwrap();
        drop(manager);

        sleep(Duration::from_millis(150)).await;
        assert!(expired.try_recv().is_err());
        assert!(arbiter.scan("A").await.unwrap());
    }

    #[tokio::test]
    async fn test_with_locked_backend() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("sessions.txt"));
        let backend = LockedBackend::open(config, tokio::runtime::Handle::current()).unwrap();
        let (handler, mut expired) = ExpiryChannel::bounded(8);
        let manager = ExpiryManager::new(backend.clone(), ExpiryConfig::new(0, 1), handler);

        let record = session("B", now_millis() + 20);
        manager.append_with_expiry(record.clone()).await.unwrap();

        let fired = timeout(Duration::from_secs(2), expired.recv()).await.unwrap();
        assert_eq!(fired, Some(record));
        assert!(!backend.scan("B").await.unwrap());
    }
}

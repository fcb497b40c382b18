//! Single-Worker Request Arbiter
//!
//! Every operation against a [`RecordStore`] goes through its arbiter. The
//! arbiter owns the store, moves it onto one dedicated worker thread, and
//! feeds that thread instructions in priority order.
//!
//! ## Lifecycle of an instruction
//!
//! ```text
//! Submitted ──> Queued ──> Executing ──> Completed
//!                                   └──> Failed
//! ```
//!
//! The caller gets a [`Pending`] at submission. The worker resolves it
//! exactly once when the instruction reaches a terminal state.
//!
//! ## Concurrency Model
//!
//! ```text
//!  caller threads                      worker thread
//! ┌──────────────┐   submit()   ┌───────────────────────────┐
//! │ ArbiterHandle├─────────────>│ Mutex<InstructionQueue>   │
//! └──────────────┘  notify_one  │        │ pop(now)         │
//! ┌──────────────┐              │        ▼                  │
//! │ ArbiterHandle├─────────────>│ instruction.execute(store)│
//! └──────────────┘              └───────────────────────────┘
//! ```
//!
//! The queue lock is only held to push or pop, never across file I/O.
//! The worker sleeps on a condition variable while the queue is empty.

use crate::arbiter::instruction::{Instruction, Job, OperationKind, Pending, PriorityWeights};
use crate::arbiter::queue::InstructionQueue;
use crate::codec::Record;
use crate::storage::{RecordStore, StoreConfig, StoreError, StoreResult};
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Configuration for an [`Arbiter`].
#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    /// Wait after which an instruction jumps ahead of everything else (default: 200ms)
    pub starvation_threshold: Duration,

    /// Instructions submitted within the same window are ordered by weight (default: 1ms)
    pub tie_window: Duration,

    /// Per-operation priority weights
    pub weights: PriorityWeights,

    /// Name of the worker thread
    pub thread_name: String,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            starvation_threshold: Duration::from_millis(200),
            tie_window: Duration::from_millis(1),
            weights: PriorityWeights::default(),
            thread_name: "flatkv-arbiter".to_string(),
        }
    }
}

impl ArbiterConfig {
    pub fn with_starvation_threshold(mut self, threshold: Duration) -> Self {
        self.starvation_threshold = threshold;
        self
    }

    pub fn with_tie_window(mut self, window: Duration) -> Self {
        self.tie_window = window;
        self
    }

    pub fn with_weights(mut self, weights: PriorityWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

/// Counters for an arbiter
#[derive(Debug, Default)]
pub struct ArbiterStats {
    /// Instructions accepted into the queue
    pub submitted: AtomicU64,
    /// Instructions whose store operation succeeded
    pub completed: AtomicU64,
    /// Instructions whose store operation returned an error
    pub failed: AtomicU64,
    /// Instructions that panicked on the worker
    pub lost: AtomicU64,
    /// Instructions picked ahead of their turn because they starved
    pub promoted: AtomicU64,
}

impl ArbiterStats {
    fn record(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct State {
    queue: InstructionQueue,
    next_seq: u64,
    shutting_down: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    weights: PriorityWeights,
    stats: ArbiterStats,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable submission handle for an [`Arbiter`].
///
/// Handles can be moved to any thread. Once the arbiter is dropped, every
/// submission resolves to [`StoreError::Closed`].
#[derive(Clone)]
pub struct ArbiterHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ArbiterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbiterHandle")
            .field("pending", &self.pending())
            .field("submitted", &self.shared.stats.submitted.load(Ordering::Relaxed))
            .finish()
    }
}

impl ArbiterHandle {
    /// Appends a record.
    pub fn append(&self, record: Record) -> Pending<()> {
        self.submit(OperationKind::Append, move |store| store.append(record))
    }

    /// Deletes a key, resolving to the number of records removed.
    pub fn delete(&self, key: impl Into<String>) -> Pending<usize> {
        let key = key.into();
        self.submit(OperationKind::Delete, move |store| store.delete(&key))
    }

    /// Reads the record with `key`.
    pub fn read(&self, key: impl Into<String>) -> Pending<Option<Record>> {
        let key = key.into();
        self.submit(OperationKind::Read, move |store| store.read(&key))
    }

    /// Checks whether `key` is present.
    pub fn scan(&self, key: impl Into<String>) -> Pending<bool> {
        let key = key.into();
        self.submit(OperationKind::Scan, move |store| store.contains(&key))
    }

    /// Removes and returns the record with `key`.
    pub fn read_and_delete(&self, key: impl Into<String>) -> Pending<Option<Record>> {
        let key = key.into();
        self.submit(OperationKind::ReadAndDelete, move |store| {
            store.read_and_delete(&key)
        })
    }

    /// Returns every record, optionally with the header.
    pub fn dump(&self, include_header: bool) -> Pending<Vec<Record>> {
        self.submit(OperationKind::Dump, move |store| store.dump(include_header))
    }

    /// Number of instructions waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn stats(&self) -> &ArbiterStats {
        &self.shared.stats
    }

    pub(crate) fn submit<T, F>(&self, kind: OperationKind, operation: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RecordStore) -> StoreResult<T> + Send + 'static,
    {
        let (reply, pending) = Pending::channel();
        let job: Job = Box::new(move |store: &mut RecordStore| {
            let result = operation(store);
            let ok = result.is_ok();
            if let Err(err) = &result {
                warn!(kind = %kind, error = %err, "Instruction failed");
            }
            // The caller may have dropped its handle; the work still happened
            let _ = reply.send(result);
            ok
        });

        {
            let mut state = self.shared.lock();
            if state.shutting_down {
                return Pending::ready(Err(StoreError::Closed));
            }
            let seq = state.next_seq;
            state.next_seq += 1;

            let weight = self.shared.weights.weight(kind);
            state
                .queue
                .push(Instruction::new(kind, weight, Instant::now(), seq, job));
            trace!(kind = %kind, seq, "Instruction queued");
        }

        self.shared.stats.record(&self.shared.stats.submitted);
        self.shared.wake.notify_one();
        pending
    }
}

/// Owns a record store and the worker thread that serves it.
///
/// Dropping the arbiter stops intake, lets the worker finish everything
/// already queued, and joins the thread.
///
/// # Example
///
/// ```
/// use flatkv::arbiter::{Arbiter, ArbiterConfig};
/// use flatkv::codec::Record;
/// use flatkv::storage::StoreConfig;
///
/// let dir = tempfile::tempdir().unwrap();
/// let arbiter = Arbiter::open(StoreConfig::new(dir.path().join("ids.txt")), ArbiterConfig::default()).unwrap();
///
/// arbiter.append(Record::from(["42", "open"])).wait().unwrap();
/// assert!(arbiter.scan("42").wait().unwrap());
/// ```
pub struct Arbiter {
    handle: ArbiterHandle,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Arbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arbiter")
            .field("handle", &self.handle)
            .field("running", &self.worker.is_some())
            .finish()
    }
}

impl Arbiter {
    /// Moves `store` onto a new worker thread.
    pub fn start(store: RecordStore, config: ArbiterConfig) -> StoreResult<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: InstructionQueue::new(
                    Instant::now(),
                    config.tie_window,
                    config.starvation_threshold,
                ),
                next_seq: 0,
                shutting_down: false,
            }),
            wake: Condvar::new(),
            weights: config.weights,
            stats: ArbiterStats::default(),
        });

        let path = store.path().to_path_buf();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || worker_loop(worker_shared, store))
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;

        info!(
            path = %path.display(),
            thread = %config.thread_name,
            starvation_ms = config.starvation_threshold.as_millis(),
            "Arbiter started"
        );

        Ok(Self {
            handle: ArbiterHandle { shared },
            worker: Some(worker),
        })
    }

    /// Opens the store described by `store_config` and starts serving it.
    pub fn open(store_config: StoreConfig, config: ArbiterConfig) -> StoreResult<Self> {
        Self::start(RecordStore::open(store_config)?, config)
    }

    /// Returns a cloneable submission handle.
    pub fn handle(&self) -> ArbiterHandle {
        self.handle.clone()
    }

    /// Stops the arbiter, draining queued instructions first.
    ///
    /// Equivalent to dropping it.
    pub fn shutdown(self) {}
}

impl Deref for Arbiter {
    type Target = ArbiterHandle;

    fn deref(&self) -> &ArbiterHandle {
        &self.handle
    }
}

impl Drop for Arbiter {
    fn drop(&mut self) {
        let shared = &self.handle.shared;
        {
            let mut state = shared.lock();
            state.shutting_down = true;
            if !state.queue.is_empty() {
                debug!(pending = state.queue.len(), "Draining queue before shutdown");
            }
        }
        shared.wake.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Arbiter worker thread panicked");
            }
        }
        info!("Arbiter stopped");
    }
}

/// Drains the queue, sleeping while it is empty, until shutdown.
fn worker_loop(shared: Arc<Shared>, mut store: RecordStore) {
    loop {
        let (instruction, promoted) = {
            let mut state = shared.lock();
            loop {
                if let Some(next) = state.queue.pop(Instant::now()) {
                    break next;
                }
                if state.shutting_down {
                    return;
                }
                state = shared
                    .wake
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if promoted {
            shared.stats.record(&shared.stats.promoted);
        }
        execute(&shared.stats, instruction, &mut store);
    }
}

fn execute(stats: &ArbiterStats, instruction: Instruction, store: &mut RecordStore) {
    let kind = instruction.kind();
    let seq = instruction.seq;
    trace!(kind = %kind, seq, "Executing instruction");

    match panic::catch_unwind(AssertUnwindSafe(|| instruction.execute(store))) {
        Ok(true) => stats.record(&stats.completed),
        Ok(false) => stats.record(&stats.failed),
        Err(_) => {
            error!(kind = %kind, seq, "Instruction panicked; continuing with the next one");
            stats.record(&stats.lost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn scores(dir: &std::path::Path, config: ArbiterConfig) -> Arbiter {
        let store = StoreConfig::new(dir.join("scores.txt")).with_header(["name", "score"]);
        Arbiter::open(store, config).unwrap()
    }

    /// Occupies the worker until the returned sender is used or dropped.
    fn block_worker(arbiter: &Arbiter) -> (mpsc::Sender<()>, Pending<()>) {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let blocker = arbiter.submit(OperationKind::Read, move |_| {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            Ok(())
        });
        started_rx.recv().unwrap();
        (release_tx, blocker)
    }

    fn recorded(
        arbiter: &Arbiter,
        kind: OperationKind,
        log: &Arc<Mutex<Vec<OperationKind>>>,
    ) -> Pending<()> {
        let log = Arc::clone(log);
        arbiter.submit(kind, move |_| {
            log.lock().unwrap().push(kind);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_operations_round_trip() {
        let dir = tempdir().unwrap();
        let arbiter = scores(dir.path(), ArbiterConfig::default());

        arbiter.append(Record::from(["alice", "100"])).await.unwrap();
        arbiter.append(Record::from(["bob", "200"])).await.unwrap();

        assert_eq!(
            arbiter.read("bob").await.unwrap(),
            Some(Record::from(["bob", "200"]))
        );
        assert!(arbiter.scan("alice").await.unwrap());
        assert_eq!(arbiter.delete("alice").await.unwrap(), 1);
        assert!(!arbiter.scan("alice").await.unwrap());
        assert_eq!(
            arbiter.dump(false).await.unwrap(),
            vec![Record::from(["bob", "200"])]
        );
        assert_eq!(
            arbiter.read_and_delete("bob").await.unwrap(),
            Some(Record::from(["bob", "200"]))
        );
        assert!(arbiter.dump(false).await.unwrap().is_empty());
    }

    #[test]
    fn test_blocking_callers() {
        let dir = tempdir().unwrap();
        let arbiter = scores(dir.path(), ArbiterConfig::default());
        let handle = arbiter.handle();

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let handle = handle.clone();
                thread::spawn(move || {
                    handle
                        .append(Record::from(vec![format!("user{i}"), i.to_string()]))
                        .wait()
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap().unwrap();
        }

        assert_eq!(arbiter.dump(false).wait().unwrap().len(), 8);
        assert_eq!(arbiter.stats().submitted.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn test_concurrent_read_and_delete_yields_once() {
        let dir = tempdir().unwrap();
        let arbiter = scores(dir.path(), ArbiterConfig::default());
        arbiter.append(Record::from(["session", "1"])).wait().unwrap();

        let takers: Vec<_> = (0..16)
            .map(|_| {
                let handle = arbiter.handle();
                thread::spawn(move || handle.read_and_delete("session").wait())
            })
            .collect();

        let found = takers
            .into_iter()
            .map(|taker| taker.join().unwrap().unwrap())
            .filter(Option::is_some)
            .count();
        assert_eq!(found, 1);
    }

    #[test]
    fn test_weight_orders_contemporaneous_instructions() {
        let dir = tempdir().unwrap();
        let config = ArbiterConfig::default()
            .with_tie_window(Duration::from_secs(3600))
            .with_starvation_threshold(Duration::from_secs(3600));
        let arbiter = scores(dir.path(), config);
        let log = Arc::new(Mutex::new(Vec::new()));

        let (release, blocker) = block_worker(&arbiter);
        let pending: Vec<_> = [
            OperationKind::Scan,
            OperationKind::Read,
            OperationKind::Append,
            OperationKind::Delete,
        ]
        .into_iter()
        .map(|kind| recorded(&arbiter, kind, &log))
        .collect();

        release.send(()).unwrap();
        blocker.wait().unwrap();
        for p in pending {
            p.wait().unwrap();
        }

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                OperationKind::Delete,
                OperationKind::Append,
                OperationKind::Read,
                OperationKind::Scan
            ]
        );
    }

    #[test]
    fn test_starved_instruction_runs_first() {
        let dir = tempdir().unwrap();
        let config = ArbiterConfig::default()
            .with_tie_window(Duration::from_secs(3600))
            .with_starvation_threshold(Duration::from_millis(20));
        let arbiter = scores(dir.path(), config);
        let log = Arc::new(Mutex::new(Vec::new()));

        let (release, blocker) = block_worker(&arbiter);
        let scan = recorded(&arbiter, OperationKind::Scan, &log);
        thread::sleep(Duration::from_millis(50));
        let delete = recorded(&arbiter, OperationKind::Delete, &log);

        release.send(()).unwrap();
        blocker.wait().unwrap();
        scan.wait().unwrap();
        delete.wait().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![OperationKind::Scan, OperationKind::Delete]
        );
        assert_eq!(arbiter.stats().promoted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_failure_does_not_stop_worker() {
        let dir = tempdir().unwrap();
        let arbiter = scores(dir.path(), ArbiterConfig::default());
        fs::remove_file(dir.path().join("scores.txt")).unwrap();

        assert!(matches!(
            arbiter.read("alice").wait(),
            Err(StoreError::Io { .. })
        ));

        // Append recreates the file (and its header)
        arbiter.append(Record::from(["alice", "100"])).wait().unwrap();
        assert!(arbiter.scan("alice").wait().unwrap());
        assert_eq!(arbiter.stats().failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_panic_does_not_stop_worker() {
        let dir = tempdir().unwrap();
        let arbiter = scores(dir.path(), ArbiterConfig::default());

        let lost: Pending<()> = arbiter.submit(OperationKind::Read, |_| panic!("boom"));
        assert!(matches!(lost.wait(), Err(StoreError::WorkerLost)));

        arbiter.append(Record::from(["alice", "100"])).wait().unwrap();
        assert_eq!(arbiter.stats().lost.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_drop_drains_queue() {
        let dir = tempdir().unwrap();
        let arbiter = scores(dir.path(), ArbiterConfig::default());

        let (release, blocker) = block_worker(&arbiter);
        let appends: Vec<_> = (0..5)
            .map(|i| arbiter.append(Record::from(vec![format!("user{i}"), "0".to_string()])))
            .collect();
        release.send(()).unwrap();
        drop(arbiter);

        blocker.wait().unwrap();
        for append in appends {
            append.wait().unwrap();
        }

        let contents = fs::read_to_string(dir.path().join("scores.txt")).unwrap();
        assert_eq!(contents.lines().count(), 6);
    }

    #[test]
    fn test_handle_after_shutdown_is_closed() {
        let dir = tempdir().unwrap();
        let arbiter = scores(dir.path(), ArbiterConfig::default());
        let handle = arbiter.handle();
        arbiter.shutdown();

        assert!(matches!(handle.read("alice").wait(), Err(StoreError::Closed)));
        assert_eq!(handle.pending(), 0);
    }
}

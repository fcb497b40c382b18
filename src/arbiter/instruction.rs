//! Instructions and Reply Handles
//!
//! An [`Instruction`] is one queued request against the store: what kind of
//! operation it is, when it was submitted, and the type-erased job the worker
//! runs. The caller keeps the other half, a [`Pending`] handle that resolves
//! exactly once with the job's result.

use crate::storage::{RecordStore, StoreError, StoreResult};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// The store operation an instruction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Append,
    Delete,
    Read,
    /// Key existence check
    Scan,
    ReadAndDelete,
    Dump,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Append => "append",
            OperationKind::Delete => "delete",
            OperationKind::Read => "read",
            OperationKind::Scan => "scan",
            OperationKind::ReadAndDelete => "read_and_delete",
            OperationKind::Dump => "dump",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-operation priority weights. Smaller is more urgent.
///
/// Only the relative order matters. Weights break ties between instructions
/// submitted within the same tie window; they never let a newer instruction
/// overtake an older one from an earlier window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityWeights {
    pub delete: u32,
    pub read_and_delete: u32,
    pub append: u32,
    pub read: u32,
    pub scan: u32,
    pub dump: u32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            delete: 1,
            read_and_delete: 1,
            append: 2,
            read: 3,
            scan: 4,
            dump: 4,
        }
    }
}

impl PriorityWeights {
    /// Returns the weight for `kind`.
    pub fn weight(&self, kind: OperationKind) -> u32 {
        match kind {
            OperationKind::Delete => self.delete,
            OperationKind::ReadAndDelete => self.read_and_delete,
            OperationKind::Append => self.append,
            OperationKind::Read => self.read,
            OperationKind::Scan => self.scan,
            OperationKind::Dump => self.dump,
        }
    }
}

/// The work an instruction does on the worker. Returns `true` on success.
pub(crate) type Job = Box<dyn FnOnce(&mut RecordStore) -> bool + Send + 'static>;

/// A queued request to perform one store operation.
pub struct Instruction {
    pub(crate) kind: OperationKind,
    pub(crate) weight: u32,
    pub(crate) submitted: Instant,
    pub(crate) seq: u64,
    job: Job,
}

impl Instruction {
    pub(crate) fn new(kind: OperationKind, weight: u32, submitted: Instant, seq: u64, job: Job) -> Self {
        Self {
            kind,
            weight,
            submitted,
            seq,
            job,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// How long the instruction has been waiting at `now`.
    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.submitted)
    }

    /// Runs the job to completion against the store.
    pub(crate) fn execute(self, store: &mut RecordStore) -> bool {
        (self.job)(store)
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instruction")
            .field("kind", &self.kind)
            .field("weight", &self.weight)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Sending half of a [`Pending`].
pub(crate) type Reply<T> = oneshot::Sender<StoreResult<T>>;

/// A handle to the eventual result of a submitted instruction.
///
/// Await it from async code, or call [`wait`](Pending::wait) from a plain
/// thread. If the instruction is lost (its job panicked), the handle resolves
/// to [`StoreError::WorkerLost`].
#[must_use = "a Pending does nothing unless awaited or waited on"]
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<StoreResult<T>>,
}

impl<T> Pending<T> {
    pub(crate) fn channel() -> (Reply<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A handle that is already resolved.
    pub fn ready(result: StoreResult<T>) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(result);
        pending
    }

    /// Blocks the current thread until the result is available.
    ///
    /// Must not be called from inside an async context; await the handle there.
    pub fn wait(self) -> StoreResult<T> {
        self.rx.blocking_recv().unwrap_or(Err(StoreError::WorkerLost))
    }
}

impl<T> Future for Pending<T> {
    type Output = StoreResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(StoreError::WorkerLost)))
    }
}

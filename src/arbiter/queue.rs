//! Priority Queue with Starvation Promotion
//!
//! Orders pending instructions for the worker.
//!
//! ## Ordering
//!
//! ```text
//! 1. Starved first:  the oldest instruction whose wait >= starvation_threshold
//! 2. Otherwise:      smallest (submission bucket, weight, sequence)
//! ```
//!
//! The submission bucket is the time since the queue was created divided by
//! the tie window. Send time therefore dominates; weight only reorders
//! instructions that arrived within the same window, and the sequence number
//! keeps equal entries FIFO.
//!
//! Two indexes are kept in step: one by priority key, one by age. Starvation
//! can't be folded into a single heap ordering because it depends on the
//! time the next instruction is picked, not the time it was inserted.

use crate::arbiter::instruction::Instruction;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PriorityKey {
    bucket: u128,
    weight: u32,
    seq: u64,
}

/// Pending instructions for one arbiter.
#[derive(Debug)]
pub(crate) struct InstructionQueue {
    epoch: Instant,
    tie_window: Duration,
    starvation_threshold: Duration,
    by_priority: BTreeMap<PriorityKey, Instruction>,
    by_age: BTreeMap<(Instant, u64), PriorityKey>,
}

impl InstructionQueue {
    pub(crate) fn new(epoch: Instant, tie_window: Duration, starvation_threshold: Duration) -> Self {
        Self {
            epoch,
            tie_window,
            starvation_threshold,
            by_priority: BTreeMap::new(),
            by_age: BTreeMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_priority.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_priority.is_empty()
    }

    pub(crate) fn push(&mut self, instruction: Instruction) {
        let window = self.tie_window.as_nanos().max(1);
        let key = PriorityKey {
            bucket: instruction.submitted.saturating_duration_since(self.epoch).as_nanos() / window,
            weight: instruction.weight,
            seq: instruction.seq,
        };

        self.by_age
            .insert((instruction.submitted, instruction.seq), key);
        self.by_priority.insert(key, instruction);
    }

    /// Removes the next instruction to run at `now`.
    ///
    /// The flag is `true` when the instruction was promoted for starvation
    /// ahead of a better-weighted one.
    pub(crate) fn pop(&mut self, now: Instant) -> Option<(Instruction, bool)> {
        let best = *self.by_priority.keys().next()?;

        let starved = self
            .by_age
            .iter()
            .next()
            .filter(|((submitted, _), _)| now.saturating_duration_since(*submitted) >= self.starvation_threshold)
            .map(|(_, key)| *key);

        let key = starved.unwrap_or(best);
        let promoted = key != best;

        let instruction = self.by_priority.remove(&key)?;
        self.by_age.remove(&(instruction.submitted, instruction.seq));

        if promoted {
            trace!(
                kind = %instruction.kind,
                waited_ms = instruction.waited(now).as_millis(),
                "Starved instruction promoted"
            );
        }
        Some((instruction, promoted))
    }
}

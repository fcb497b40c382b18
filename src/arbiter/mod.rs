//! Request Arbiter Module
//!
//! Serializes all operations against one record store through a single
//! worker thread, picking the next instruction by priority.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  submit   ┌──────────────────┐  pop(now)  ┌──────────────┐
//! │ ArbiterHandle│──────────>│ InstructionQueue │───────────>│ worker thread│
//! │  (any thread)│           │ weight + age     │            │ RecordStore  │
//! └──────┬───────┘           └──────────────────┘            └──────┬───────┘
//!        │                                                         │
//!        └───────────────────── Pending<T> <───────────────────────┘
//! ```
//!
//! ## Scheduling
//!
//! - Send time dominates: an instruction never overtakes an older one
//!   submitted in an earlier tie window.
//! - Within a tie window: `Delete = ReadAndDelete < Append < Read < Scan = Dump`.
//! - An instruction that has waited past the starvation threshold (200ms
//!   by default) runs before anything that has not.
//!
//! ## Modules
//!
//! - `instruction`: Operation kinds, weights, instructions, reply handles
//! - `queue`: The starvation-aware priority queue
//! - `worker`: The arbiter, its submission handle, and the worker loop

pub mod instruction;
pub(crate) mod queue;
pub mod worker;

// Re-export commonly used types
pub use instruction::{Instruction, OperationKind, Pending, PriorityWeights};
pub use worker::{Arbiter, ArbiterConfig, ArbiterHandle, ArbiterStats};

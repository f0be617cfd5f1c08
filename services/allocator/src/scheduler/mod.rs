//! Allocation scheduler.
//!
//! The scheduler takes one allocation in the `allocating` state to a
//! terminal state:
//! - Validates its parameters
//! - Lists candidate nodes without locking
//! - Walks the candidates in random order, locking each and re-checking the
//!   locked snapshot before binding it
//! - Retries whole passes with a fixed delay while nodes are contended
//! - Records the winning node, or the reason no node could be bound

mod allocate;
mod error;

pub use allocate::{Scheduler, SchedulerConfig};
pub use error::{AllocationFailure, FailureKind};

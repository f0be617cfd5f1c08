//! Inventory and allocation records.
//!
//! Both record types are plain data: every mutation that matters for
//! correctness goes through a store (see [`crate::store`]) so that the
//! reservation and association invariants are enforced in one place.

mod allocation;
mod node;

pub use allocation::{Allocation, AllocationState};
pub use node::{Association, Node, PowerState, ProvisionState};

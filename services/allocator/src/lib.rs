//! bmfleet allocation engine
//!
//! Binds allocation requests (a resource class plus required traits,
//! optionally narrowed to a list of candidate nodes) to exactly one node
//! from the bare-metal inventory. Many allocations are scheduled
//! concurrently; nodes are claimed through a compare-and-set reservation in
//! the store so that no node is ever bound twice.

pub mod config;
pub mod dispatcher;
pub mod filter;
pub mod lock;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod validation;

//! # bmfleet-id
//!
//! Typed identifiers for fleet resources.
//!
//! ## Design Principles
//!
//! - IDs are system-generated UUIDs; names are user-controlled labels
//! - All IDs have a canonical string representation (hyphenated, lowercase)
//! - Parsing is strict: braces, URNs and simple (unhyphenated) forms are rejected
//! - IDs are typed so a node ID cannot be passed where an allocation ID is expected
//!
//! Examples:
//! - `1be26c0b-03f2-4d2e-ae87-c02d7f33c123`
//!
//! The plain UUID form is shared with external collaborators: a node's
//! `instance_uuid` is the raw UUID of the allocation bound to it.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;

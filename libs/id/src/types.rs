//! Typed ID definitions for fleet resources.

use crate::define_id;

// =============================================================================
// Inventory
// =============================================================================

define_id!(NodeId, "node");

// =============================================================================
// Allocations
// =============================================================================

define_id!(AllocationId, "allocation");

// =============================================================================
// Tests
// =============================================================================

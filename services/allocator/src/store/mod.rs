//! Persistence for the node inventory and allocation records.
//!
//! This module provides:
//! - `NodeStore` / `AllocationStore` traits the engine is written against
//! - `MemoryStore`, a single-process implementation used by tests and embedders
//! - `PgStore`, the Postgres implementation, plus pool management (`Database`)
//!
//! The node reservation is a compare-and-set on the `reservation` column,
//! never a process-local mutex, so lock holders in different processes see
//! each other.

mod database;
mod error;
mod memory;
mod postgres;

pub use database::{Database, DbConfig};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use bmfleet_id::{AllocationId, NodeId};

use crate::model::{Allocation, AllocationState, Association, Node, PowerState, ProvisionState};

/// Coarse node query.
///
/// Every `Some` field narrows the result. The filter is evaluated without
/// taking any lock, so results are only a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeFilter {
    pub resource_class: Option<String>,
    pub provision_state: Option<ProvisionState>,
    pub maintenance: Option<bool>,
    /// `Some(false)` keeps only nodes without an `instance_uuid`.
    pub associated: Option<bool>,
    /// Drop nodes whose power state is unknown.
    pub require_known_power: bool,
    /// Nodes must carry every one of these traits.
    pub traits: Vec<String>,
    /// Restrict to this set of nodes.
    pub ids: Option<Vec<NodeId>>,
}

impl NodeFilter {
    pub fn matches(&self, node: &Node) -> bool {
        if let Some(resource_class) = &self.resource_class {
            if node.resource_class.as_deref() != Some(resource_class.as_str()) {
                return false;
            }
        }
        if let Some(state) = self.provision_state {
            if node.provision_state != state {
                return false;
            }
        }
        if let Some(maintenance) = self.maintenance {
            if node.maintenance != maintenance {
                return false;
            }
        }
        if let Some(associated) = self.associated {
            if node.is_associated() != associated {
                return false;
            }
        }
        if self.require_known_power && node.power_state == PowerState::Unknown {
            return false;
        }
        if !self.traits.iter().all(|t| node.traits.contains(t)) {
            return false;
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&node.id) {
                return false;
            }
        }
        true
    }
}

/// Allocation listing filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationFilter {
    pub state: Option<AllocationState>,
    pub conductor_affinity: Option<String>,
}

impl AllocationFilter {
    pub fn matches(&self, allocation: &Allocation) -> bool {
        if let Some(state) = self.state {
            if allocation.state != state {
                return false;
            }
        }
        if let Some(conductor) = &self.conductor_affinity {
            if allocation.conductor_affinity.as_deref() != Some(conductor.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Node inventory operations used by the allocation engine.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Inserts or replaces a node record.
    ///
    /// This is the inventory-management entry point; the engine itself never
    /// calls it.
    async fn put_node(&self, node: &Node) -> StoreResult<()>;

    async fn get_node(&self, id: NodeId) -> StoreResult<Node>;

    /// Lists nodes matching `filter`, ordered by ID.
    async fn list_nodes(&self, filter: &NodeFilter) -> StoreResult<Vec<Node>>;

    /// Sets `reservation` to `owner` if the node is unreserved and returns
    /// the node as stored after the update.
    ///
    /// Fails with `NodeLocked` if any owner (including `owner` itself)
    /// already holds the reservation. Never waits.
    async fn reserve_node(&self, id: NodeId, owner: &str) -> StoreResult<Node>;

    /// Clears `reservation` unconditionally. Missing nodes are ignored.
    async fn release_node(&self, id: NodeId) -> StoreResult<()>;

    /// Clears every reservation whose owner token starts with
    /// `owner_prefix` and returns how many were cleared.
    ///
    /// Used at startup to drop locks a previous run of the same conductor
    /// left behind.
    async fn clear_reservations(&self, owner_prefix: &str) -> StoreResult<u64>;

    /// Writes or clears the node's association.
    ///
    /// The node must be reserved by `owner` (`NotLocked` otherwise). Setting
    /// an association on a node that already has an `instance_uuid` fails
    /// with `NodeAssociated`.
    async fn set_association(
        &self,
        id: NodeId,
        owner: &str,
        association: Option<Association>,
    ) -> StoreResult<Node>;
}

/// Allocation record operations.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    async fn create_allocation(&self, allocation: &Allocation) -> StoreResult<()>;

    async fn get_allocation(&self, id: AllocationId) -> StoreResult<Allocation>;

    async fn get_allocation_by_name(&self, name: &str) -> StoreResult<Allocation>;

    async fn update_allocation(&self, allocation: &Allocation) -> StoreResult<()>;

    async fn delete_allocation(&self, id: AllocationId) -> StoreResult<()>;

    async fn list_allocations(&self, filter: &AllocationFilter) -> StoreResult<Vec<Allocation>>;
}

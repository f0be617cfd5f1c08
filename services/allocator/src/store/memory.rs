//! In-process store.
//!
//! All state sits behind one async mutex, so every operation is atomic with
//! respect to every other one. That gives the same compare-and-set semantics
//! as the conditional updates in the Postgres store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bmfleet_id::{AllocationId, NodeId};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{AllocationFilter, AllocationStore, NodeFilter, NodeStore, StoreError, StoreResult};
use crate::model::{Allocation, Association, Node};

#[derive(Debug, Default)]
struct Inner {
    nodes: HashMap<NodeId, Node>,
    allocations: HashMap<AllocationId, Allocation>,
}

/// Shared in-memory node and allocation store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_name_free(
    allocations: &HashMap<AllocationId, Allocation>,
    allocation: &Allocation,
) -> StoreResult<()> {
    let Some(name) = &allocation.name else {
        return Ok(());
    };
    let taken = allocations
        .values()
        .any(|other| other.id != allocation.id && other.name.as_ref() == Some(name));
    if taken {
        return Err(StoreError::AllocationDuplicateName(name.clone()));
    }
    Ok(())
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn put_node(&self, node: &Node) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn get_node(&self, id: NodeId) -> StoreResult<Node> {
        let inner = self.inner.lock().await;
        inner
            .nodes
            .get(&id)
            .cloned()
            .ok_or(StoreError::NodeNotFound(id))
    }

    async fn list_nodes(&self, filter: &NodeFilter) -> StoreResult<Vec<Node>> {
        let inner = self.inner.lock().await;
        let mut nodes: Vec<Node> = inner
            .nodes
            .values()
            .filter(|node| filter.matches(node))
            .cloned()
            .collect();
        nodes.sort_by_key(|node| node.id);
        Ok(nodes)
    }

    async fn reserve_node(&self, id: NodeId, owner: &str) -> StoreResult<Node> {
        let mut inner = self.inner.lock().await;
        let node = inner
            .nodes
            .get_mut(&id)
            .ok_or(StoreError::NodeNotFound(id))?;

        if let Some(holder) = &node.reservation {
            return Err(StoreError::NodeLocked {
                node_id: id,
                holder: holder.clone(),
            });
        }

        node.reservation = Some(owner.to_string());
        node.updated_at = Utc::now();
        debug!(node_id = %id, owner, "Node reserved");
        Ok(node.clone())
    }

    async fn release_node(&self, id: NodeId) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(node) = inner.nodes.get_mut(&id) {
            if node.reservation.take().is_some() {
                node.updated_at = Utc::now();
                debug!(node_id = %id, "Node released");
            }
        }
        Ok(())
    }

    async fn clear_reservations(&self, owner_prefix: &str) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut cleared = 0;
        for node in inner.nodes.values_mut() {
            if node
                .reservation
                .as_deref()
                .is_some_and(|owner| owner.starts_with(owner_prefix))
            {
                node.reservation = None;
                node.updated_at = now;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn set_association(
        &self,
        id: NodeId,
        owner: &str,
        association: Option<Association>,
    ) -> StoreResult<Node> {
        let mut inner = self.inner.lock().await;
        let node = inner
            .nodes
            .get_mut(&id)
            .ok_or(StoreError::NodeNotFound(id))?;

        if node.reservation.as_deref() != Some(owner) {
            return Err(StoreError::NotLocked {
                node_id: id,
                owner: owner.to_string(),
            });
        }
        if association.is_some() {
            if let Some(instance_uuid) = node.instance_uuid {
                return Err(StoreError::NodeAssociated {
                    node_id: id,
                    instance_uuid,
                });
            }
        }

        node.set_association(association);
        node.updated_at = Utc::now();
        Ok(node.clone())
    }
}

#[async_trait]
impl AllocationStore for MemoryStore {
    async fn create_allocation(&self, allocation: &Allocation) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.allocations.contains_key(&allocation.id) {
            return Err(StoreError::AllocationAlreadyExists(allocation.id));
        }
        check_name_free(&inner.allocations, allocation)?;
        inner.allocations.insert(allocation.id, allocation.clone());
        Ok(())
    }

    async fn get_allocation(&self, id: AllocationId) -> StoreResult<Allocation> {
        let inner = self.inner.lock().await;
        inner
            .allocations
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::AllocationNotFound(id.to_string()))
    }

    async fn get_allocation_by_name(&self, name: &str) -> StoreResult<Allocation> {
        let inner = self.inner.lock().await;
        inner
            .allocations
            .values()
            .find(|a| a.name.as_deref() == Some(name))
            .cloned()
            .ok_or_else(|| StoreError::AllocationNotFound(name.to_string()))
    }

    async fn update_allocation(&self, allocation: &Allocation) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.allocations.contains_key(&allocation.id) {
            return Err(StoreError::AllocationNotFound(allocation.id.to_string()));
        }
        check_name_free(&inner.allocations, allocation)?;
        inner.allocations.insert(allocation.id, allocation.clone());
        Ok(())
    }

    async fn delete_allocation(&self, id: AllocationId) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .allocations
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::AllocationNotFound(id.to_string()))
    }

    async fn list_allocations(&self, filter: &AllocationFilter) -> StoreResult<Vec<Allocation>> {
        let inner = self.inner.lock().await;
        let mut allocations: Vec<Allocation> = inner
            .allocations
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        allocations.sort_by_key(|a| (a.created_at, a.id));
        Ok(allocations)
    }
}

//! Shared fixtures for allocator integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bmfleet_allocator::dispatcher::Dispatcher;
use bmfleet_allocator::model::{
    Allocation, AllocationState, Association, Node, PowerState, ProvisionState,
};
use bmfleet_allocator::scheduler::SchedulerConfig;
use bmfleet_allocator::store::{
    AllocationFilter, AllocationStore, MemoryStore, NodeFilter, NodeStore, StoreError, StoreResult,
};
use bmfleet_id::{AllocationId, NodeId};
use tokio::sync::Notify;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bmfleet_allocator=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Retry settings that never sleep.
pub fn fast_scheduler_config(attempts: u32) -> SchedulerConfig {
    SchedulerConfig {
        node_locked_retry_attempts: attempts,
        node_locked_retry_interval: Duration::ZERO,
    }
}

/// An eligible node of `resource_class`.
pub fn available_node(resource_class: &str) -> Node {
    let mut node = Node::new(NodeId::new());
    node.resource_class = Some(resource_class.to_string());
    node.provision_state = ProvisionState::Available;
    node.power_state = PowerState::Off;
    node
}

pub fn with_traits(mut node: Node, traits: &[&str]) -> Node {
    node.traits = traits.iter().map(|t| t.to_string()).collect();
    node
}

pub fn allocation(resource_class: &str) -> Allocation {
    Allocation::new(resource_class)
}

/// A node bound to `allocation`, as if a previous run had committed it.
pub fn bound_node(allocation: &mut Allocation, provision_state: ProvisionState) -> Node {
    let mut node = available_node(&allocation.resource_class);
    node.provision_state = provision_state;
    node.set_association(Some(Association::for_allocation(allocation.id)));
    allocation.mark_active(node.id);
    node
}

/// Polls until the allocation leaves `allocating`.
pub async fn wait_for_terminal(dispatcher: &Dispatcher, id: AllocationId) -> Allocation {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let allocation = dispatcher.get_allocation(id).await.unwrap();
        if allocation.state != AllocationState::Allocating {
            return allocation;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("allocation {id} still allocating after 5s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

type NodeMutation = fn(&mut Node);

#[derive(Default)]
struct Faults {
    reserve_attempts: AtomicUsize,
    fail_list_nodes: AtomicBool,
    fail_set_association: AtomicBool,
    fail_update_allocation: AtomicBool,
    list_delay_ms: AtomicUsize,
    /// Applied to the stored node right before a reservation attempt.
    before_reserve: Mutex<HashMap<NodeId, NodeMutation>>,
    /// Nodes whose holder lets go right after a reservation attempt loses.
    release_on_contention: Mutex<HashSet<NodeId>>,
    update_gate: Mutex<Option<UpdateGate>>,
}

/// Pauses the next `update_allocation` until `resume` is notified.
#[derive(Clone, Default)]
pub struct UpdateGate {
    pub reached: Arc<Notify>,
    pub resume: Arc<Notify>,
}

/// A `MemoryStore` wrapper that counts reservations and injects faults.
#[derive(Clone, Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    faults: Arc<Faults>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve_attempts(&self) -> usize {
        self.faults.reserve_attempts.load(Ordering::SeqCst)
    }

    pub fn fail_list_nodes(&self) {
        self.faults.fail_list_nodes.store(true, Ordering::SeqCst);
    }

    pub fn fail_set_association(&self) {
        self.faults.fail_set_association.store(true, Ordering::SeqCst);
    }

    pub fn fail_update_allocation(&self) {
        self.faults.fail_update_allocation.store(true, Ordering::SeqCst);
    }

    pub fn delay_list_nodes(&self, delay: Duration) {
        self.faults
            .list_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Changes `node_id` after candidates were listed but before it is locked.
    pub fn change_before_reserve(&self, node_id: NodeId, mutation: NodeMutation) {
        self.faults
            .before_reserve
            .lock()
            .unwrap()
            .insert(node_id, mutation);
    }

    /// The current holder of `node_id` releases it once another reservation
    /// attempt has been turned away.
    pub fn release_on_contention(&self, node_id: NodeId) {
        self.faults
            .release_on_contention
            .lock()
            .unwrap()
            .insert(node_id);
    }

    /// Holds the next allocation update. `reached` fires once the caller is
    /// parked in the store.
    pub fn hold_next_update(&self) -> UpdateGate {
        let gate = UpdateGate::default();
        *self.faults.update_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable("injected fault".to_string())
    }
}

#[async_trait]
impl NodeStore for FaultyStore {
    async fn put_node(&self, node: &Node) -> StoreResult<()> {
        self.inner.put_node(node).await
    }

    async fn get_node(&self, id: NodeId) -> StoreResult<Node> {
        self.inner.get_node(id).await
    }

    async fn list_nodes(&self, filter: &NodeFilter) -> StoreResult<Vec<Node>> {
        let delay = self.faults.list_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.faults.fail_list_nodes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.list_nodes(filter).await
    }

    async fn reserve_node(&self, id: NodeId, owner: &str) -> StoreResult<Node> {
        self.faults.reserve_attempts.fetch_add(1, Ordering::SeqCst);
        let mutation = self.faults.before_reserve.lock().unwrap().remove(&id);
        if let Some(mutation) = mutation {
            let mut node = self.inner.get_node(id).await?;
            mutation(&mut node);
            self.inner.put_node(&node).await?;
        }
        let result = self.inner.reserve_node(id, owner).await;
        if matches!(result, Err(StoreError::NodeLocked { .. }))
            && self.faults.release_on_contention.lock().unwrap().remove(&id)
        {
            self.inner.release_node(id).await?;
        }
        result
    }

    async fn release_node(&self, id: NodeId) -> StoreResult<()> {
        self.inner.release_node(id).await
    }

    async fn clear_reservations(&self, owner_prefix: &str) -> StoreResult<u64> {
        self.inner.clear_reservations(owner_prefix).await
    }

    async fn set_association(
        &self,
        id: NodeId,
        owner: &str,
        association: Option<Association>,
    ) -> StoreResult<Node> {
        if association.is_some() && self.faults.fail_set_association.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.set_association(id, owner, association).await
    }
}

#[async_trait]
impl AllocationStore for FaultyStore {
    async fn create_allocation(&self, allocation: &Allocation) -> StoreResult<()> {
        self.inner.create_allocation(allocation).await
    }

    async fn get_allocation(&self, id: AllocationId) -> StoreResult<Allocation> {
        self.inner.get_allocation(id).await
    }

    async fn get_allocation_by_name(&self, name: &str) -> StoreResult<Allocation> {
        self.inner.get_allocation_by_name(name).await
    }

    async fn update_allocation(&self, allocation: &Allocation) -> StoreResult<()> {
        let gate = self.faults.update_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.resume.notified().await;
        }
        if self.faults.fail_update_allocation.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.update_allocation(allocation).await
    }

    async fn delete_allocation(&self, id: AllocationId) -> StoreResult<()> {
        self.inner.delete_allocation(id).await
    }

    async fn list_allocations(&self, filter: &AllocationFilter) -> StoreResult<Vec<Allocation>> {
        self.inner.list_allocations(filter).await
    }
}

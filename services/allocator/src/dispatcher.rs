//! Allocation dispatcher.
//!
//! Accepts allocation requests, persists them in the `allocating` state and
//! hands their IDs to a fixed pool of workers, each running the scheduler to
//! completion for one allocation at a time. Callers never wait on scheduling.

use std::collections::HashSet;
use std::sync::Arc;

use bmfleet_id::{AllocationId, NodeId};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::lock::{LockError, LockOwner, NodeLock, NodeLocks};
use crate::model::{Allocation, AllocationState, ProvisionState};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::store::{AllocationFilter, AllocationStore, NodeStore, StoreError};
use crate::validation::{validate_name, InvalidParameter};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Identity of this conductor, stamped into `conductor_affinity`.
    pub conductor: String,

    /// Number of concurrent scheduler workers.
    pub workers: usize,

    /// Allocations that may wait for a free worker.
    pub queue_capacity: usize,

    pub scheduler: SchedulerConfig,
}

impl DispatcherConfig {
    pub fn new(conductor: impl Into<String>) -> Self {
        Self {
            conductor: conductor.into(),
            workers: 8,
            queue_capacity: 256,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Parameters of a new allocation.
#[derive(Debug, Clone, Default)]
pub struct AllocationRequest {
    pub name: Option<String>,
    pub resource_class: String,
    pub traits: Vec<String>,
    pub candidate_nodes: Vec<NodeId>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AllocationRequest {
    pub fn new(resource_class: impl Into<String>) -> Self {
        Self {
            resource_class: resource_class.into(),
            ..Default::default()
        }
    }
}

/// Errors returned to dispatcher callers.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(#[from] InvalidParameter),

    #[error("allocation {0} not found")]
    NotFound(String),

    #[error("allocation with name {0} already exists")]
    DuplicateName(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("node {node_id} is locked by {holder}")]
    NodeLocked { node_id: NodeId, holder: String },

    #[error("no free worker to process the allocation")]
    NoFreeWorker,

    #[error("dispatcher is shut down")]
    ShutDown,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AllocationNotFound(ident) => DispatchError::NotFound(ident),
            StoreError::AllocationDuplicateName(name) => DispatchError::DuplicateName(name),
            StoreError::NodeLocked { node_id, holder } => {
                DispatchError::NodeLocked { node_id, holder }
            }
            other => DispatchError::Store(other),
        }
    }
}

impl From<LockError> for DispatchError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AlreadyLocked { node_id, holder } => {
                DispatchError::NodeLocked { node_id, holder }
            }
            LockError::Reentrant { node_id, owner } => DispatchError::NodeLocked {
                node_id,
                holder: owner,
            },
            LockError::NodeNotFound(id) => DispatchError::Store(StoreError::NodeNotFound(id)),
            LockError::Store(e) => e.into(),
        }
    }
}

/// State shared between the dispatcher handle and its workers.
struct Shared {
    conductor: String,
    config: DispatcherConfig,
    scheduler: Scheduler,
    locks: NodeLocks,
    allocations: Arc<dyn AllocationStore>,
    /// Allocations queued or being processed.
    in_flight: Mutex<HashSet<AllocationId>>,
}

/// Front door of the allocation engine.
pub struct Dispatcher {
    shared: Arc<Shared>,
    queue: mpsc::Sender<AllocationId>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Starts the worker pool.
    ///
    /// Reservations left behind by a previous run of this conductor are
    /// cleared first.
    #[instrument(skip_all, fields(conductor = %config.conductor))]
    pub async fn start(
        config: DispatcherConfig,
        nodes: Arc<dyn NodeStore>,
        allocations: Arc<dyn AllocationStore>,
    ) -> Result<Self, DispatchError> {
        let stale_prefix = format!("{}/", config.conductor);
        let cleared = nodes.clear_reservations(&stale_prefix).await?;
        if cleared > 0 {
            warn!(count = cleared, "Cleared stale node reservations");
        }

        let workers = config.workers.max(1);
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            conductor: config.conductor.clone(),
            scheduler: Scheduler::new(
                config.conductor.clone(),
                config.scheduler.clone(),
                nodes.clone(),
                allocations.clone(),
            ),
            locks: NodeLocks::new(nodes),
            allocations,
            in_flight: Mutex::new(HashSet::new()),
            config,
        });

        let handles = (0..workers)
            .map(|index| {
                let worker = Worker {
                    index,
                    shared: shared.clone(),
                    queue: rx.clone(),
                };
                tokio::spawn(worker.run(shutdown_rx.clone()))
            })
            .collect();

        info!(workers, "Dispatcher started");

        Ok(Self {
            shared,
            queue,
            shutdown,
            workers: handles,
        })
    }

    pub fn conductor(&self) -> &str {
        &self.shared.conductor
    }

    /// Persists a new allocation and queues it for scheduling.
    ///
    /// Returns as soon as the allocation is stored, still `allocating`.
    #[instrument(skip(self, request), fields(resource_class = %request.resource_class))]
    pub async fn create_allocation(
        &self,
        request: AllocationRequest,
    ) -> Result<Allocation, DispatchError> {
        if let Some(name) = &request.name {
            validate_name(name)?;
        }

        let mut allocation = Allocation::new(request.resource_class);
        allocation.name = request.name;
        allocation.traits = request.traits;
        allocation.candidate_nodes = request.candidate_nodes;
        allocation.extra = request.extra;
        allocation.conductor_affinity = Some(self.shared.conductor.clone());

        self.shared.allocations.create_allocation(&allocation).await?;
        info!(allocation_id = %allocation.id, "Allocation created");

        if let Err(e) = self.enqueue(allocation.id).await {
            warn!(allocation_id = %allocation.id, error = %e, "Failed to queue allocation");
            allocation.mark_failed(e.to_string());
            if let Err(store_err) = self.shared.allocations.update_allocation(&allocation).await {
                error!(
                    allocation_id = %allocation.id,
                    error = %store_err,
                    "Failed to record allocation failure"
                );
            }
            return Err(e);
        }

        Ok(allocation)
    }

    pub async fn get_allocation(&self, id: AllocationId) -> Result<Allocation, DispatchError> {
        Ok(self.shared.allocations.get_allocation(id).await?)
    }

    /// Looks an allocation up by ID or, failing that, by name.
    pub async fn find_allocation(&self, ident: &str) -> Result<Allocation, DispatchError> {
        match AllocationId::parse(ident) {
            Ok(id) => self.get_allocation(id).await,
            Err(_) => Ok(self.shared.allocations.get_allocation_by_name(ident).await?),
        }
    }

    pub async fn list_allocations(
        &self,
        filter: &AllocationFilter,
    ) -> Result<Vec<Allocation>, DispatchError> {
        Ok(self.shared.allocations.list_allocations(filter).await?)
    }

    /// Deletes an allocation, unbinding its node first.
    ///
    /// Fails without changing anything while its node is provisioning or in
    /// active use. An allocation still being scheduled may be destroyed: the
    /// worker's commit then finds the record gone and unbinds the node.
    #[instrument(skip_all, fields(allocation_id = %id))]
    pub async fn destroy_allocation(&self, id: AllocationId) -> Result<(), DispatchError> {
        let allocation = self.shared.allocations.get_allocation(id).await?;

        let Some(node_id) = allocation.node_id else {
            self.shared.allocations.delete_allocation(id).await?;
            info!("Allocation destroyed");
            return Ok(());
        };

        let owner = LockOwner::new(format!("{}/destroy/{id}", self.shared.conductor));
        let retry = self.shared.config.scheduler.lock_retry();
        let mut lock = match self.shared.locks.acquire_with_retry(node_id, &owner, retry).await {
            Ok(lock) => lock,
            Err(LockError::NodeNotFound(_)) => {
                debug!(node_id = %node_id, "Bound node no longer exists");
                self.shared.allocations.delete_allocation(id).await?;
                info!("Allocation destroyed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let result = self.destroy_bound(&mut lock, &allocation).await;

        if let Err(e) = lock.release().await {
            warn!(node_id = %node_id, error = %e, "Failed to release node lock");
        }

        if result.is_ok() {
            info!(node_id = %node_id, "Allocation destroyed");
        }
        result
    }

    async fn destroy_bound(
        &self,
        lock: &mut NodeLock,
        allocation: &Allocation,
    ) -> Result<(), DispatchError> {
        let node = lock.node();

        if node.provision_state.is_transient() {
            return Err(DispatchError::InvalidState(format!(
                "cannot remove allocation {} since node {} is in transient state {}",
                allocation.id, node.id, node.provision_state
            )));
        }
        if node.provision_state == ProvisionState::Active && !node.maintenance {
            return Err(DispatchError::InvalidState(format!(
                "cannot remove allocation {} since node {} is active and not in maintenance",
                allocation.id, node.id
            )));
        }

        if node.allocation_id != Some(allocation.id) {
            debug!(node_id = %node.id, "Node is bound elsewhere, leaving it untouched");
            self.shared.allocations.delete_allocation(allocation.id).await?;
            return Ok(());
        }

        let association = node.association();
        lock.set_association(None).await?;

        if let Err(e) = self.shared.allocations.delete_allocation(allocation.id).await {
            if let Err(restore) = lock.set_association(association).await {
                error!(
                    node_id = %lock.node_id(),
                    error = %restore,
                    "Failed to restore node association after delete failed"
                );
            }
            return Err(e.into());
        }

        Ok(())
    }

    /// Re-queues every `allocating` allocation owned by this conductor.
    ///
    /// Waits for queue space rather than failing, so it is meant for
    /// startup, not request paths.
    #[instrument(skip(self), fields(conductor = %self.shared.conductor))]
    pub async fn resume_allocations(&self) -> Result<usize, DispatchError> {
        let filter = AllocationFilter {
            state: Some(AllocationState::Allocating),
            conductor_affinity: Some(self.shared.conductor.clone()),
        };
        let pending = self.shared.allocations.list_allocations(&filter).await?;

        let mut resumed = 0;
        for allocation in pending {
            if !self.shared.in_flight.lock().await.insert(allocation.id) {
                continue;
            }
            if self.queue.send(allocation.id).await.is_err() {
                self.shared.in_flight.lock().await.remove(&allocation.id);
                return Err(DispatchError::ShutDown);
            }
            debug!(allocation_id = %allocation.id, "Allocation resumed");
            resumed += 1;
        }

        if resumed > 0 {
            info!(count = resumed, "Resumed allocations");
        }
        Ok(resumed)
    }

    /// Signals the workers to stop and waits for them.
    ///
    /// Allocations still queued stay `allocating` and are picked up by
    /// [`resume_allocations`](Self::resume_allocations) on the next start.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Allocation worker panicked");
            }
        }
        info!("Dispatcher stopped");
    }

    async fn enqueue(&self, id: AllocationId) -> Result<(), DispatchError> {
        let mut in_flight = self.shared.in_flight.lock().await;
        if !in_flight.insert(id) {
            debug!(allocation_id = %id, "Allocation already queued");
            return Ok(());
        }

        match self.queue.try_send(id) {
            Ok(()) => Ok(()),
            Err(err) => {
                in_flight.remove(&id);
                match err {
                    mpsc::error::TrySendError::Full(_) => Err(DispatchError::NoFreeWorker),
                    mpsc::error::TrySendError::Closed(_) => Err(DispatchError::ShutDown),
                }
            }
        }
    }
}

/// One scheduler worker.
struct Worker {
    index: usize,
    shared: Arc<Shared>,
    queue: Arc<Mutex<mpsc::Receiver<AllocationId>>>,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = self.index, "Allocation worker started");

        loop {
            let next = tokio::select! {
                id = async { self.queue.lock().await.recv().await } => id,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let Some(id) = next else {
                break;
            };

            // Runs to completion: a held node lock is always committed or
            // released before shutdown is observed again.
            self.process(id).await;
        }

        debug!(worker = self.index, "Allocation worker shutting down");
    }

    #[instrument(skip_all, fields(worker = self.index, allocation_id = %id))]
    async fn process(&self, id: AllocationId) {
        match self.shared.allocations.get_allocation(id).await {
            Ok(allocation) => {
                self.shared.scheduler.allocate(allocation).await;
            }
            Err(e) if e.is_not_found() => {
                debug!("Allocation deleted before processing");
            }
            Err(e) => {
                error!(error = %e, "Failed to load allocation");
            }
        }

        self.shared.in_flight.lock().await.remove(&id);
    }
}

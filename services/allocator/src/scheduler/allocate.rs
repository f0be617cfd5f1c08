//! Allocation run: filter, shuffle, lock, re-check, commit.

use std::sync::Arc;
use std::time::Duration;

use bmfleet_id::NodeId;
use rand::seq::SliceRandom;
use tracing::{debug, error, info, instrument, warn};

use super::AllocationFailure;
use crate::filter::{CandidateFilter, Constraints};
use crate::lock::{LockError, LockOwner, NodeLock, NodeLocks, RetryPolicy};
use crate::model::{Allocation, AllocationState, Association};
use crate::store::{AllocationStore, NodeStore, StoreError};
use crate::validation::validate_constraints;

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Extra passes over contended candidates after the first one.
    pub node_locked_retry_attempts: u32,

    /// Pause before each extra pass.
    pub node_locked_retry_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_locked_retry_attempts: 3,
            node_locked_retry_interval: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    pub fn lock_retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.node_locked_retry_attempts,
            interval: self.node_locked_retry_interval,
        }
    }
}

/// What one pass over the candidates ended with.
enum PassOutcome {
    Allocated(NodeId),
    /// These nodes were locked by someone else and may be retried.
    Contended(Vec<NodeId>),
    /// Every candidate was locked and found ineligible, or vanished.
    FilteredOut,
}

/// Drives allocations to a terminal state.
pub struct Scheduler {
    conductor: String,
    config: SchedulerConfig,
    filter: CandidateFilter,
    locks: NodeLocks,
    allocations: Arc<dyn AllocationStore>,
}

impl Scheduler {
    /// Create a scheduler acting for `conductor`.
    pub fn new(
        conductor: impl Into<String>,
        config: SchedulerConfig,
        nodes: Arc<dyn NodeStore>,
        allocations: Arc<dyn AllocationStore>,
    ) -> Self {
        Self {
            conductor: conductor.into(),
            config,
            filter: CandidateFilter::new(nodes.clone()),
            locks: NodeLocks::new(nodes),
            allocations,
        }
    }

    /// Processes one allocation and persists its terminal state.
    ///
    /// Returns the allocation as last written. Allocations that are not in
    /// the `allocating` state are returned untouched.
    #[instrument(skip(self, allocation), fields(allocation_id = %allocation.id, resource_class = %allocation.resource_class))]
    pub async fn allocate(&self, mut allocation: Allocation) -> Allocation {
        if allocation.state != AllocationState::Allocating {
            warn!(state = %allocation.state, "Allocation already processed, skipping");
            return allocation;
        }

        match self.try_allocate(&mut allocation).await {
            Ok(node_id) => {
                info!(node_id = %node_id, "Node allocated");
            }
            Err(failure) => {
                error!(kind = ?failure.kind(), error = %failure, "Allocation failed");
                allocation.mark_failed(failure.to_string());
                match self.allocations.update_allocation(&allocation).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        info!("Allocation was deleted while being processed");
                    }
                    Err(e) => error!(error = %e, "Failed to record allocation failure"),
                }
            }
        }

        allocation
    }

    async fn try_allocate(&self, allocation: &mut Allocation) -> Result<NodeId, AllocationFailure> {
        let constraints = Constraints::from_allocation(allocation);
        validate_constraints(&constraints)?;

        let candidates = self.filter.candidates(&constraints).await?;
        if candidates.is_empty() {
            let resource_class = constraints.resource_class.clone();
            let traits = constraints.traits.clone();
            return Err(if constraints.has_candidate_list() {
                AllocationFailure::NoMatchingRequestedNodes {
                    resource_class,
                    traits,
                }
            } else {
                AllocationFailure::NoMatchingNodes {
                    resource_class,
                    traits,
                }
            });
        }

        let owner = LockOwner::for_allocation(&self.conductor, allocation.id);
        let candidate_count = candidates.len();
        let passes = self.config.lock_retry().total_attempts();
        let mut remaining = candidates;

        for pass in 1..=passes {
            if pass > 1 {
                debug!(
                    pass,
                    contended = remaining.len(),
                    delay_ms = self.config.node_locked_retry_interval.as_millis() as u64,
                    "Candidates locked, retrying"
                );
                tokio::time::sleep(self.config.node_locked_retry_interval).await;
            }

            remaining.shuffle(&mut rand::rng());

            match self
                .run_pass(allocation, &constraints, &owner, &remaining)
                .await?
            {
                PassOutcome::Allocated(node_id) => return Ok(node_id),
                PassOutcome::FilteredOut => return Err(AllocationFailure::AllFilteredOut),
                PassOutcome::Contended(contended) => remaining = contended,
            }
        }

        Err(AllocationFailure::ReservationExhausted {
            candidates: candidate_count,
        })
    }

    /// Tries every node in `candidates` once, in order.
    async fn run_pass(
        &self,
        allocation: &mut Allocation,
        constraints: &Constraints,
        owner: &LockOwner,
        candidates: &[NodeId],
    ) -> Result<PassOutcome, AllocationFailure> {
        let mut contended = Vec::new();

        for &node_id in candidates {
            let mut lock = match self.locks.acquire(node_id, owner).await {
                Ok(lock) => lock,
                Err(LockError::AlreadyLocked { holder, .. }) => {
                    debug!(node_id = %node_id, holder = %holder, "Node is locked, moving to the next one");
                    contended.push(node_id);
                    continue;
                }
                Err(LockError::Reentrant { .. }) => {
                    // A reservation left behind under our own token; treat
                    // it like any other holder until it is cleared.
                    warn!(node_id = %node_id, "Node already reserved under this allocation's token");
                    contended.push(node_id);
                    continue;
                }
                Err(LockError::NodeNotFound(_)) => {
                    debug!(node_id = %node_id, "Node was deleted, moving to the next one");
                    continue;
                }
                Err(LockError::Store(e)) => return Err(e.into()),
            };

            let committed = self.commit(&mut lock, allocation, constraints).await;

            if let Err(e) = lock.release().await {
                warn!(node_id = %node_id, error = %e, "Failed to release node lock");
            }

            if let Some(node_id) = committed? {
                return Ok(PassOutcome::Allocated(node_id));
            }
        }

        if contended.is_empty() {
            Ok(PassOutcome::FilteredOut)
        } else {
            Ok(PassOutcome::Contended(contended))
        }
    }

    /// Binds the locked node if it still matches. `Ok(None)` means the
    /// node was skipped.
    async fn commit(
        &self,
        lock: &mut NodeLock,
        allocation: &mut Allocation,
        constraints: &Constraints,
    ) -> Result<Option<NodeId>, AllocationFailure> {
        let node_id = lock.node_id();

        if let Err(mismatch) = constraints.check(lock.node()) {
            debug!(
                node_id = %node_id,
                reason = %mismatch,
                "Node no longer matches after locking, moving to the next one"
            );
            return Ok(None);
        }

        match lock
            .set_association(Some(Association::for_allocation(allocation.id)))
            .await
        {
            Ok(_) => {}
            Err(StoreError::NodeAssociated { instance_uuid, .. }) => {
                debug!(
                    node_id = %node_id,
                    instance_uuid = %instance_uuid,
                    "Node was associated concurrently, moving to the next one"
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let before = allocation.clone();
        allocation.mark_active(node_id);
        if let Err(e) = self.allocations.update_allocation(allocation).await {
            *allocation = before;
            if let Err(rollback) = lock.set_association(None).await {
                error!(
                    node_id = %node_id,
                    error = %rollback,
                    "Failed to clear node association after allocation update failed"
                );
            }
            return Err(e.into());
        }

        Ok(Some(node_id))
    }
}

//! Exclusive node locks.
//!
//! A lock is the node's `reservation` column set to the owner's token by a
//! compare-and-set in the store. Acquisition never waits: a lost race comes
//! back as [`LockError::AlreadyLocked`] and the caller decides whether to
//! retry. Re-acquiring a lock the same owner already holds is rejected with
//! [`LockError::Reentrant`].
//!
//! A [`NodeLock`] must be given back with [`NodeLock::release`]. If it is
//! dropped without a successful release (early return, panic, failed
//! release), the guard clears the reservation from a background task.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bmfleet_id::{AllocationId, NodeId};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::model::{Association, Node};
use crate::store::{NodeStore, StoreError, StoreResult};

/// Token identifying a lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockOwner(String);

impl LockOwner {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Owner token for work done on behalf of `allocation_id` by `conductor`.
    pub fn for_allocation(conductor: &str, allocation_id: AllocationId) -> Self {
        Self(format!("{conductor}/{allocation_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("node {node_id} is locked by {holder}")]
    AlreadyLocked { node_id: NodeId, holder: String },

    #[error("node {node_id} is already locked by {owner}; re-entrant locking is not supported")]
    Reentrant { node_id: NodeId, owner: String },

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error(transparent)]
    Store(StoreError),
}

/// Bounded retry for lock acquisition: `attempts` retries after the first
/// try, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn total_attempts(&self) -> u32 {
        self.attempts.saturating_add(1)
    }
}

/// Acquires and releases node locks.
#[derive(Clone)]
pub struct NodeLocks {
    nodes: Arc<dyn NodeStore>,
}

impl NodeLocks {
    pub fn new(nodes: Arc<dyn NodeStore>) -> Self {
        Self { nodes }
    }

    /// Tries once to lock `node_id` for `owner`.
    ///
    /// On success the returned guard carries the node as stored after the
    /// reservation was taken; callers must judge eligibility from that
    /// snapshot, not from anything read before.
    pub async fn acquire(&self, node_id: NodeId, owner: &LockOwner) -> Result<NodeLock, LockError> {
        match self.nodes.reserve_node(node_id, owner.as_str()).await {
            Ok(node) => {
                debug!(node_id = %node_id, owner = %owner, "Acquired node lock");
                Ok(NodeLock {
                    node,
                    owner: owner.clone(),
                    nodes: self.nodes.clone(),
                    released: false,
                })
            }
            Err(StoreError::NodeLocked { holder, .. }) if holder == owner.as_str() => {
                Err(LockError::Reentrant {
                    node_id,
                    owner: holder,
                })
            }
            Err(StoreError::NodeLocked { holder, .. }) => {
                Err(LockError::AlreadyLocked { node_id, holder })
            }
            Err(StoreError::NodeNotFound(id)) => Err(LockError::NodeNotFound(id)),
            Err(e) => Err(LockError::Store(e)),
        }
    }

    /// Like [`acquire`](Self::acquire), retrying only while the node is
    /// locked by someone else.
    pub async fn acquire_with_retry(
        &self,
        node_id: NodeId,
        owner: &LockOwner,
        policy: RetryPolicy,
    ) -> Result<NodeLock, LockError> {
        let mut attempt = 1;
        loop {
            match self.acquire(node_id, owner).await {
                Err(LockError::AlreadyLocked { holder, .. })
                    if attempt < policy.total_attempts() =>
                {
                    debug!(
                        node_id = %node_id,
                        holder = %holder,
                        attempt,
                        "Node locked, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(policy.interval).await;
                }
                result => return result,
            }
        }
    }

    /// Clears the reservation on `node_id` whoever holds it. Idempotent.
    pub async fn release(&self, node_id: NodeId) -> StoreResult<()> {
        self.nodes.release_node(node_id).await
    }
}

/// A held node lock.
pub struct NodeLock {
    node: Node,
    owner: LockOwner,
    nodes: Arc<dyn NodeStore>,
    released: bool,
}

impl NodeLock {
    /// The node as of the last write made under this lock.
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Writes or clears the node's association under this lock.
    pub async fn set_association(&mut self, association: Option<Association>) -> StoreResult<&Node> {
        self.node = self
            .nodes
            .set_association(self.node.id, self.owner.as_str(), association)
            .await?;
        Ok(&self.node)
    }

    /// Releases the lock.
    ///
    /// If the store rejects the release, the guard's drop retries it in the
    /// background.
    pub async fn release(mut self) -> StoreResult<()> {
        self.nodes.release_node(self.node.id).await?;
        self.released = true;
        debug!(node_id = %self.node.id, owner = %self.owner, "Released node lock");
        Ok(())
    }
}

impl fmt::Debug for NodeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeLock")
            .field("node_id", &self.node.id)
            .field("owner", &self.owner)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for NodeLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let node_id = self.node.id;
        warn!(node_id = %node_id, owner = %self.owner, "Node lock dropped while held, releasing");

        let nodes = self.nodes.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = nodes.release_node(node_id).await {
                        error!(node_id = %node_id, error = %e, "Failed to release node lock");
                    }
                });
            }
            Err(_) => {
                error!(node_id = %node_id, "No runtime to release node lock; reservation leaked");
            }
        }
    }
}

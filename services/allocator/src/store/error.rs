//! Store error types.

use bmfleet_id::{AllocationId, NodeId};
use thiserror::Error;
use uuid::Uuid;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from node and allocation stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// The reservation compare-and-set lost.
    #[error("node {node_id} is locked by {holder}")]
    NodeLocked { node_id: NodeId, holder: String },

    /// A write that requires the reservation was attempted without it.
    #[error("node {node_id} is not reserved by {owner}")]
    NotLocked { node_id: NodeId, owner: String },

    #[error("node {node_id} is already associated with instance {instance_uuid}")]
    NodeAssociated { node_id: NodeId, instance_uuid: Uuid },

    #[error("allocation {0} not found")]
    AllocationNotFound(String),

    #[error("allocation {0} already exists")]
    AllocationAlreadyExists(AllocationId),

    #[error("an allocation named {0} already exists")]
    AllocationDuplicateName(String),

    /// A persisted record could not be decoded.
    #[error("corrupt {table} record {id}: {message}")]
    Corrupt {
        table: &'static str,
        id: String,
        message: String,
    },

    /// The backing store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NodeNotFound(_) | StoreError::AllocationNotFound(_)
        )
    }
}

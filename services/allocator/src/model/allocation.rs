//! Allocation record and its state machine.

use bmfleet_id::{AllocationId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Allocation lifecycle state.
///
/// `Allocating` is the only non-terminal state. A worker moves an allocation
/// to `Active` or `Error` exactly once; terminal allocations are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    Allocating,
    Active,
    Error,
}

impl AllocationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allocating => "allocating",
            Self::Active => "active",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "allocating" => Some(Self::Allocating),
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Allocating)
    }
}

impl std::fmt::Display for AllocationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to bind one node matching the given constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub name: Option<String>,
    pub state: AllocationState,
    pub resource_class: String,
    /// Required traits, in the order they were requested.
    pub traits: Vec<String>,
    /// When non-empty, only these nodes are eligible.
    pub candidate_nodes: Vec<NodeId>,
    pub node_id: Option<NodeId>,
    pub last_error: Option<String>,
    /// Conductor whose worker pool processes this allocation.
    pub conductor_affinity: Option<String>,
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Allocation {
    /// Creates a new allocation in the `allocating` state.
    pub fn new(resource_class: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: AllocationId::new(),
            name: None,
            state: AllocationState::Allocating,
            resource_class: resource_class.into(),
            traits: Vec::new(),
            candidate_nodes: Vec::new(),
            node_id: None,
            last_error: None,
            conductor_affinity: None,
            extra: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Records a successful binding to `node_id`.
    pub fn mark_active(&mut self, node_id: NodeId) {
        self.state = AllocationState::Active;
        self.node_id = Some(node_id);
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    /// Records a terminal failure.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.state = AllocationState::Error;
        self.node_id = None;
        self.last_error = Some(reason.into());
        self.updated_at = Utc::now();
    }
}

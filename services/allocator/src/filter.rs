//! Candidate filtering.
//!
//! [`Constraints`] is the eligibility predicate derived from an allocation.
//! It is evaluated twice: coarsely by the store when listing candidates
//! (no lock held, so the answer can go stale), and again by the scheduler
//! against the node snapshot returned by a successful reservation.

use std::sync::Arc;

use bmfleet_id::NodeId;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::model::{Allocation, Node, PowerState, ProvisionState};
use crate::store::{NodeFilter, NodeStore, StoreResult};

/// Why a node does not satisfy an allocation's constraints.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Mismatch {
    #[error("resource class is {actual:?}, expected {expected}")]
    ResourceClass {
        expected: String,
        actual: Option<String>,
    },

    #[error("provision state is {0}")]
    ProvisionState(ProvisionState),

    #[error("node is in maintenance")]
    Maintenance,

    #[error("power state is unknown")]
    PowerUnknown,

    #[error("node is associated with instance {0}")]
    Associated(Uuid),

    #[error("missing traits {0:?}")]
    MissingTraits(Vec<String>),

    #[error("node is not one of the requested candidates")]
    NotACandidate,
}

/// Node requirements of one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraints {
    pub resource_class: String,
    pub traits: Vec<String>,
    /// Empty means any node may be used.
    pub candidate_nodes: Vec<NodeId>,
}

impl Constraints {
    pub fn from_allocation(allocation: &Allocation) -> Self {
        Self {
            resource_class: allocation.resource_class.clone(),
            traits: allocation.traits.clone(),
            candidate_nodes: allocation.candidate_nodes.clone(),
        }
    }

    pub fn has_candidate_list(&self) -> bool {
        !self.candidate_nodes.is_empty()
    }

    /// The store-level query for this predicate.
    pub fn node_filter(&self) -> NodeFilter {
        NodeFilter {
            resource_class: Some(self.resource_class.clone()),
            provision_state: Some(ProvisionState::Available),
            maintenance: Some(false),
            associated: Some(false),
            require_known_power: true,
            traits: self.traits.clone(),
            ids: self
                .has_candidate_list()
                .then(|| self.candidate_nodes.clone()),
        }
    }

    /// Checks every eligibility rule against `node`, reporting the first
    /// one that fails.
    pub fn check(&self, node: &Node) -> Result<(), Mismatch> {
        if node.resource_class.as_deref() != Some(self.resource_class.as_str()) {
            return Err(Mismatch::ResourceClass {
                expected: self.resource_class.clone(),
                actual: node.resource_class.clone(),
            });
        }
        if node.provision_state != ProvisionState::Available {
            return Err(Mismatch::ProvisionState(node.provision_state));
        }
        if node.maintenance {
            return Err(Mismatch::Maintenance);
        }
        if node.power_state == PowerState::Unknown {
            return Err(Mismatch::PowerUnknown);
        }
        if let Some(instance_uuid) = node.instance_uuid {
            return Err(Mismatch::Associated(instance_uuid));
        }
        let missing: Vec<String> = self
            .traits
            .iter()
            .filter(|t| !node.traits.contains(*t))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(Mismatch::MissingTraits(missing));
        }
        if self.has_candidate_list() && !self.candidate_nodes.contains(&node.id) {
            return Err(Mismatch::NotACandidate);
        }
        Ok(())
    }
}

/// Produces the candidate set for an allocation from the inventory.
#[derive(Clone)]
pub struct CandidateFilter {
    nodes: Arc<dyn NodeStore>,
}

impl CandidateFilter {
    pub fn new(nodes: Arc<dyn NodeStore>) -> Self {
        Self { nodes }
    }

    /// Returns the IDs of nodes that satisfy `constraints` right now.
    ///
    /// Reserved nodes are included: a held lock is contention, not
    /// ineligibility.
    #[instrument(skip(self, constraints), fields(resource_class = %constraints.resource_class))]
    pub async fn candidates(&self, constraints: &Constraints) -> StoreResult<Vec<NodeId>> {
        let nodes = self.nodes.list_nodes(&constraints.node_filter()).await?;
        let candidates: Vec<NodeId> = nodes
            .iter()
            .filter(|node| match constraints.check(node) {
                Ok(()) => true,
                Err(mismatch) => {
                    debug!(node_id = %node.id, reason = %mismatch, "Dropping listed node");
                    false
                }
            })
            .map(|node| node.id)
            .collect();
        debug!(count = candidates.len(), "Candidate nodes found");
        Ok(candidates)
    }
}

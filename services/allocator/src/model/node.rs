//! Node inventory record.

use std::collections::BTreeSet;

use bmfleet_id::{AllocationId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Last known power state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
    /// Never synced or unreachable; such nodes are never allocated.
    Unknown,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Provisioning lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Enroll,
    Verifying,
    Manageable,
    Inspecting,
    InspectWait,
    InspectFailed,
    Cleaning,
    CleanWait,
    CleanFailed,
    /// The only state in which a node can be allocated.
    Available,
    Deploying,
    DeployWait,
    DeployFailed,
    Active,
    Deleting,
    Error,
    Rescuing,
    Rescue,
    RescueFailed,
    Unrescuing,
}

impl ProvisionState {
    const ALL: [ProvisionState; 20] = [
        Self::Enroll,
        Self::Verifying,
        Self::Manageable,
        Self::Inspecting,
        Self::InspectWait,
        Self::InspectFailed,
        Self::Cleaning,
        Self::CleanWait,
        Self::CleanFailed,
        Self::Available,
        Self::Deploying,
        Self::DeployWait,
        Self::DeployFailed,
        Self::Active,
        Self::Deleting,
        Self::Error,
        Self::Rescuing,
        Self::Rescue,
        Self::RescueFailed,
        Self::Unrescuing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enroll => "enroll",
            Self::Verifying => "verifying",
            Self::Manageable => "manageable",
            Self::Inspecting => "inspecting",
            Self::InspectWait => "inspect_wait",
            Self::InspectFailed => "inspect_failed",
            Self::Cleaning => "cleaning",
            Self::CleanWait => "clean_wait",
            Self::CleanFailed => "clean_failed",
            Self::Available => "available",
            Self::Deploying => "deploying",
            Self::DeployWait => "deploy_wait",
            Self::DeployFailed => "deploy_failed",
            Self::Active => "active",
            Self::Deleting => "deleting",
            Self::Error => "error",
            Self::Rescuing => "rescuing",
            Self::Rescue => "rescue",
            Self::RescueFailed => "rescue_failed",
            Self::Unrescuing => "unrescuing",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    /// Returns true while a provisioning operation is in flight.
    ///
    /// Failure states count as stable: nothing is running on the node and an
    /// operator has to act on it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Verifying
                | Self::Inspecting
                | Self::InspectWait
                | Self::Cleaning
                | Self::CleanWait
                | Self::Deploying
                | Self::DeployWait
                | Self::Deleting
                | Self::Rescuing
                | Self::Unrescuing
        )
    }
}

impl std::fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binding of a node to the allocation that owns it.
///
/// `instance_uuid` and `allocation_id` are always written together; the
/// instance UUID is the raw UUID of the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Association {
    pub instance_uuid: Uuid,
    pub allocation_id: AllocationId,
}

impl Association {
    pub fn for_allocation(allocation_id: AllocationId) -> Self {
        Self {
            instance_uuid: allocation_id.uuid(),
            allocation_id,
        }
    }
}

/// A physical machine in the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: Option<String>,
    /// Nodes without a resource class never match an allocation.
    pub resource_class: Option<String>,
    pub power_state: PowerState,
    pub provision_state: ProvisionState,
    pub maintenance: bool,
    pub traits: BTreeSet<String>,
    pub instance_uuid: Option<Uuid>,
    pub allocation_id: Option<AllocationId>,
    /// Owner token of the current lock holder, if any.
    pub reservation: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// A freshly enrolled node: no resource class, unknown power, unlocked.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            name: None,
            resource_class: None,
            power_state: PowerState::Unknown,
            provision_state: ProvisionState::Enroll,
            maintenance: false,
            traits: BTreeSet::new(),
            instance_uuid: None,
            allocation_id: None,
            reservation: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_associated(&self) -> bool {
        self.instance_uuid.is_some()
    }

    /// Returns the association if the node is bound to an allocation.
    ///
    /// Nodes associated with an instance from outside the allocation
    /// engine have an `instance_uuid` but no `allocation_id` and yield `None`.
    pub fn association(&self) -> Option<Association> {
        match (self.instance_uuid, self.allocation_id) {
            (Some(instance_uuid), Some(allocation_id)) => Some(Association {
                instance_uuid,
                allocation_id,
            }),
            _ => None,
        }
    }

    pub fn set_association(&mut self, association: Option<Association>) {
        self.instance_uuid = association.map(|a| a.instance_uuid);
        self.allocation_id = association.map(|a| a.allocation_id);
    }
}

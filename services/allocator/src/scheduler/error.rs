//! Allocation failure reasons.

use thiserror::Error;

use crate::store::StoreError;
use crate::validation::InvalidParameter;

/// Classification of an allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Malformed or contradictory parameters; no node was queried.
    InvalidParameters,
    /// No node matches the resource class and traits.
    NoMatchingNodes,
    /// A candidate list was given and none of its nodes match.
    NoMatchingRequestedNodes,
    /// Every candidate that could be locked no longer matched once locked.
    AllFilteredOut,
    /// Candidates stayed locked by others through every retry pass.
    ReservationExhausted,
    /// The node or allocation store failed.
    Store,
}

/// Terminal failure of one allocation. The `Display` text is what gets
/// recorded in `last_error`.
#[derive(Debug, Error)]
pub enum AllocationFailure {
    #[error("invalid allocation parameters: {0}")]
    InvalidParameters(#[from] InvalidParameter),

    #[error(
        "no available nodes match the resource class {resource_class}{}",
        traits_suffix(.traits)
    )]
    NoMatchingNodes {
        resource_class: String,
        traits: Vec<String>,
    },

    #[error(
        "none of the requested nodes are available and match the resource class {resource_class}{}",
        traits_suffix(.traits)
    )]
    NoMatchingRequestedNodes {
        resource_class: String,
        traits: Vec<String>,
    },

    #[error("all nodes were filtered out during reservation")]
    AllFilteredOut,

    #[error("could not reserve any of {candidates} candidate nodes")]
    ReservationExhausted { candidates: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn traits_suffix(traits: &[String]) -> String {
    if traits.is_empty() {
        String::new()
    } else {
        format!(" and traits {}", traits.join(", "))
    }
}

impl AllocationFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidParameters(_) => FailureKind::InvalidParameters,
            Self::NoMatchingNodes { .. } => FailureKind::NoMatchingNodes,
            Self::NoMatchingRequestedNodes { .. } => FailureKind::NoMatchingRequestedNodes,
            Self::AllFilteredOut => FailureKind::AllFilteredOut,
            Self::ReservationExhausted { .. } => FailureKind::ReservationExhausted,
            Self::Store(_) => FailureKind::Store,
        }
    }
}

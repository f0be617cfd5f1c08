//! Stateless checks on allocation parameters.
//!
//! These run before any inventory query. A violation is a parameter error:
//! the allocation fails without touching a single node.

use std::collections::HashSet;

use thiserror::Error;
use uuid::Uuid;

use crate::filter::Constraints;

/// Longest accepted resource class name.
pub const MAX_RESOURCE_CLASS_LEN: usize = 80;

/// Largest number of traits one allocation may require.
pub const MAX_TRAITS: usize = 50;

/// Longest accepted trait name.
pub const MAX_TRAIT_LEN: usize = 255;

/// Longest accepted allocation name.
pub const MAX_NAME_LEN: usize = 255;

/// A malformed or self-contradictory allocation parameter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidParameter {
    #[error("resource class must be 1 to 80 characters")]
    ResourceClassLength,

    #[error("at most 50 traits may be requested, got {0}")]
    TooManyTraits(usize),

    #[error("invalid trait '{0}': traits are 1 to 255 characters of A-Z, 0-9 and _")]
    MalformedTrait(String),

    #[error("trait {0} is requested more than once")]
    DuplicateTrait(String),

    #[error("candidate node {0} is listed more than once")]
    DuplicateCandidate(String),

    #[error("invalid allocation name '{0}': names are 1 to 255 characters of A-Z, a-z, 0-9, '-', '.', '_' and '~'")]
    MalformedName(String),

    #[error("allocation name '{0}' looks like a UUID")]
    NameIsUuid(String),
}

fn is_valid_trait(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_TRAIT_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

/// Checks the node requirements of an allocation.
pub fn validate_constraints(constraints: &Constraints) -> Result<(), InvalidParameter> {
    let rc_len = constraints.resource_class.chars().count();
    if rc_len == 0 || rc_len > MAX_RESOURCE_CLASS_LEN {
        return Err(InvalidParameter::ResourceClassLength);
    }

    if constraints.traits.len() > MAX_TRAITS {
        return Err(InvalidParameter::TooManyTraits(constraints.traits.len()));
    }
    let mut seen = HashSet::new();
    for name in &constraints.traits {
        if !is_valid_trait(name) {
            return Err(InvalidParameter::MalformedTrait(name.clone()));
        }
        if !seen.insert(name.as_str()) {
            return Err(InvalidParameter::DuplicateTrait(name.clone()));
        }
    }

    let mut seen = HashSet::new();
    for node_id in &constraints.candidate_nodes {
        if !seen.insert(*node_id) {
            return Err(InvalidParameter::DuplicateCandidate(node_id.to_string()));
        }
    }

    Ok(())
}

/// Checks a user-chosen allocation name.
///
/// Names share a lookup namespace with IDs, so a name that parses as a UUID
/// is refused.
pub fn validate_name(name: &str) -> Result<(), InvalidParameter> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'));
    if !valid {
        return Err(InvalidParameter::MalformedName(name.to_string()));
    }
    if Uuid::try_parse(name).is_ok() {
        return Err(InvalidParameter::NameIsUuid(name.to_string()));
    }
    Ok(())
}

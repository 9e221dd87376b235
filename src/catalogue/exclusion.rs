use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalogue::FunctionCandidate;

/// Tag shared by functions implementing mutually incompatible methodologies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExclusionGroupId(String);

impl ExclusionGroupId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExclusionGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExclusionGroupId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Assignment of functions to exclusion groups.
///
/// Explicit assignments take precedence over the group a function declares
/// itself.
#[derive(Debug, Clone, Default)]
pub struct ExclusionGroups {
    assigned: BTreeMap<String, ExclusionGroupId>,
}

impl ExclusionGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(mut self, function_id: impl Into<String>, group: impl Into<ExclusionGroupId>) -> Self {
        self.assigned.insert(function_id.into(), group.into());
        self
    }

    pub fn group_of(&self, candidate: &FunctionCandidate) -> Option<ExclusionGroupId> {
        match self.assigned.get(candidate.id()) {
            Some(group) => Some(group.clone()),
            None => candidate.function().exclusion_group(),
        }
    }

    /// Whether the candidate belongs to one of the `committed` groups.
    pub fn collides(
        &self,
        candidate: &FunctionCandidate,
        committed: &BTreeSet<ExclusionGroupId>,
    ) -> bool {
        self.group_of(candidate)
            .is_some_and(|group| committed.contains(&group))
    }
}

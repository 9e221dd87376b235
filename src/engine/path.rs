use std::sync::Arc;

use crate::catalogue::ExclusionGroupId;
use crate::value::ValueRequirement;

struct Frame {
    requirement: ValueRequirement,
    group: Option<ExclusionGroupId>,
    depth: usize,
    parent: Option<Arc<Frame>>,
}

/// The branch from a top-level requirement down to the requirement being
/// resolved: each frame is a requirement whose inputs are being resolved,
/// with the exclusion group of the function chosen for it.
///
/// Persistent: pushing allocates one frame and shares the rest, so sibling
/// branches never observe each other.
#[derive(Clone, Default)]
pub(crate) struct ResolutionPath {
    head: Option<Arc<Frame>>,
}

impl ResolutionPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, requirement: &ValueRequirement, group: Option<ExclusionGroupId>) -> Self {
        let frame = Frame {
            requirement: requirement.clone(),
            group,
            depth: self.len() + 1,
            parent: self.head.clone(),
        };
        Self {
            head: Some(Arc::new(frame)),
        }
    }

    /// Number of frames; frame depths run from 1 (outermost) to `len`.
    pub fn len(&self) -> usize {
        self.head.as_ref().map_or(0, |frame| frame.depth)
    }

    fn frames(&self) -> impl Iterator<Item = &Frame> {
        std::iter::successors(self.head.as_deref(), |frame| frame.parent.as_deref())
    }

    /// Depth of the outermost frame resolving exactly `requirement`.
    pub fn cycle_depth(&self, requirement: &ValueRequirement) -> Option<usize> {
        self.frames()
            .filter(|frame| &frame.requirement == requirement)
            .map(|frame| frame.depth)
            .last()
    }

    /// Depth of the outermost frame that committed `group`.
    pub fn group_depth(&self, group: &ExclusionGroupId) -> Option<usize> {
        self.frames()
            .filter(|frame| frame.group.as_ref() == Some(group))
            .map(|frame| frame.depth)
            .last()
    }

    pub fn contains(&self, requirement: &ValueRequirement) -> bool {
        self.frames().any(|frame| &frame.requirement == requirement)
    }

    pub fn has_group(&self, group: &ExclusionGroupId) -> bool {
        self.frames().any(|frame| frame.group.as_ref() == Some(group))
    }
}

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalogue::FunctionCandidate;

/// Coarse precedence bucket. A higher class always precedes a lower one,
/// whatever the fine-grained comparator says.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PriorityClass {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
}

type TieBreak = dyn Fn(&FunctionCandidate, &FunctionCandidate) -> Ordering + Send + Sync;

/// Total order over candidates: priority class first (highest first), then
/// an injectable comparator within a class.
///
/// There is no built-in comparator. Two candidates that compare `Equal` are
/// a tie, and the ambiguity checker reports ties whose outputs can be told
/// apart.
#[derive(Clone, Default)]
pub struct PriorityOrdering {
    overrides: BTreeMap<String, PriorityClass>,
    tie_break: Option<Arc<TieBreak>>,
}

impl PriorityOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places the function `id` in `class` regardless of what it declares.
    pub fn with_class_override(mut self, id: impl Into<String>, class: PriorityClass) -> Self {
        self.overrides.insert(id.into(), class);
        self
    }

    /// Comparator applied between candidates of the same class. `Less`
    /// means the first argument is preferred.
    pub fn with_tie_break<F>(mut self, tie_break: F) -> Self
    where
        F: Fn(&FunctionCandidate, &FunctionCandidate) -> Ordering + Send + Sync + 'static,
    {
        self.tie_break = Some(Arc::new(tie_break));
        self
    }

    pub fn class_of(&self, candidate: &FunctionCandidate) -> PriorityClass {
        self.overrides
            .get(candidate.id())
            .copied()
            .unwrap_or_else(|| candidate.priority())
    }

    /// `Less` when `a` should be tried before `b`.
    pub fn compare(&self, a: &FunctionCandidate, b: &FunctionCandidate) -> Ordering {
        self.class_of(b)
            .cmp(&self.class_of(a))
            .then_with(|| match &self.tie_break {
                Some(tie_break) => tie_break(a, b),
                None => Ordering::Equal,
            })
    }

    pub fn is_tie(&self, a: &FunctionCandidate, b: &FunctionCandidate) -> bool {
        self.compare(a, b) == Ordering::Equal
    }

    /// Stable sort, so full ties keep their registration order.
    pub fn sort(&self, candidates: &mut [FunctionCandidate]) {
        candidates.sort_by(|a, b| self.compare(a, b));
    }
}

impl fmt::Debug for PriorityOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityOrdering")
            .field("overrides", &self.overrides)
            .field("tie_break", &self.tie_break.is_some())
            .finish()
    }
}

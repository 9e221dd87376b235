//! The function catalogue: producer capabilities, the repository they are
//! registered in, and the per-window compiled index the resolver queries.

mod cache;
mod exclusion;
mod priority;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CandidateError, CatalogueError};
use crate::utils::as_overhead;
use crate::value::{TargetSpecification, TargetType, ValueRequirement, ValueSpecification};

pub use cache::CatalogueCache;
pub use exclusion::{ExclusionGroupId, ExclusionGroups};
pub use priority::{PriorityClass, PriorityOrdering};

/// Resolved inputs handed to [`Function::results`]: each requirement the
/// function asked for, with the specification chosen to satisfy it.
pub type ResolvedInputs = BTreeMap<ValueRequirement, ValueSpecification>;

/// A producer capability.
///
/// Implementations are metadata only: the engine never executes a function,
/// it asks what the function needs and what it would produce.
pub trait Function: Send + Sync {
    /// Unique within a repository.
    fn id(&self) -> &str;

    fn target_type(&self) -> TargetType;

    fn priority(&self) -> PriorityClass {
        PriorityClass::Normal
    }

    fn exclusion_group(&self) -> Option<ExclusionGroupId> {
        None
    }

    /// Whether the function is available in the given valuation window.
    fn is_valid_for(&self, _window: ValuationWindow) -> bool {
        true
    }

    /// Cheap applicability check, called before anything else.
    fn can_apply(&self, _target: &TargetSpecification) -> bool {
        true
    }

    /// The outputs the function advertises on `target`. Properties may be
    /// wildcards until [`results`](Self::results) narrows them.
    fn outputs(&self, target: &TargetSpecification) -> BTreeSet<ValueSpecification>;

    /// Inputs needed to produce `desired`. `Ok(None)` declines the
    /// requirement.
    fn requirements(
        &self,
        target: &TargetSpecification,
        desired: &ValueRequirement,
    ) -> anyhow::Result<Option<BTreeSet<ValueRequirement>>>;

    /// The outputs the function produces once its inputs are known.
    fn results(
        &self,
        target: &TargetSpecification,
        inputs: &ResolvedInputs,
    ) -> anyhow::Result<BTreeSet<ValueSpecification>>;

    /// Further inputs requested once the outputs are known.
    fn additional_requirements(
        &self,
        _target: &TargetSpecification,
        _inputs: &ResolvedInputs,
        _outputs: &BTreeSet<ValueSpecification>,
    ) -> anyhow::Result<BTreeSet<ValueRequirement>> {
        Ok(BTreeSet::new())
    }
}

/// Source of the functions a catalogue is compiled from.
pub trait FunctionRepository: Send + Sync {
    /// Every registered function, in registration order.
    fn functions(&self) -> Vec<Arc<dyn Function>>;
}

#[derive(Default, Clone)]
pub struct InMemoryRepository {
    functions: Vec<Arc<dyn Function>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F: Function + 'static>(mut self, function: F) -> Self {
        self.functions.push(Arc::new(function));
        self
    }

    pub fn register(&mut self, function: Arc<dyn Function>) {
        self.functions.push(function);
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl FunctionRepository for InMemoryRepository {
    fn functions(&self) -> Vec<Arc<dyn Function>> {
        self.functions.clone()
    }
}

/// One calendar day (UTC). A compiled catalogue serves every valuation time
/// inside its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValuationWindow(NaiveDate);

impl ValuationWindow {
    pub fn containing(time: DateTime<Utc>) -> Self {
        Self(time.date_naive())
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for ValuationWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A function bound into a compiled catalogue.
#[derive(Clone)]
pub struct FunctionCandidate {
    function: Arc<dyn Function>,
    ordinal: usize,
}

impl FunctionCandidate {
    pub(crate) fn new(function: Arc<dyn Function>, ordinal: usize) -> Self {
        Self { function, ordinal }
    }

    pub fn id(&self) -> &str {
        self.function.id()
    }

    pub fn priority(&self) -> PriorityClass {
        self.function.priority()
    }

    /// Position in the repository's registration order.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn function(&self) -> &Arc<dyn Function> {
        &self.function
    }

    pub(crate) fn requirements(
        &self,
        target: &TargetSpecification,
        desired: &ValueRequirement,
    ) -> Result<Option<BTreeSet<ValueRequirement>>, CandidateError> {
        guarded(|| self.function.requirements(target, desired))
    }

    pub(crate) fn results(
        &self,
        target: &TargetSpecification,
        inputs: &ResolvedInputs,
    ) -> Result<BTreeSet<ValueSpecification>, CandidateError> {
        guarded(|| self.function.results(target, inputs))
    }

    pub(crate) fn additional_requirements(
        &self,
        target: &TargetSpecification,
        inputs: &ResolvedInputs,
        outputs: &BTreeSet<ValueSpecification>,
    ) -> Result<BTreeSet<ValueRequirement>, CandidateError> {
        guarded(|| self.function.additional_requirements(target, inputs, outputs))
    }
}

impl fmt::Debug for FunctionCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionCandidate")
            .field("id", &self.id())
            .field("priority", &self.priority())
            .field("ordinal", &self.ordinal)
            .finish()
    }
}

/// Runs a metadata call, turning a panic into an error like any other.
fn guarded<T>(call: impl FnOnce() -> anyhow::Result<T>) -> Result<T, CandidateError> {
    // The function only sees shared references to immutable values, nothing
    // it could leave half-updated.
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result.map_err(CandidateError::from),
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Function panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Function panicked: {s}")
            } else {
                String::from("Function panicked with unknown payload")
            };

            Err(CandidateError::from(anyhow::anyhow!(msg)))
        }
    }
}

/// Index of the functions valid in one window, grouped by target type and
/// pre-sorted by priority.
pub struct CompiledCatalogue {
    window: ValuationWindow,
    functions: Vec<FunctionCandidate>,
    by_type: HashMap<TargetType, Vec<FunctionCandidate>>,
}

impl CompiledCatalogue {
    pub fn compile(
        repository: &dyn FunctionRepository,
        window: ValuationWindow,
        ordering: &PriorityOrdering,
    ) -> Result<Self, CatalogueError> {
        let s = Instant::now();

        let mut seen = HashSet::new();
        let mut functions = Vec::new();

        for (ordinal, function) in repository.functions().into_iter().enumerate() {
            let id = function.id();
            if id.is_empty() {
                return Err(CatalogueError::EmptyFunctionId);
            }
            if !seen.insert(id.to_string()) {
                return Err(CatalogueError::DuplicateFunction(id.to_string()));
            }
            if !function.is_valid_for(window) {
                tracing::debug!("Function {id} is not valid in window {window}");
                continue;
            }
            functions.push(FunctionCandidate::new(function, ordinal));
        }

        let mut by_type: HashMap<TargetType, Vec<FunctionCandidate>> = HashMap::new();
        for candidate in &functions {
            by_type
                .entry(candidate.function.target_type())
                .or_default()
                .push(candidate.clone());
        }
        for candidates in by_type.values_mut() {
            ordering.sort(candidates);
        }

        tracing::info!(
            "Compiled {} functions for window {window} {}",
            functions.len(),
            as_overhead(s)
        );

        Ok(Self {
            window,
            functions,
            by_type,
        })
    }

    pub fn window(&self) -> ValuationWindow {
        self.window
    }

    /// Every function valid in the window, in registration order.
    pub fn functions(&self) -> &[FunctionCandidate] {
        &self.functions
    }

    pub fn can_apply(&self, candidate: &FunctionCandidate, target: &TargetSpecification) -> bool {
        candidate.function.target_type() == target.target_type()
            && candidate.function.can_apply(target)
    }

    /// Candidates that advertise an output able to satisfy `requirement`, in
    /// priority order. The order is a pure function of the catalogue and the
    /// requirement.
    pub fn candidates_for(&self, requirement: &ValueRequirement) -> Vec<FunctionCandidate> {
        let target = requirement.target();
        let Some(candidates) = self.by_type.get(&target.target_type()) else {
            return Vec::new();
        };

        let matching = requirement.for_matching();
        candidates
            .iter()
            .filter(|candidate| requirement.allows_function(candidate.id()))
            .filter(|candidate| self.can_apply(candidate, target))
            .filter(|candidate| {
                candidate
                    .function
                    .outputs(target)
                    .iter()
                    .any(|output| output.satisfies(&matching))
            })
            .cloned()
            .collect()
    }
}

impl fmt::Debug for CompiledCatalogue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledCatalogue")
            .field("window", &self.window)
            .field("functions", &self.functions)
            .finish()
    }
}

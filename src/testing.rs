//! Fixtures shared by the unit tests.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};

use crate::catalogue::{
    ExclusionGroupId, Function, FunctionCandidate, PriorityClass, ResolvedInputs, ValuationWindow,
};
use crate::value::{PropertySet, TargetSpecification, TargetType, ValueRequirement, ValueSpecification};

type RequirementsFn = dyn Fn(&TargetSpecification, &ValueRequirement) -> anyhow::Result<Option<BTreeSet<ValueRequirement>>>
    + Send
    + Sync;
type ResultsFn =
    dyn Fn(&TargetSpecification, &ResolvedInputs) -> anyhow::Result<BTreeSet<ValueSpecification>> + Send + Sync;
type AdditionalFn = dyn Fn(
        &TargetSpecification,
        &ResolvedInputs,
        &BTreeSet<ValueSpecification>,
    ) -> anyhow::Result<BTreeSet<ValueRequirement>>
    + Send
    + Sync;

/// A configurable [`Function`].
///
/// By default it advertises its declared outputs on any target of its type,
/// needs its declared inputs on the same target, and produces exactly what
/// it advertises.
#[derive(Clone)]
pub(crate) struct MockFunction {
    id: String,
    target_type: TargetType,
    priority: PriorityClass,
    group: Option<ExclusionGroupId>,
    outputs: Vec<(String, PropertySet)>,
    inputs: Vec<(String, Option<TargetSpecification>)>,
    applies_to: Option<Arc<dyn Fn(&TargetSpecification) -> bool + Send + Sync>>,
    valid_until: Option<ValuationWindow>,
    requirements: Option<Arc<RequirementsFn>>,
    results: Option<Arc<ResultsFn>>,
    additional: Option<Arc<AdditionalFn>>,
}

impl MockFunction {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            target_type: TargetType::Security,
            priority: PriorityClass::Normal,
            group: None,
            outputs: Vec::new(),
            inputs: Vec::new(),
            applies_to: None,
            valid_until: None,
            requirements: None,
            results: None,
            additional: None,
        }
    }

    pub fn priority(mut self, priority: PriorityClass) -> Self {
        self.priority = priority;
        self
    }

    pub fn group(mut self, group: &str) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn target_type(mut self, target_type: TargetType) -> Self {
        self.target_type = target_type;
        self
    }

    pub fn produces(self, value_name: &str) -> Self {
        self.produces_with(value_name, PropertySet::new())
    }

    pub fn produces_with(mut self, value_name: &str, properties: PropertySet) -> Self {
        self.outputs.push((value_name.to_string(), properties));
        self
    }

    /// Needs `value_name` on the target it is applied to.
    pub fn needs(mut self, value_name: &str) -> Self {
        self.inputs.push((value_name.to_string(), None));
        self
    }

    /// Needs `value_name` on a fixed target.
    pub fn needs_on(mut self, value_name: &str, target: TargetSpecification) -> Self {
        self.inputs.push((value_name.to_string(), Some(target)));
        self
    }

    pub fn applies_to<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TargetSpecification) -> bool + Send + Sync + 'static,
    {
        self.applies_to = Some(Arc::new(predicate));
        self
    }

    /// Valid in every window up to and including `window`.
    pub fn valid_until(mut self, window: ValuationWindow) -> Self {
        self.valid_until = Some(window);
        self
    }

    pub fn requirements_with<F>(mut self, requirements: F) -> Self
    where
        F: Fn(&TargetSpecification, &ValueRequirement) -> anyhow::Result<Option<BTreeSet<ValueRequirement>>>
            + Send
            + Sync
            + 'static,
    {
        self.requirements = Some(Arc::new(requirements));
        self
    }

    pub fn results_with<F>(mut self, results: F) -> Self
    where
        F: Fn(&TargetSpecification, &ResolvedInputs) -> anyhow::Result<BTreeSet<ValueSpecification>>
            + Send
            + Sync
            + 'static,
    {
        self.results = Some(Arc::new(results));
        self
    }

    pub fn additional_with<F>(mut self, additional: F) -> Self
    where
        F: Fn(
                &TargetSpecification,
                &ResolvedInputs,
                &BTreeSet<ValueSpecification>,
            ) -> anyhow::Result<BTreeSet<ValueRequirement>>
            + Send
            + Sync
            + 'static,
    {
        self.additional = Some(Arc::new(additional));
        self
    }

    /// Every `requirements` call fails with `message`.
    pub fn fails(self, message: &'static str) -> Self {
        self.requirements_with(move |_, _| Err(anyhow::anyhow!(message)))
    }

    fn declared_inputs(&self, target: &TargetSpecification) -> BTreeSet<ValueRequirement> {
        self.inputs
            .iter()
            .map(|(name, on)| ValueRequirement::new(name, on.clone().unwrap_or_else(|| target.clone())))
            .collect()
    }
}

impl Function for MockFunction {
    fn id(&self) -> &str {
        &self.id
    }

    fn target_type(&self) -> TargetType {
        self.target_type
    }

    fn priority(&self) -> PriorityClass {
        self.priority
    }

    fn exclusion_group(&self) -> Option<ExclusionGroupId> {
        self.group.clone()
    }

    fn is_valid_for(&self, window: ValuationWindow) -> bool {
        self.valid_until.is_none_or(|until| window <= until)
    }

    fn can_apply(&self, target: &TargetSpecification) -> bool {
        self.applies_to.as_ref().is_none_or(|predicate| predicate(target))
    }

    fn outputs(&self, target: &TargetSpecification) -> BTreeSet<ValueSpecification> {
        self.outputs
            .iter()
            .map(|(name, properties)| ValueSpecification::new(name, target.clone(), properties.clone()))
            .collect()
    }

    fn requirements(
        &self,
        target: &TargetSpecification,
        desired: &ValueRequirement,
    ) -> anyhow::Result<Option<BTreeSet<ValueRequirement>>> {
        match &self.requirements {
            Some(requirements) => requirements(target, desired),
            None => Ok(Some(self.declared_inputs(target))),
        }
    }

    fn results(
        &self,
        target: &TargetSpecification,
        inputs: &ResolvedInputs,
    ) -> anyhow::Result<BTreeSet<ValueSpecification>> {
        match &self.results {
            Some(results) => results(target, inputs),
            None => Ok(self.outputs(target)),
        }
    }

    fn additional_requirements(
        &self,
        target: &TargetSpecification,
        inputs: &ResolvedInputs,
        outputs: &BTreeSet<ValueSpecification>,
    ) -> anyhow::Result<BTreeSet<ValueRequirement>> {
        match &self.additional {
            Some(additional) => additional(target, inputs, outputs),
            None => Ok(BTreeSet::new()),
        }
    }
}

pub(crate) fn candidate(function: MockFunction, ordinal: usize) -> FunctionCandidate {
    FunctionCandidate::new(Arc::new(function), ordinal)
}

/// The window of January `n`, 2024.
pub(crate) fn day(n: u32) -> ValuationWindow {
    ValuationWindow::from_date(NaiveDate::from_ymd_opt(2024, 1, n).unwrap())
}

/// Noon on January `n`, 2024.
pub(crate) fn at(n: u32) -> DateTime<Utc> {
    day(n).date().and_hms_opt(12, 0, 0).unwrap().and_utc()
}

pub(crate) fn swap(n: u32) -> TargetSpecification {
    TargetSpecification::latest(TargetType::Security, "Swap", n.to_string())
}

pub(crate) fn usd() -> TargetSpecification {
    TargetSpecification::latest(TargetType::Currency, "ISO", "USD")
}

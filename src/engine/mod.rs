//! The build entry point: turns a batch of top-level requirements into a
//! [`DependencyGraph`].

mod assemble;
mod memo;
mod path;
mod resolver;
#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::ambiguity::AmbiguityChecker;
use crate::catalogue::{
    CatalogueCache, CompiledCatalogue, ExclusionGroups, FunctionRepository, InMemoryRepository,
    PriorityOrdering, ValuationWindow,
};
use crate::error::{ContractError, EngineError};
use crate::graph::DependencyGraph;
use crate::market_data::{MarketDataAvailability, NoMarketData};
use crate::utils::{PROGRESS_STYLE, as_overhead};
use crate::value::{PropertySet, TargetIdentity, TargetSpecification, TargetType, ValueRequirement};

use self::memo::ResolutionCache;
use self::resolver::{Resolution, Resolver};

/// Knobs fixed for the lifetime of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Deepest chain of inputs explored below a top-level requirement.
    /// Anything deeper is reported as `DepthExceeded`.
    pub max_depth: usize,
    /// Collect a [`FailureTrace`](crate::report::FailureTrace) for every
    /// unsatisfied requirement.
    pub failure_reporting: bool,
    /// Resolve top-level requirements on the rayon pool.
    pub parallel: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            max_depth: 64,
            failure_reporting: true,
            parallel: true,
        }
    }
}

/// Shared flag stopping a build in flight.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Limits on a single build. Requirements still pending when a limit is hit
/// are reported with [`UnsatisfiedReason::BudgetExceeded`](crate::report::UnsatisfiedReason).
#[derive(Debug, Clone, Default)]
pub struct Budget {
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_nodes: Option<usize>,
    pub(crate) cancel: Option<CancelToken>,
}

impl Budget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wall-clock limit, counted from the start of resolution.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Limit on the number of nodes created by the build.
    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = Some(max_nodes);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// One `(value name, target type, target identity)` entry of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementSpec {
    pub value_name: String,
    pub target_type: TargetType,
    pub target: TargetIdentity,
    #[serde(default)]
    pub constraints: PropertySet,
}

impl From<ValueRequirement> for RequirementSpec {
    fn from(requirement: ValueRequirement) -> Self {
        Self {
            value_name: requirement.value_name().to_string(),
            target_type: requirement.target().target_type(),
            target: requirement.target().identity().clone(),
            constraints: requirement.constraints().clone(),
        }
    }
}

impl RequirementSpec {
    fn to_requirement(&self, defaults: &PropertySet) -> ValueRequirement {
        let target = TargetSpecification::new(self.target_type, self.target.clone());
        ValueRequirement::new(&self.value_name, target)
            .with_constraints(self.constraints.with_defaults(defaults))
    }
}

/// Everything a caller submits for one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub calculation_configuration: String,
    pub valuation_time: DateTime<Utc>,
    /// Filled into every top-level requirement that doesn't constrain the
    /// key itself.
    #[serde(default)]
    pub defaults: PropertySet,
    pub requirements: Vec<RequirementSpec>,
}

impl BuildRequest {
    pub fn new(calculation_configuration: impl Into<String>, valuation_time: DateTime<Utc>) -> Self {
        Self {
            calculation_configuration: calculation_configuration.into(),
            valuation_time,
            defaults: PropertySet::new(),
            requirements: Vec::new(),
        }
    }

    pub fn with_defaults(mut self, defaults: PropertySet) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with(mut self, requirement: ValueRequirement) -> Self {
        self.requirements.push(requirement.into());
        self
    }

    /// Checks the request and returns its requirements with the defaults
    /// applied, in request order.
    fn validate(&self) -> Result<Vec<ValueRequirement>, ContractError> {
        if self.calculation_configuration.trim().is_empty() {
            return Err(ContractError::EmptyConfigName);
        }

        self.requirements
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                if spec.value_name.is_empty() {
                    return Err(ContractError::EmptyValueName(i));
                }
                if spec.target.scheme.is_empty() || spec.target.value.is_empty() {
                    return Err(ContractError::EmptyTargetIdentity(i));
                }
                Ok(spec.to_requirement(&self.defaults))
            })
            .collect()
    }
}

type Memo = ResolutionCache<Arc<Resolution>>;

pub struct EngineBuilder {
    repository: Arc<dyn FunctionRepository>,
    market_data: Arc<dyn MarketDataAvailability>,
    groups: ExclusionGroups,
    ordering: PriorityOrdering,
    options: BuildOptions,
    catalogues: Arc<CatalogueCache>,
}

impl EngineBuilder {
    fn new() -> Self {
        Self {
            repository: Arc::new(InMemoryRepository::new()),
            market_data: Arc::new(NoMarketData),
            groups: ExclusionGroups::new(),
            ordering: PriorityOrdering::new(),
            options: BuildOptions::default(),
            catalogues: Arc::new(CatalogueCache::new()),
        }
    }

    pub fn repository(mut self, repository: impl FunctionRepository + 'static) -> Self {
        self.repository = Arc::new(repository);
        self
    }

    pub fn market_data(mut self, market_data: impl MarketDataAvailability + 'static) -> Self {
        self.market_data = Arc::new(market_data);
        self
    }

    pub fn exclusion_groups(mut self, groups: ExclusionGroups) -> Self {
        self.groups = groups;
        self
    }

    pub fn priority_ordering(mut self, ordering: PriorityOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    /// Compiled catalogues shared with other engines over the same
    /// repository and ordering.
    pub fn catalogue_cache(mut self, catalogues: Arc<CatalogueCache>) -> Self {
        self.catalogues = catalogues;
        self
    }

    pub fn finish(self) -> Engine {
        Engine {
            repository: self.repository,
            market_data: self.market_data,
            groups: self.groups,
            ordering: self.ordering,
            options: self.options,
            catalogues: self.catalogues,
            memos: RwLock::new(BTreeMap::new()),
        }
    }
}

/// Builds dependency graphs against one function repository.
///
/// The engine owns the resolution memo of every valuation window it has
/// served; concurrent builds on the same engine share it, so a sub-plan
/// resolved by one build is reused by the others.
pub struct Engine {
    repository: Arc<dyn FunctionRepository>,
    market_data: Arc<dyn MarketDataAvailability>,
    groups: ExclusionGroups,
    ordering: PriorityOrdering,
    options: BuildOptions,
    catalogues: Arc<CatalogueCache>,
    memos: RwLock<BTreeMap<ValuationWindow, Arc<Memo>>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn build(&self, request: &BuildRequest) -> Result<DependencyGraph, EngineError> {
        self.build_with_budget(request, &Budget::default())
    }

    /// Resolves every requirement of `request`.
    ///
    /// Returns `Err` only for a malformed request or a catalogue that fails
    /// to compile. Requirements that can't be resolved are reported in the
    /// graph.
    pub fn build_with_budget(
        &self,
        request: &BuildRequest,
        budget: &Budget,
    ) -> Result<DependencyGraph, EngineError> {
        let s = Instant::now();

        let requirements = request.validate()?;
        let window = ValuationWindow::containing(request.valuation_time);
        let catalogue = self.catalogue(window)?;
        let memo = self.memo(window);

        let span = tracing::span!(
            Level::INFO,
            "build",
            config = %request.calculation_configuration,
            %window
        );
        span.pb_set_style(&PROGRESS_STYLE);
        span.pb_set_length(requirements.len() as u64);
        span.pb_set_message("Resolving requirements...");
        let _enter = span.enter();

        let resolver = Resolver::new(
            &catalogue,
            &self.groups,
            self.market_data.as_ref(),
            &memo,
            &self.options,
            budget,
        );

        let resolve = |requirement: &ValueRequirement| {
            let resolution = tracing::span!(parent: &span, Level::DEBUG, "resolve", %requirement)
                .in_scope(|| resolver.resolve_top(requirement));
            span.pb_inc(1);
            resolution
        };

        let resolutions: Vec<Arc<Resolution>> = match self.options.parallel {
            true => requirements.par_iter().map(resolve).collect(),
            false => requirements.iter().map(resolve).collect(),
        };

        let graph = assemble::assemble(request, &requirements, &resolutions);

        tracing::info!(
            "Built {} nodes for {} requirements ({} unsatisfied, {} exceptions) {}",
            graph.node_count(),
            requirements.len(),
            graph.unsatisfied().len(),
            graph.exceptions().len(),
            as_overhead(s)
        );

        Ok(graph)
    }

    /// Drops compiled catalogues and memos of every window before `window`.
    pub fn roll_window(&self, window: ValuationWindow) {
        self.catalogues.invalidate_before(window);

        let mut memos = self.memos.write().unwrap();
        let before = memos.len();
        memos.retain(|served, _| *served >= window);

        tracing::info!("Rolled over to {window}, dropped {} memos", before - memos.len());
    }

    /// A checker over the same catalogue, exclusion groups, ordering and
    /// market data the engine resolves with.
    pub fn ambiguity_checker(&self, window: ValuationWindow) -> Result<AmbiguityChecker, EngineError> {
        Ok(AmbiguityChecker::new(
            self.catalogue(window)?,
            self.groups.clone(),
            self.ordering.clone(),
            self.market_data.clone(),
        ))
    }

    fn catalogue(&self, window: ValuationWindow) -> Result<Arc<CompiledCatalogue>, EngineError> {
        let catalogue = self.catalogues.get_or_compile(window, || {
            CompiledCatalogue::compile(self.repository.as_ref(), window, &self.ordering)
        })?;
        Ok(catalogue)
    }

    fn memo(&self, window: ValuationWindow) -> Arc<Memo> {
        if let Some(memo) = self.memos.read().unwrap().get(&window) {
            return memo.clone();
        }

        self.memos
            .write()
            .unwrap()
            .entry(window)
            .or_insert_with(|| Arc::new(Memo::new()))
            .clone()
    }

    #[cfg(test)]
    fn memo_windows(&self) -> Vec<ValuationWindow> {
        self.memos.read().unwrap().keys().copied().collect()
    }
}

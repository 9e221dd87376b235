use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::catalogue::{
    CompiledCatalogue, ExclusionGroupId, ExclusionGroups, FunctionCandidate, ResolvedInputs,
};
use crate::engine::memo::{Claim, ResolutionCache};
use crate::engine::path::ResolutionPath;
use crate::engine::{Budget, BuildOptions};
use crate::error::CandidateError;
use crate::graph::Producer;
use crate::market_data::MarketDataAvailability;
use crate::report::{
    BudgetLimit, CandidateOutcome, CandidateTrace, FailureTrace, ResolutionException,
    UnsatisfiedReason,
};
use crate::value::{TargetSpecification, ValueRequirement, ValueSpecification};

/// One function application (or one observable value) chosen to satisfy a
/// requirement, with the applications feeding it.
#[derive(Debug)]
pub(crate) struct ResolvedNode {
    pub target: TargetSpecification,
    pub producer: Producer,
    pub group: Option<ExclusionGroupId>,
    /// The output satisfying the requirement this node was resolved for.
    pub output: ValueSpecification,
    /// Every fully resolved output of the application.
    pub outputs: BTreeSet<ValueSpecification>,
    pub inputs: Vec<(ValueSpecification, Arc<ResolvedNode>)>,
}

impl ResolvedNode {
    fn market_data(spec: ValueSpecification) -> Self {
        Self {
            target: spec.target().clone(),
            producer: Producer::MarketData,
            group: None,
            outputs: BTreeSet::from([spec.clone()]),
            output: spec,
            inputs: Vec::new(),
        }
    }

    fn function_id(&self) -> Option<&str> {
        match &self.producer {
            Producer::Function(id) => Some(id),
            Producer::MarketData => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Resolved(Arc<ResolvedNode>),
    Failed {
        reason: UnsatisfiedReason,
        trace: Option<FailureTrace>,
    },
    Aborted(BudgetLimit),
}

/// Result of resolving one requirement under one path.
///
/// Besides the outcome it records everything the resolution looked at, so
/// it can later be reused under a different path only when that path would
/// not have changed anything.
#[derive(Debug)]
pub(crate) struct Resolution {
    pub outcome: Outcome,
    /// Exceptions raised anywhere below, including in abandoned candidates.
    pub exceptions: BTreeSet<ResolutionException>,
    /// Every requirement attempted below.
    touched: BTreeSet<ValueRequirement>,
    /// Every exclusion group of every candidate considered below.
    groups: BTreeSet<ExclusionGroupId>,
    /// How many frames deeper than its root the resolution went.
    height: usize,
    /// Depth of the outermost path frame that pruned anything below, or
    /// `usize::MAX` when nothing outside the resolution did.
    constraint: usize,
}

impl Resolution {
    /// Refused before any candidate was tried. `depth` is the outermost
    /// path frame the refusal depends on.
    fn refused(
        requirement: &ValueRequirement,
        reason: UnsatisfiedReason,
        depth: usize,
        reporting: bool,
    ) -> Self {
        Self {
            outcome: Outcome::Failed {
                trace: reporting.then(|| FailureTrace::new(requirement, reason.clone())),
                reason,
            },
            exceptions: BTreeSet::new(),
            touched: BTreeSet::from([requirement.clone()]),
            groups: BTreeSet::new(),
            height: 0,
            constraint: depth,
        }
    }

    fn aborted(limit: BudgetLimit) -> Self {
        Self {
            outcome: Outcome::Aborted(limit),
            exceptions: BTreeSet::new(),
            touched: BTreeSet::new(),
            groups: BTreeSet::new(),
            height: 0,
            constraint: 0,
        }
    }

    /// Independent of everything on a path of `root` frames, and therefore
    /// the same under any path that doesn't touch what it touched.
    fn is_canonical(&self, root: usize) -> bool {
        !matches!(self.outcome, Outcome::Aborted(_)) && self.constraint > root
    }
}

/// Restrictions a parent places on one of its inputs because of the choices
/// made for the inputs before it.
#[derive(Debug, Clone, Default)]
pub(crate) struct Bans {
    /// Groups already chosen by an earlier sibling, with the function that
    /// holds them.
    taken: BTreeMap<ExclusionGroupId, String>,
    /// Groups ruled out after a failed combination.
    excluded: BTreeSet<ExclusionGroupId>,
}

impl Bans {
    fn blocks(&self, group: &ExclusionGroupId, function: &str) -> bool {
        self.excluded.contains(group)
            || self.taken.get(group).is_some_and(|holder| holder != function)
    }
}

enum Attempt {
    Failed(CandidateOutcome),
    Aborted(BudgetLimit),
}

/// Bookkeeping for one requirement being resolved.
struct Accumulator<'a> {
    requirement: &'a ValueRequirement,
    reporting: bool,
    exceptions: BTreeSet<ResolutionException>,
    touched: BTreeSet<ValueRequirement>,
    groups: BTreeSet<ExclusionGroupId>,
    height: usize,
    constraint: usize,
    cycle: bool,
    too_deep: Option<usize>,
    candidates: Vec<CandidateTrace>,
}

impl<'a> Accumulator<'a> {
    fn new(requirement: &'a ValueRequirement, reporting: bool) -> Self {
        Self {
            requirement,
            reporting,
            exceptions: BTreeSet::new(),
            touched: BTreeSet::from([requirement.clone()]),
            groups: BTreeSet::new(),
            height: 0,
            constraint: usize::MAX,
            cycle: false,
            too_deep: None,
            candidates: Vec::new(),
        }
    }

    /// Folds in a child resolved one frame deeper. A reused child was
    /// checked against the current path, so it prunes nothing.
    fn absorb(&mut self, child: &Resolution, fresh: bool) {
        self.exceptions.extend(child.exceptions.iter().cloned());
        self.touched.extend(child.touched.iter().cloned());
        self.groups.extend(child.groups.iter().cloned());
        self.height = self.height.max(child.height + 1);
        if fresh {
            self.constraint = self.constraint.min(child.constraint);
        }
    }

    fn prune(&mut self, depth: usize) {
        self.constraint = self.constraint.min(depth);
    }

    fn exception(&mut self, candidate: &FunctionCandidate, err: &CandidateError) {
        self.exceptions.insert(ResolutionException {
            target: self.requirement.target().clone(),
            value_name: self.requirement.value_name().to_string(),
            function: candidate.id().to_string(),
            message: err.message(),
        });
    }

    fn candidate_failed(&mut self, candidate: &FunctionCandidate, outcome: CandidateOutcome) {
        if self.reporting {
            self.candidates.push(CandidateTrace {
                function: candidate.id().to_string(),
                outcome,
            });
        }
    }

    fn finish(self, outcome: Outcome) -> Resolution {
        Resolution {
            outcome,
            exceptions: self.exceptions,
            touched: self.touched,
            groups: self.groups,
            height: self.height,
            constraint: self.constraint,
        }
    }

    fn resolved(self, node: ResolvedNode) -> Resolution {
        self.finish(Outcome::Resolved(Arc::new(node)))
    }

    fn failed(mut self) -> Resolution {
        let reason = match (self.cycle, self.too_deep) {
            (true, _) => UnsatisfiedReason::Cycle,
            (false, Some(max_depth)) => UnsatisfiedReason::DepthExceeded { max_depth },
            (false, None) => UnsatisfiedReason::NoCandidate,
        };
        let trace = self.reporting.then(|| FailureTrace {
            requirement: self.requirement.clone(),
            reason: reason.clone(),
            candidates: std::mem::take(&mut self.candidates),
        });
        self.finish(Outcome::Failed { reason, trace })
    }

    fn aborted(mut self, limit: BudgetLimit) -> Resolution {
        self.constraint = 0;
        self.finish(Outcome::Aborted(limit))
    }
}

/// Per-build resolution state over a shared memo.
pub(crate) struct Resolver<'a> {
    catalogue: &'a CompiledCatalogue,
    groups: &'a ExclusionGroups,
    market_data: &'a dyn MarketDataAvailability,
    memo: &'a ResolutionCache<Arc<Resolution>>,
    options: &'a BuildOptions,
    budget: &'a Budget,
    deadline: Option<Instant>,
    nodes: AtomicUsize,
    /// Failed `requirements` calls, not repeated for the rest of the build.
    penalties: Mutex<HashMap<(String, ValueRequirement), CandidateError>>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        catalogue: &'a CompiledCatalogue,
        groups: &'a ExclusionGroups,
        market_data: &'a dyn MarketDataAvailability,
        memo: &'a ResolutionCache<Arc<Resolution>>,
        options: &'a BuildOptions,
        budget: &'a Budget,
    ) -> Self {
        Self {
            catalogue,
            groups,
            market_data,
            memo,
            options,
            budget,
            deadline: budget.timeout.map(|timeout| Instant::now() + timeout),
            nodes: AtomicUsize::new(0),
            penalties: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a top-level requirement.
    pub fn resolve_top(&self, requirement: &ValueRequirement) -> Arc<Resolution> {
        let (resolution, _) = self.resolve(requirement, &ResolutionPath::new(), &Bans::default());
        resolution
    }

    fn exceeded(&self) -> Option<BudgetLimit> {
        if self.budget.cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
            return Some(BudgetLimit::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Some(BudgetLimit::Deadline);
        }
        if self
            .budget
            .max_nodes
            .is_some_and(|max| self.nodes.load(Ordering::Relaxed) >= max)
        {
            return Some(BudgetLimit::NodeCount);
        }
        None
    }

    /// Returns the resolution and whether it was computed here rather than
    /// reused from the memo.
    fn resolve(
        &self,
        requirement: &ValueRequirement,
        path: &ResolutionPath,
        bans: &Bans,
    ) -> (Arc<Resolution>, bool) {
        if let Some(limit) = self.exceeded() {
            return (Arc::new(Resolution::aborted(limit)), true);
        }

        let reporting = self.options.failure_reporting;
        if let Some(depth) = path.cycle_depth(requirement) {
            tracing::debug!("Cycle: {requirement} is already being resolved at depth {depth}");
            let reason = UnsatisfiedReason::Cycle;
            return (Arc::new(Resolution::refused(requirement, reason, depth, reporting)), true);
        }
        let max_depth = self.options.max_depth;
        if path.len() >= max_depth {
            tracing::debug!("Giving up on {requirement}: path deeper than {max_depth}");
            let reason = UnsatisfiedReason::DepthExceeded { max_depth };
            return (Arc::new(Resolution::refused(requirement, reason, 0, reporting)), true);
        }

        match self.memo.claim(requirement) {
            Claim::Hit(cached) if self.reusable(&cached, path, bans) => (cached, false),
            Claim::Hit(_) | Claim::Local => (Arc::new(self.compute(requirement, path, bans)), true),
            Claim::Owner(guard) => {
                let resolution = Arc::new(self.compute(requirement, path, bans));
                if resolution.is_canonical(path.len()) {
                    guard.publish(resolution.clone());
                }
                (resolution, true)
            }
        }
    }

    /// Whether resolving again under `path` and `bans` would reproduce the
    /// cached resolution.
    fn reusable(&self, cached: &Resolution, path: &ResolutionPath, bans: &Bans) -> bool {
        if path.len() + cached.height >= self.options.max_depth {
            return false;
        }
        if cached.groups.iter().any(|group| path.has_group(group)) {
            return false;
        }
        if cached.touched.iter().any(|requirement| path.contains(requirement)) {
            return false;
        }
        match &cached.outcome {
            Outcome::Resolved(node) => match (&node.group, node.function_id()) {
                (Some(group), Some(id)) => !bans.blocks(group, id),
                _ => true,
            },
            _ => true,
        }
    }

    fn compute(&self, requirement: &ValueRequirement, path: &ResolutionPath, bans: &Bans) -> Resolution {
        let mut acc = Accumulator::new(requirement, self.options.failure_reporting);

        if let Some(spec) = self.observable(requirement) {
            tracing::debug!("{requirement} is observable as {spec}");
            self.nodes.fetch_add(1, Ordering::Relaxed);
            return acc.resolved(ResolvedNode::market_data(spec));
        }

        let candidates = self.catalogue.candidates_for(requirement);
        if candidates.is_empty() {
            tracing::debug!("No candidate produces {requirement}");
        }

        for candidate in &candidates {
            match self.apply(candidate, requirement, path, bans, &mut acc) {
                Ok(node) => {
                    tracing::debug!("Resolved {requirement} with {}", candidate.id());
                    return acc.resolved(node);
                }
                Err(Attempt::Failed(outcome)) => acc.candidate_failed(candidate, outcome),
                Err(Attempt::Aborted(limit)) => return acc.aborted(limit),
            }
        }

        acc.failed()
    }

    fn observable(&self, requirement: &ValueRequirement) -> Option<ValueSpecification> {
        let spec = self.market_data.resolve(requirement)?;
        let matching = requirement.for_matching();

        match spec.narrow_to(&matching) {
            Some(narrowed) if narrowed.properties().is_fully_resolved() => Some(narrowed),
            _ => {
                tracing::warn!("Ignoring market data {spec}: it doesn't fully resolve {requirement}");
                None
            }
        }
    }

    fn apply(
        &self,
        candidate: &FunctionCandidate,
        requirement: &ValueRequirement,
        path: &ResolutionPath,
        bans: &Bans,
        acc: &mut Accumulator<'_>,
    ) -> Result<ResolvedNode, Attempt> {
        if let Some(limit) = self.exceeded() {
            return Err(Attempt::Aborted(limit));
        }

        let id = candidate.id();
        let target = requirement.target();
        let group = self.groups.group_of(candidate);

        if let Some(group) = &group {
            acc.groups.insert(group.clone());

            if let Some(depth) = path.group_depth(group) {
                tracing::debug!("Skipping {id} for {requirement}: {group} is already on the path");
                acc.prune(depth);
                return Err(Attempt::Failed(CandidateOutcome::Skipped {
                    group: group.clone(),
                }));
            }
            if bans.blocks(group, id) {
                tracing::debug!("Skipping {id} for {requirement}: {group} is taken by a sibling");
                acc.prune(path.len());
                return Err(Attempt::Failed(CandidateOutcome::Skipped {
                    group: group.clone(),
                }));
            }
        }

        let wanted = match self.requirements_of(candidate, requirement, acc)? {
            Some(wanted) => wanted,
            None => return Err(Attempt::Failed(CandidateOutcome::Declined)),
        };

        let branch = path.push(requirement, group.clone());
        let wanted: Vec<ValueRequirement> = wanted.into_iter().collect();
        let mut chosen = self.solve(&wanted, &branch, &BTreeMap::new(), acc)?;

        let mut resolved: ResolvedInputs = wanted
            .iter()
            .cloned()
            .zip(chosen.iter().map(|node| node.output.clone()))
            .collect();

        let results = candidate
            .results(target, &resolved)
            .map_err(|err| self.failure(candidate, requirement, err, acc))?;

        let Some((original, output)) = self.choose_output(candidate, requirement, &results) else {
            tracing::debug!("{id} resolved its inputs but no output satisfies {requirement}");
            return Err(Attempt::Failed(CandidateOutcome::NoMatchingOutput));
        };

        let mut outputs: BTreeSet<ValueSpecification> = results
            .into_iter()
            .filter(|spec| spec != &original && spec.properties().is_fully_resolved())
            .collect();
        outputs.insert(output.clone());

        let additional: Vec<ValueRequirement> = candidate
            .additional_requirements(target, &resolved, &outputs)
            .map_err(|err| self.failure(candidate, requirement, err, acc))?
            .into_iter()
            .filter(|extra| !resolved.contains_key(extra))
            .collect();

        if !additional.is_empty() {
            let taken = chosen
                .iter()
                .filter_map(|node| Some((node.group.clone()?, node.function_id()?.to_string())))
                .collect();
            let extra = self.solve(&additional, &branch, &taken, acc)?;

            resolved.extend(
                additional
                    .into_iter()
                    .zip(extra.iter().map(|node| node.output.clone())),
            );
            chosen.extend(extra);
        }

        self.nodes.fetch_add(1, Ordering::Relaxed);

        Ok(ResolvedNode {
            target: target.clone(),
            producer: Producer::Function(id.to_string()),
            group,
            output,
            outputs,
            inputs: chosen
                .into_iter()
                .map(|node| (node.output.clone(), node))
                .collect(),
        })
    }

    /// The candidate's `requirements` call, at most once per requirement
    /// when it fails.
    fn requirements_of(
        &self,
        candidate: &FunctionCandidate,
        requirement: &ValueRequirement,
        acc: &mut Accumulator<'_>,
    ) -> Result<Option<BTreeSet<ValueRequirement>>, Attempt> {
        let key = (candidate.id().to_string(), requirement.clone());

        let penalty = self.penalties.lock().unwrap().get(&key).cloned();
        if let Some(err) = penalty {
            tracing::debug!("Skipping {} for {requirement}: it failed earlier", candidate.id());
            acc.exception(candidate, &err);
            return Err(Attempt::Failed(CandidateOutcome::Exception {
                message: err.message(),
            }));
        }

        candidate.requirements(requirement.target(), requirement).map_err(|err| {
            self.penalties
                .lock()
                .unwrap()
                .entry(key)
                .or_insert_with(|| err.clone());
            self.failure(candidate, requirement, err, acc)
        })
    }

    fn failure(
        &self,
        candidate: &FunctionCandidate,
        requirement: &ValueRequirement,
        err: CandidateError,
        acc: &mut Accumulator<'_>,
    ) -> Attempt {
        tracing::warn!("{} failed on {requirement}: {err}", candidate.id());
        acc.exception(candidate, &err);
        Attempt::Failed(CandidateOutcome::Exception {
            message: err.message(),
        })
    }

    /// Picks the narrowest fully resolved output satisfying `requirement`.
    /// Returns the output as offered and as narrowed to the requirement.
    fn choose_output(
        &self,
        candidate: &FunctionCandidate,
        requirement: &ValueRequirement,
        results: &BTreeSet<ValueSpecification>,
    ) -> Option<(ValueSpecification, ValueSpecification)> {
        let matching = requirement.for_matching();

        let mut offered: Vec<(ValueSpecification, ValueSpecification)> = results
            .iter()
            .filter_map(|spec| Some((spec.clone(), spec.narrow_to(&matching)?)))
            .filter(|(_, narrowed)| narrowed.properties().is_fully_resolved())
            .collect();

        offered.sort_by(|(_, a), (_, b)| {
            a.properties()
                .breadth()
                .cmp(&b.properties().breadth())
                .then_with(|| a.cmp(b))
        });
        offered.dedup_by(|(_, a), (_, b)| a == b);

        let mut offered = offered.into_iter();
        let first = offered.next()?;

        if let Some((_, runner_up)) = offered.next()
            && runner_up.properties().breadth() == first.1.properties().breadth()
        {
            tracing::warn!(
                "{} offers equally narrow outputs {} and {runner_up} for {requirement}; using the first",
                candidate.id(),
                first.1
            );
        }

        Some(first)
    }

    /// Resolves sibling inputs in order. When the remaining siblings can't
    /// be resolved, the current one is retried without its exclusion group,
    /// which is the only way its choice constrains the others.
    fn solve(
        &self,
        requirements: &[ValueRequirement],
        path: &ResolutionPath,
        taken: &BTreeMap<ExclusionGroupId, String>,
        acc: &mut Accumulator<'_>,
    ) -> Result<Vec<Arc<ResolvedNode>>, Attempt> {
        let Some((first, rest)) = requirements.split_first() else {
            return Ok(Vec::new());
        };

        let mut excluded = BTreeSet::new();
        loop {
            let bans = Bans {
                taken: taken.clone(),
                excluded: excluded.clone(),
            };
            let (resolution, fresh) = self.resolve(first, path, &bans);
            acc.absorb(&resolution, fresh);

            let node = match &resolution.outcome {
                Outcome::Resolved(node) => node.clone(),
                Outcome::Failed { reason, trace } => {
                    match reason {
                        UnsatisfiedReason::Cycle => acc.cycle = true,
                        UnsatisfiedReason::DepthExceeded { max_depth } => {
                            acc.too_deep = Some(*max_depth)
                        }
                        _ => {}
                    }
                    let trace = match trace {
                        Some(trace) => trace.clone(),
                        None => FailureTrace::new(first, reason.clone()),
                    };
                    return Err(Attempt::Failed(CandidateOutcome::InputsFailed {
                        input: Box::new(trace),
                    }));
                }
                Outcome::Aborted(limit) => return Err(Attempt::Aborted(*limit)),
            };

            let mut next = taken.clone();
            if let (Some(group), Some(id)) = (&node.group, node.function_id()) {
                next.entry(group.clone()).or_insert_with(|| id.to_string());
            }

            match self.solve(rest, path, &next, acc) {
                Ok(mut nodes) => {
                    nodes.insert(0, node);
                    return Ok(nodes);
                }
                Err(Attempt::Failed(outcome)) => {
                    let Some(group) = node.group.clone() else {
                        return Err(Attempt::Failed(outcome));
                    };
                    tracing::debug!("Retrying {first} without {group}");
                    excluded.insert(group);
                }
                Err(aborted) => return Err(aborted),
            }
        }
    }
}

//! Static check that every resolution step of a view has a unique winner.
//!
//! The builder takes the first candidate that works. The checker walks
//! everything a view could need and flags each point where that first pick
//! is arbitrary: equally ranked candidates offering distinguishable outputs,
//! or one candidate offering several equally narrow outputs.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::catalogue::{
    CompiledCatalogue, ExclusionGroupId, ExclusionGroups, FunctionCandidate, PriorityOrdering,
};
use crate::config::{ConfigSource, ViewDefinition};
use crate::error::ConfigError;
use crate::market_data::MarketDataAvailability;
use crate::utils::as_overhead;
use crate::value::{ValueRequirement, ValueSpecification};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityKind {
    /// Several top-ranked accepting candidates offer different outputs.
    CandidateTie,
    /// The chosen candidate offers several equally narrow outputs.
    OutputTie,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguityDefect {
    pub requirement: ValueRequirement,
    pub kind: AmbiguityKind,
    /// The competing functions, in priority order.
    pub functions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewReport {
    pub name: String,
    pub passed: bool,
    pub defects: Vec<AmbiguityDefect>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguityReport {
    pub views: Vec<ViewReport>,
}

impl AmbiguityReport {
    pub fn passed(&self) -> bool {
        self.views.iter().all(|view| view.passed)
    }

    pub fn defects(&self) -> impl Iterator<Item = &AmbiguityDefect> {
        self.views.iter().flat_map(|view| &view.defects)
    }
}

/// A requirement still to be checked, with the groups committed above it.
struct Pending {
    requirement: ValueRequirement,
    committed: BTreeSet<ExclusionGroupId>,
}

pub struct AmbiguityChecker {
    catalogue: Arc<CompiledCatalogue>,
    groups: ExclusionGroups,
    ordering: PriorityOrdering,
    market_data: Arc<dyn MarketDataAvailability>,
}

impl AmbiguityChecker {
    /// `ordering` should be the one `catalogue` was compiled with.
    pub fn new(
        catalogue: Arc<CompiledCatalogue>,
        groups: ExclusionGroups,
        ordering: PriorityOrdering,
        market_data: Arc<dyn MarketDataAvailability>,
    ) -> Self {
        Self {
            catalogue,
            groups,
            ordering,
            market_data,
        }
    }

    /// Checks `requirements` and everything they transitively need. Each
    /// defective requirement is reported once.
    pub fn check(&self, requirements: &[ValueRequirement]) -> Vec<AmbiguityDefect> {
        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        let mut defects = Vec::new();

        let mut stack: Vec<Pending> = requirements
            .iter()
            .rev()
            .map(|requirement| Pending {
                requirement: requirement.clone(),
                committed: BTreeSet::new(),
            })
            .collect();

        while let Some(pending) = stack.pop() {
            if !seen.insert((pending.requirement.clone(), pending.committed.clone())) {
                continue;
            }

            let (found, next) = self.step(&pending);
            for defect in found {
                if reported.insert((defect.requirement.clone(), defect.kind)) {
                    tracing::warn!(
                        "Ambiguous {}: {:?} between {}",
                        defect.requirement,
                        defect.kind,
                        defect.functions.join(", ")
                    );
                    defects.push(defect);
                }
            }
            stack.extend(next.into_iter().rev());
        }

        defects
    }

    /// Checks one requirement. Returns its defects and the requirements any
    /// accepting candidate would need, since the builder falls back to lower
    /// ranks when inputs don't resolve.
    fn step(&self, pending: &Pending) -> (Vec<AmbiguityDefect>, Vec<Pending>) {
        let requirement = &pending.requirement;
        let target = requirement.target();

        if self.market_data.resolve(requirement).is_some() {
            return (Vec::new(), Vec::new());
        }

        // Candidates that decline or fail don't compete: the builder would
        // move past them.
        let accepting: Vec<(FunctionCandidate, BTreeSet<ValueRequirement>)> = self
            .catalogue
            .candidates_for(requirement)
            .into_iter()
            .filter(|candidate| !self.groups.collides(candidate, &pending.committed))
            .filter_map(|candidate| match candidate.requirements(target, requirement) {
                Ok(Some(inputs)) => Some((candidate, inputs)),
                Ok(None) => None,
                Err(err) => {
                    tracing::debug!("{} failed on {requirement}: {err}", candidate.id());
                    None
                }
            })
            .collect();

        let mut defects = Vec::new();

        if let Some((chosen, _)) = accepting.first() {
            let competitors: Vec<&FunctionCandidate> = accepting
                .iter()
                .map(|(candidate, _)| candidate)
                .take_while(|candidate| self.ordering.is_tie(chosen, candidate))
                .collect();
            let offered = self.offered(chosen, requirement);

            if competitors[1..].iter().any(|other| self.offered(other, requirement) != offered) {
                defects.push(AmbiguityDefect {
                    requirement: requirement.clone(),
                    kind: AmbiguityKind::CandidateTie,
                    functions: competitors.iter().map(|c| c.id().to_string()).collect(),
                });
            }

            if has_output_tie(&offered) {
                defects.push(AmbiguityDefect {
                    requirement: requirement.clone(),
                    kind: AmbiguityKind::OutputTie,
                    functions: vec![chosen.id().to_string()],
                });
            }
        }

        let next = accepting
            .into_iter()
            .flat_map(|(candidate, inputs)| {
                let mut committed = pending.committed.clone();
                committed.extend(self.groups.group_of(&candidate));
                inputs.into_iter().map(move |requirement| Pending {
                    requirement,
                    committed: committed.clone(),
                })
            })
            .collect();

        (defects, next)
    }

    /// The advertised outputs of `candidate` narrowed to `requirement`.
    fn offered(
        &self,
        candidate: &FunctionCandidate,
        requirement: &ValueRequirement,
    ) -> BTreeSet<ValueSpecification> {
        let matching = requirement.for_matching();
        candidate
            .function()
            .outputs(requirement.target())
            .iter()
            .filter_map(|spec| spec.narrow_to(&matching))
            .collect()
    }

    pub fn check_view(&self, view: &ViewDefinition) -> ViewReport {
        let requirements: Vec<ValueRequirement> = view
            .configurations
            .iter()
            .flat_map(|configuration| configuration.resolved_requirements())
            .collect();

        let defects = self.check(&requirements);
        tracing::info!(
            "View {}: {} requirements, {} ambiguities",
            view.name,
            requirements.len(),
            defects.len()
        );

        ViewReport {
            name: view.name.clone(),
            passed: defects.is_empty(),
            defects,
        }
    }

    /// Checks every view of `source`, in the source's order.
    pub fn check_source(&self, source: &dyn ConfigSource) -> Result<AmbiguityReport, ConfigError> {
        let s = Instant::now();
        let views = source.views()?;

        let report = AmbiguityReport {
            views: views.par_iter().map(|view| self.check_view(view)).collect(),
        };

        tracing::info!(
            "Checked {} views, {} passed {}",
            report.views.len(),
            report.views.iter().filter(|view| view.passed).count(),
            as_overhead(s)
        );
        Ok(report)
    }
}

/// Whether two fully resolved offers are equally narrow and narrowest.
fn has_output_tie(offered: &BTreeSet<ValueSpecification>) -> bool {
    let mut breadths: Vec<_> = offered
        .iter()
        .filter(|spec| spec.properties().is_fully_resolved())
        .map(|spec| spec.properties().breadth())
        .collect();
    breadths.sort_unstable();

    matches!(breadths.as_slice(), [a, b, ..] if a == b)
}

//! Diagnostics returned with every build: why requirements went
//! unsatisfied, which functions raised errors, and a serializable report
//! combining both with the graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalogue::ExclusionGroupId;
use crate::graph::Producer;
use crate::value::{TargetSpecification, ValueRequirement, ValueSpecification};

/// The caller-imposed limit that stopped a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLimit {
    Deadline,
    NodeCount,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnsatisfiedReason {
    /// No candidate chain resolves the requirement.
    NoCandidate,
    /// Every way of resolving the requirement leads back to itself.
    Cycle,
    /// Resolving the requirement needs a chain of inputs deeper than the
    /// build allows.
    DepthExceeded { max_depth: usize },
    /// The build stopped before the requirement was resolved.
    BudgetExceeded { limit: BudgetLimit },
}

impl UnsatisfiedReason {
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, UnsatisfiedReason::BudgetExceeded { .. })
    }
}

/// An error raised by a function's metadata call.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResolutionException {
    pub target: TargetSpecification,
    pub value_name: String,
    pub function: String,
    pub message: String,
}

/// Why one requirement could not be resolved, candidate by candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureTrace {
    pub requirement: ValueRequirement,
    pub reason: UnsatisfiedReason,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<CandidateTrace>,
}

impl FailureTrace {
    pub(crate) fn new(requirement: &ValueRequirement, reason: UnsatisfiedReason) -> Self {
        Self {
            requirement: requirement.clone(),
            reason,
            candidates: Vec::new(),
        }
    }

    /// Every requirement in the trace, this one first, depth first.
    pub fn requirements(&self) -> Vec<&ValueRequirement> {
        let mut acc = vec![&self.requirement];
        for candidate in &self.candidates {
            if let CandidateOutcome::InputsFailed { input } = &candidate.outcome {
                acc.extend(input.requirements());
            }
        }
        acc
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTrace {
    pub function: String,
    pub outcome: CandidateOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CandidateOutcome {
    /// Its exclusion group was committed on the path or by a sibling.
    Skipped { group: ExclusionGroupId },
    /// `requirements` returned nothing for the requirement.
    Declined,
    /// A metadata call raised an error.
    Exception { message: String },
    /// One of its inputs could not be resolved.
    InputsFailed { input: Box<FailureTrace> },
    /// Inputs resolved, but no produced output satisfies the requirement.
    NoMatchingOutput,
}

/// One diagnostic entry. Exceptions and failures are tagged separately so
/// callers can count them independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureEntry {
    Exception(ResolutionException),
    Failure {
        requirement: ValueRequirement,
        #[serde(flatten)]
        reason: UnsatisfiedReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace: Option<FailureTrace>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub index: usize,
    pub target: TargetSpecification,
    pub producer: Producer,
    pub inputs: Vec<usize>,
    pub outputs: Vec<ValueSpecification>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutput {
    pub requirement: ValueRequirement,
    pub specification: ValueSpecification,
}

/// Structured result of a build, as handed to diagnostic consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub calculation_configuration: String,
    pub valuation_time: DateTime<Utc>,
    pub nodes: Vec<NodeReport>,
    pub terminal_outputs: Vec<TerminalOutput>,
    pub entries: Vec<FailureEntry>,
}

impl BuildReport {
    pub fn exception_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry, FailureEntry::Exception(_)))
            .count()
    }

    pub fn failure_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry, FailureEntry::Failure { .. }))
            .count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

//! The dependency graph: the frozen result of a build.
//!
//! Nodes are function applications (or observable market data) bound to a
//! target; an edge runs from a producer to a consumer and carries the value
//! specification flowing along it. The graph is stored in a
//! [`petgraph::Graph`], so node indices are dense and assigned in the order
//! the build created the nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::SnapshotError;
use crate::report::{
    BuildReport, FailureEntry, FailureTrace, NodeReport, ResolutionException, TerminalOutput,
    UnsatisfiedReason,
};
use crate::value::{TargetSpecification, ValueRequirement, ValueSpecification};

/// What produces the outputs of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Producer {
    Function(String),
    /// A directly observable value; such nodes have no inputs.
    MarketData,
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Producer::Function(id) => f.write_str(id),
            Producer::MarketData => f.write_str("market data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    target: TargetSpecification,
    producer: Producer,
    outputs: BTreeSet<ValueSpecification>,
}

impl DependencyNode {
    pub(crate) fn new(
        target: TargetSpecification,
        producer: Producer,
        outputs: BTreeSet<ValueSpecification>,
    ) -> Self {
        Self {
            target,
            producer,
            outputs,
        }
    }

    pub fn target(&self) -> &TargetSpecification {
        &self.target
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn function_id(&self) -> Option<&str> {
        match &self.producer {
            Producer::Function(id) => Some(id),
            Producer::MarketData => None,
        }
    }

    pub fn outputs(&self) -> &BTreeSet<ValueSpecification> {
        &self.outputs
    }

    pub(crate) fn add_outputs(&mut self, outputs: impl IntoIterator<Item = ValueSpecification>) {
        self.outputs.extend(outputs);
    }
}

/// Result of one build: a DAG of nodes, the specification satisfying each
/// top-level requirement, and the diagnostics for everything that failed.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    pub(crate) calculation_configuration: String,
    pub(crate) valuation_time: DateTime<Utc>,
    pub(crate) graph: Graph<DependencyNode, ValueSpecification>,
    pub(crate) terminal: BTreeMap<ValueRequirement, (ValueSpecification, NodeIndex)>,
    pub(crate) unsatisfied: BTreeMap<ValueRequirement, UnsatisfiedReason>,
    pub(crate) failures: BTreeMap<ValueRequirement, FailureTrace>,
    pub(crate) exceptions: Vec<ResolutionException>,
}

impl DependencyGraph {
    pub(crate) fn new(calculation_configuration: String, valuation_time: DateTime<Utc>) -> Self {
        Self {
            calculation_configuration,
            valuation_time,
            graph: Graph::new(),
            terminal: BTreeMap::new(),
            unsatisfied: BTreeMap::new(),
            failures: BTreeMap::new(),
            exceptions: Vec::new(),
        }
    }

    pub fn calculation_configuration(&self) -> &str {
        &self.calculation_configuration
    }

    pub fn valuation_time(&self) -> DateTime<Utc> {
        self.valuation_time
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &DependencyNode)> {
        self.graph
            .node_indices()
            .map(|index| (index, &self.graph[index]))
    }

    pub fn node(&self, index: NodeIndex) -> Option<&DependencyNode> {
        self.graph.node_weight(index)
    }

    /// Producers feeding `index`, with the specification each one supplies,
    /// in the order the edges were added.
    pub fn inputs_of(&self, index: NodeIndex) -> Vec<(NodeIndex, &ValueSpecification)> {
        let mut inputs: Vec<_> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| (edge.id(), edge.source(), edge.weight()))
            .collect();
        inputs.sort_by_key(|(id, _, _)| *id);
        inputs
            .into_iter()
            .map(|(_, source, spec)| (source, spec))
            .collect()
    }

    /// Top-level requirement → specification satisfying it.
    pub fn terminal_outputs(&self) -> BTreeMap<&ValueRequirement, &ValueSpecification> {
        self.terminal
            .iter()
            .map(|(requirement, (spec, _))| (requirement, spec))
            .collect()
    }

    pub fn terminal_output(&self, requirement: &ValueRequirement) -> Option<&ValueSpecification> {
        self.terminal.get(requirement).map(|(spec, _)| spec)
    }

    /// The node producing the terminal output of `requirement`.
    pub fn terminal_node(&self, requirement: &ValueRequirement) -> Option<NodeIndex> {
        self.terminal.get(requirement).map(|(_, index)| *index)
    }

    pub fn unsatisfied(&self) -> &BTreeMap<ValueRequirement, UnsatisfiedReason> {
        &self.unsatisfied
    }

    /// Candidate-by-candidate explanation for an unsatisfied requirement,
    /// when failure reporting is enabled.
    pub fn failure_trace(&self, requirement: &ValueRequirement) -> Option<&FailureTrace> {
        self.failures.get(requirement)
    }

    pub fn exceptions(&self) -> &[ResolutionException] {
        &self.exceptions
    }

    pub fn is_acyclic(&self) -> bool {
        petgraph::algo::toposort(&self.graph, None).is_ok()
    }

    /// Drops node outputs that are neither consumed by another node nor a
    /// terminal output. Nodes themselves are kept. Returns the number of
    /// outputs removed.
    pub fn remove_unnecessary_values(&mut self) -> usize {
        let mut needed: BTreeMap<NodeIndex, BTreeSet<ValueSpecification>> = BTreeMap::new();

        for edge in self.graph.edge_references() {
            needed
                .entry(edge.source())
                .or_default()
                .insert(edge.weight().clone());
        }
        for (spec, index) in self.terminal.values() {
            needed.entry(*index).or_default().insert(spec.clone());
        }

        let mut removed = 0;
        for index in self.graph.node_indices() {
            let keep = needed.remove(&index).unwrap_or_default();
            let node = &mut self.graph[index];
            let before = node.outputs.len();
            node.outputs.retain(|spec| keep.contains(spec));
            removed += before - node.outputs.len();
        }

        tracing::debug!("Removed {removed} unnecessary values");
        removed
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            calculation_configuration: self.calculation_configuration.clone(),
            valuation_time: self.valuation_time,
            nodes: self
                .graph
                .node_indices()
                .map(|index| self.graph[index].clone())
                .collect(),
            edges: self
                .graph
                .edge_references()
                .map(|edge| (edge.source().index(), edge.target().index(), edge.weight().clone()))
                .collect(),
            terminal: self
                .terminal
                .iter()
                .map(|(requirement, (spec, index))| {
                    (requirement.clone(), spec.clone(), index.index())
                })
                .collect(),
            unsatisfied: self
                .unsatisfied
                .iter()
                .map(|(requirement, reason)| (requirement.clone(), reason.clone()))
                .collect(),
            failures: self.failures.values().cloned().collect(),
            exceptions: self.exceptions.clone(),
        }
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut graph = Graph::with_capacity(snapshot.nodes.len(), snapshot.edges.len());
        for node in snapshot.nodes {
            graph.add_node(node);
        }
        for (source, target, spec) in snapshot.edges {
            graph.add_edge(NodeIndex::new(source), NodeIndex::new(target), spec);
        }

        Self {
            calculation_configuration: snapshot.calculation_configuration,
            valuation_time: snapshot.valuation_time,
            graph,
            terminal: snapshot
                .terminal
                .into_iter()
                .map(|(requirement, spec, index)| (requirement, (spec, NodeIndex::new(index))))
                .collect(),
            unsatisfied: snapshot.unsatisfied.into_iter().collect(),
            failures: snapshot
                .failures
                .into_iter()
                .map(|trace| (trace.requirement.clone(), trace))
                .collect(),
            exceptions: snapshot.exceptions,
        }
    }

    /// Blake3 hash of the canonical serialized graph. Two builds producing
    /// the same graph, byte for byte, have the same fingerprint.
    pub fn fingerprint(&self) -> Result<Hash32, serde_json::Error> {
        Hash32::hash_serialized(&self.to_snapshot())
    }

    pub fn to_report(&self) -> BuildReport {
        let nodes = self
            .graph
            .node_indices()
            .map(|index| {
                let node = &self.graph[index];
                let mut inputs: Vec<usize> = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .map(|source| source.index())
                    .collect();
                inputs.sort_unstable();
                inputs.dedup();

                NodeReport {
                    index: index.index(),
                    target: node.target.clone(),
                    producer: node.producer.clone(),
                    inputs,
                    outputs: node.outputs.iter().cloned().collect(),
                }
            })
            .collect();

        let terminal_outputs = self
            .terminal
            .iter()
            .map(|(requirement, (spec, _))| TerminalOutput {
                requirement: requirement.clone(),
                specification: spec.clone(),
            })
            .collect();

        let exceptions = self
            .exceptions
            .iter()
            .cloned()
            .map(FailureEntry::Exception);
        let failures = self
            .unsatisfied
            .iter()
            .map(|(requirement, reason)| FailureEntry::Failure {
                requirement: requirement.clone(),
                reason: reason.clone(),
                trace: self.failures.get(requirement).cloned(),
            });

        BuildReport {
            calculation_configuration: self.calculation_configuration.clone(),
            valuation_time: self.valuation_time,
            nodes,
            terminal_outputs,
            entries: exceptions.chain(failures).collect(),
        }
    }

    /// Writes a CBOR snapshot into `dir` as `<fingerprint>.graph.cbor` and
    /// returns its path.
    pub fn save(&self, dir: impl AsRef<Utf8Path>) -> Result<Utf8PathBuf, SnapshotError> {
        let dir = dir.as_ref();
        let snapshot = self.to_snapshot();
        let hash = Hash32::hash_serialized(&snapshot)?;

        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.graph.cbor", hash.to_hex()));
        let file = BufWriter::new(File::create(&path)?);
        ciborium::into_writer(&snapshot, file)?;

        tracing::debug!("Saved dependency graph to {path}");
        Ok(path)
    }

    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, SnapshotError> {
        let file = BufReader::new(File::open(path.as_ref())?);
        let snapshot: Snapshot = ciborium::from_reader(file)?;
        Ok(Self::from_snapshot(snapshot))
    }
}

/// Renders the graph as a mermaid flowchart.
impl fmt::Display for DependencyGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let terminal: BTreeSet<NodeIndex> = self.terminal.values().map(|(_, index)| *index).collect();

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let name = node.producer.to_string().replace('"', "\\\"");
            let target = node.target.to_string().replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\\n{}\"]", index.index(), name, target)?;

            if node.producer == Producer::MarketData {
                writeln!(f, "    style {:?} fill:#ADD8E6", index.index())?;
            }
            if terminal.contains(&index) {
                writeln!(f, "    {:?} --> Output", index.index())?;
            }
        }

        writeln!(f, "    Output[Output]")?;

        for edge in self.graph.edge_references() {
            let value_name = edge
                .weight()
                .value_name()
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            writeln!(
                f,
                "    {:?} -- \"{}\" --> {:?}",
                edge.source().index(),
                value_name,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

/// Owned, index-based form of a graph used for fingerprints and snapshots.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    calculation_configuration: String,
    valuation_time: DateTime<Utc>,
    nodes: Vec<DependencyNode>,
    edges: Vec<(usize, usize, ValueSpecification)>,
    terminal: Vec<(ValueRequirement, ValueSpecification, usize)>,
    unsatisfied: Vec<(ValueRequirement, UnsatisfiedReason)>,
    failures: Vec<FailureTrace>,
    exceptions: Vec<ResolutionException>,
}

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use petgraph::graph::NodeIndex;

use crate::engine::BuildRequest;
use crate::engine::resolver::{Outcome, Resolution, ResolvedNode};
use crate::graph::{DependencyGraph, DependencyNode, Producer};
use crate::report::UnsatisfiedReason;
use crate::value::{TargetSpecification, ValueRequirement, ValueSpecification};

/// Structural identity of a node: what runs, on what, fed by what.
#[derive(PartialEq, Eq, Hash)]
struct NodeKey {
    target: TargetSpecification,
    producer: Producer,
    /// The observed value, for market data nodes.
    observed: Option<ValueSpecification>,
    inputs: BTreeSet<(ValueSpecification, NodeIndex)>,
}

struct Assembler {
    graph: DependencyGraph,
    visited: HashMap<*const ResolvedNode, NodeIndex>,
    by_key: HashMap<NodeKey, NodeIndex>,
    edges: HashSet<(NodeIndex, NodeIndex, ValueSpecification)>,
}

impl Assembler {
    /// Adds `node` and everything feeding it, inputs first.
    fn visit(&mut self, node: &Arc<ResolvedNode>) -> NodeIndex {
        let ptr = Arc::as_ptr(node);
        if let Some(&index) = self.visited.get(&ptr) {
            return index;
        }

        let inputs: Vec<(ValueSpecification, NodeIndex)> = node
            .inputs
            .iter()
            .map(|(spec, input)| (spec.clone(), self.visit(input)))
            .collect();

        let key = NodeKey {
            target: node.target.clone(),
            producer: node.producer.clone(),
            observed: (node.producer == Producer::MarketData).then(|| node.output.clone()),
            inputs: inputs.iter().cloned().collect(),
        };

        let index = match self.by_key.get(&key) {
            Some(&index) => {
                self.graph.graph[index].add_outputs(node.outputs.iter().cloned());
                index
            }
            None => {
                let index = self.graph.graph.add_node(DependencyNode::new(
                    node.target.clone(),
                    node.producer.clone(),
                    node.outputs.clone(),
                ));
                for (spec, source) in inputs {
                    if self.edges.insert((source, index, spec.clone())) {
                        self.graph.graph.add_edge(source, index, spec);
                    }
                }
                self.by_key.insert(key, index);
                index
            }
        };

        self.visited.insert(ptr, index);
        index
    }
}

/// Freezes the resolutions of a build into a graph, in request order.
pub(crate) fn assemble(
    request: &BuildRequest,
    requirements: &[ValueRequirement],
    resolutions: &[Arc<Resolution>],
) -> DependencyGraph {
    let mut assembler = Assembler {
        graph: DependencyGraph::new(
            request.calculation_configuration.clone(),
            request.valuation_time,
        ),
        visited: HashMap::new(),
        by_key: HashMap::new(),
        edges: HashSet::new(),
    };
    let mut exceptions = BTreeSet::new();

    for (requirement, resolution) in requirements.iter().zip(resolutions) {
        exceptions.extend(resolution.exceptions.iter().cloned());

        match &resolution.outcome {
            Outcome::Resolved(node) => {
                let index = assembler.visit(node);
                assembler
                    .graph
                    .terminal
                    .insert(requirement.clone(), (node.output.clone(), index));
            }
            Outcome::Failed { reason, trace } => {
                let graph = &mut assembler.graph;
                graph.unsatisfied.insert(requirement.clone(), reason.clone());
                if let Some(trace) = trace {
                    graph.failures.insert(requirement.clone(), trace.clone());
                }
            }
            Outcome::Aborted(limit) => {
                assembler.graph.unsatisfied.insert(
                    requirement.clone(),
                    UnsatisfiedReason::BudgetExceeded { limit: *limit },
                );
            }
        }
    }

    let mut graph = assembler.graph;
    graph.exceptions = exceptions.into_iter().collect();
    graph
}

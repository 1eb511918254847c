//! Mapping dependencies between a job's children.
//!
//! Each mapping is an edge from its source child to its destination child.
//! SEQ jobs require every edge to point forward in declaration order; PAR
//! jobs require the edges to form a DAG.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::error::DispatchError;
use crate::exertion::{Job, JobMapping};
use crate::strategy::FlowType;

/// Child indices each child depends on, and the reverse.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct DependencyPlan {
    pub(crate) sources: Vec<Vec<usize>>,
    pub(crate) dependents: Vec<Vec<usize>>,
}

/// Validate `mappings` against `job`'s children for `flow`.
pub(crate) fn plan(
    job: &Job,
    mappings: &[JobMapping],
    flow: FlowType,
) -> Result<DependencyPlan, DispatchError> {
    let n = job.children.len();
    let index: HashMap<_, _> = job
        .children
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id(), i))
        .collect();

    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<_> = (0..n).map(|i| graph.add_node(i)).collect();
    let mut plan = DependencyPlan {
        sources: vec![Vec::new(); n],
        dependents: vec![Vec::new(); n],
    };

    for mapping in mappings {
        let (Some(&from), Some(&to)) = (index.get(&mapping.from), index.get(&mapping.to)) else {
            return Err(DispatchError::InvalidComposition(format!(
                "mapping {} -> {} in job '{}' names an exertion that is not a child",
                mapping.from_path, mapping.to_path, job.header.name
            )));
        };
        if from == to {
            return Err(DispatchError::InvalidComposition(format!(
                "child '{}' maps onto itself",
                job.children[from].name()
            )));
        }
        if flow == FlowType::Seq && from > to {
            return Err(DispatchError::InvalidComposition(format!(
                "mapping from '{}' to earlier sibling '{}' cannot be satisfied sequentially",
                job.children[from].name(),
                job.children[to].name()
            )));
        }
        if !plan.sources[to].contains(&from) {
            plan.sources[to].push(from);
            plan.dependents[from].push(to);
            graph.add_edge(nodes[from], nodes[to], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let child = graph[cycle.node_id()];
        DispatchError::InvalidComposition(format!(
            "cyclic mappings involving child '{}'",
            job.children[child].name()
        ))
    })?;

    Ok(plan)
}

use flowcore::{FlowGraph, GraphError};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Resolved execution order of a flow
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    line_order: Vec<String>,
    aggregation_order: Vec<String>,
    upstream: HashMap<String, Vec<String>>,
}

impl ExecutionPlan {
    /// Per-line nodes; every node comes after everything it references.
    pub fn line_order(&self) -> &[String] {
        &self.line_order
    }

    /// Aggregation nodes, run once after the lines.
    pub fn aggregation_order(&self) -> &[String] {
        &self.aggregation_order
    }

    /// Nodes that `node` reads from, in first-reference order.
    pub fn upstream(&self, node: &str) -> &[String] {
        self.upstream.get(node).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Builds execution plans from flow graphs.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Validate `graph` and compute its execution plan.
    ///
    /// Nodes without a relative ordering constraint keep their declaration
    /// order, so the same graph always yields the same plan.
    pub fn resolve(graph: &FlowGraph) -> Result<ExecutionPlan, GraphError> {
        graph.validate()?;

        let mut dag: DiGraph<usize, ()> = DiGraph::new();
        let indices: Vec<NodeIndex> = (0..graph.nodes.len()).map(|i| dag.add_node(i)).collect();
        let by_name: HashMap<&str, usize> = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.name.as_str(), i))
            .collect();

        let mut upstream = HashMap::new();
        for (i, node) in graph.nodes.iter().enumerate() {
            let deps = node.upstream_nodes();
            for dep in &deps {
                // validate() guarantees every node reference resolves
                if let Some(&j) = by_name.get(dep) {
                    dag.add_edge(indices[j], indices[i], ());
                }
            }
            upstream.insert(node.name.clone(), deps.into_iter().map(str::to_string).collect());
        }

        let order = kahn_order(&dag).map_err(|remaining| GraphError::CyclicDependency {
            cycle: cycle_members(&dag, &remaining)
                .into_iter()
                .map(|i| graph.nodes[i].name.clone())
                .collect(),
        })?;

        let (aggregation_order, line_order): (Vec<_>, Vec<_>) = order
            .into_iter()
            .map(|i| &graph.nodes[i])
            .partition(|node| node.aggregation);

        let plan = ExecutionPlan {
            line_order: line_order.into_iter().map(|n| n.name.clone()).collect(),
            aggregation_order: aggregation_order.into_iter().map(|n| n.name.clone()).collect(),
            upstream,
        };
        tracing::debug!(
            "Resolved flow '{}': line order {:?}, aggregation order {:?}",
            graph.name,
            plan.line_order,
            plan.aggregation_order
        );
        Ok(plan)
    }
}

/// Kahn's algorithm with a min-heap on declaration index.
///
/// On a cycle, returns the indices that never reached indegree zero.
fn kahn_order(dag: &DiGraph<usize, ()>) -> Result<Vec<usize>, Vec<usize>> {
    let mut indegree: Vec<usize> = dag
        .node_indices()
        .map(|idx| dag.neighbors_directed(idx, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, &deg)| deg == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(indegree.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for succ in dag.neighbors_directed(NodeIndex::new(i), Direction::Outgoing) {
            let deg = &mut indegree[succ.index()];
            *deg -= 1;
            if *deg == 0 {
                ready.push(Reverse(succ.index()));
            }
        }
    }

    if order.len() == indegree.len() {
        Ok(order)
    } else {
        Err(indegree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg > 0)
            .map(|(i, _)| i)
            .collect())
    }
}

/// Narrow the unsorted remainder down to the members of one actual cycle.
fn cycle_members(dag: &DiGraph<usize, ()>, remaining: &[usize]) -> Vec<usize> {
    let cyclic = tarjan_scc(dag).into_iter().find(|component| {
        component.len() > 1 || component.iter().any(|&idx| dag.contains_edge(idx, idx))
    });
    let mut members: Vec<usize> = match cyclic {
        Some(component) => component.into_iter().map(|idx| idx.index()).collect(),
        None => remaining.to_vec(),
    };
    members.sort_unstable();
    members
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::{NodeSpec, Reference};

    #[test]
    fn independent_nodes_keep_declaration_order() {
        let graph = FlowGraph::new("g")
            .with_node(NodeSpec::new("c", "t").with_input("x", Reference::node("a")))
            .with_node(NodeSpec::new("b", "t"))
            .with_node(NodeSpec::new("a", "t"));
        let plan = DependencyResolver::resolve(&graph).unwrap();
        assert_eq!(plan.line_order(), ["b", "a", "c"]);
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let graph = FlowGraph::new("g")
            .with_node(NodeSpec::new("a", "t").with_input("x", Reference::node("a")));
        assert_eq!(
            DependencyResolver::resolve(&graph),
            Err(GraphError::CyclicDependency { cycle: vec!["a".to_string()] })
        );
    }
}

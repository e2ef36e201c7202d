//! Workflow graph: validated DAG of nodes, cycle detection, and scheduling queries.
//!
//! Uses `petgraph` to model node dependencies as a directed graph. Edges point
//! from a dependency to its dependent and may carry a guard expression that
//! the conditional coordinator evaluates. Topological sort rejects cycles;
//! depth-based grouping produces the levels the pipeline mode runs.
//!
//! The graph is immutable once built, so it is shared across tasks via `Arc`
//! without locking.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use conductor_types::workflow::{EdgeSpec, ExecutionMode, NodeKind, NodeSpec, NodeStatus};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Structural problems detected while building a graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("cycle detected involving node '{0}'")]
    Cycle(String),

    #[error("edge '{from}' -> '{to}' references unknown node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("agent node '{0}' has no capability reference")]
    MissingCapability(String),
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

const DEFAULT_NAME: &str = "workflow";

/// A validated, acyclic workflow graph.
#[derive(Debug, Clone)]
pub struct Graph {
    name: String,
    mode: ExecutionMode,
    dag: DiGraph<NodeSpec, Option<String>>,
    index: HashMap<String, NodeIndex>,
    /// Deterministic topological order (ties broken by insertion order).
    order: Vec<NodeIndex>,
    /// Nodes grouped by depth: level 0 holds the roots.
    levels: Vec<Vec<NodeIndex>>,
}

impl Graph {
    /// Build a graph from nodes and edges.
    ///
    /// Each node's `depends_on` list adds an unguarded edge from every listed
    /// node into it. Fails on duplicate node ids, agent nodes without a
    /// capability, edges naming unknown nodes, and cycles (self-loops too).
    pub fn build(
        nodes: Vec<NodeSpec>,
        edges: Vec<EdgeSpec>,
        mode: ExecutionMode,
    ) -> Result<Self, GraphError> {
        let mut dag = DiGraph::with_capacity(nodes.len(), edges.len());
        let mut index = HashMap::with_capacity(nodes.len());

        for node in nodes {
            if index.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode(node.id));
            }
            if node.kind == NodeKind::Agent && node.capability.is_none() {
                return Err(GraphError::MissingCapability(node.id));
            }
            let id = node.id.clone();
            let idx = dag.add_node(node);
            index.insert(id, idx);
        }

        let implied: Vec<EdgeSpec> = dag
            .node_weights()
            .flat_map(|node| {
                node.depends_on
                    .iter()
                    .map(|dep| EdgeSpec::new(dep.clone(), node.id.clone()))
            })
            .collect();

        for edge in edges.into_iter().chain(implied) {
            let lookup = |id: &str| {
                index.get(id).copied().ok_or_else(|| GraphError::DanglingEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: id.to_string(),
                })
            };
            let from = lookup(&edge.from)?;
            let to = lookup(&edge.to)?;
            dag.add_edge(from, to, edge.guard);
        }

        // Topological sort -- detects cycles
        toposort(&dag, None)
            .map_err(|cycle| GraphError::Cycle(dag[cycle.node_id()].id.clone()))?;

        let order = stable_topological_order(&dag);
        let levels = compute_levels(&dag, &order);

        Ok(Self {
            name: DEFAULT_NAME.to_string(),
            mode,
            dag,
            index,
            order,
            levels,
        })
    }

    /// Set the human-readable workflow name carried into records.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.dag.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.dag.node_count() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.index.get(id).map(|&idx| &self.dag[idx])
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.dag.node_weights()
    }

    /// Node ids in deterministic topological order.
    pub fn topological_order(&self) -> Vec<&str> {
        self.order.iter().map(|&idx| self.id(idx)).collect()
    }

    /// Node ids grouped by depth (max predecessor depth + 1).
    pub fn levels(&self) -> Vec<Vec<&str>> {
        self.levels
            .iter()
            .map(|level| level.iter().map(|&idx| self.id(idx)).collect())
            .collect()
    }

    /// Nodes with no predecessors, in insertion order.
    pub fn roots(&self) -> Vec<&str> {
        self.dag
            .node_indices()
            .filter(|&idx| {
                self.dag
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| self.id(idx))
            .collect()
    }

    /// Direct predecessors of `id`, deduplicated, in insertion order.
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct successors of `id`, deduplicated, in insertion order.
    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Outgoing edges of `id` as `(target, guard)`, in declaration order.
    pub fn edges_from(&self, id: &str) -> Vec<(&str, Option<&str>)> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut edges: Vec<_> = self
            .dag
            .edges_directed(idx, Direction::Outgoing)
            .collect();
        edges.sort_by_key(|edge| edge.id());
        edges
            .into_iter()
            .map(|edge| (self.id(edge.target()), edge.weight().as_deref()))
            .collect()
    }

    /// Every node reachable from `id`, excluding `id` itself.
    pub fn descendants(&self, id: &str) -> HashSet<&str> {
        let mut visited = HashSet::new();
        let Some(&start) = self.index.get(id) else {
            return visited;
        };
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            for next in self.dag.neighbors_directed(current, Direction::Outgoing) {
                if visited.insert(self.id(next)) {
                    stack.push(next);
                }
            }
        }
        visited
    }

    /// Nodes that are `Pending` and whose predecessors are all `Completed`,
    /// in topological order.
    ///
    /// Nodes missing from `statuses` are treated as `Pending`. `Running` and
    /// terminal nodes are never returned.
    pub fn ready_nodes(&self, statuses: &HashMap<String, NodeStatus>) -> Vec<&str> {
        let status_of = |idx: NodeIndex| {
            statuses
                .get(self.id(idx))
                .copied()
                .unwrap_or(NodeStatus::Pending)
        };
        self.order
            .iter()
            .copied()
            .filter(|&idx| status_of(idx) == NodeStatus::Pending)
            .filter(|&idx| {
                self.dag
                    .neighbors_directed(idx, Direction::Incoming)
                    .all(|pred| status_of(pred) == NodeStatus::Completed)
            })
            .map(|idx| self.id(idx))
            .collect()
    }

    fn id(&self, idx: NodeIndex) -> &str {
        self.dag[idx].id.as_str()
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.dag.neighbors_directed(idx, direction).collect();
        found.sort();
        found.dedup();
        found.into_iter().map(|n| self.id(n)).collect()
    }
}

/// Kahn's algorithm with a min-heap on insertion index, so independent nodes
/// keep their declaration order.
fn stable_topological_order(dag: &DiGraph<NodeSpec, Option<String>>) -> Vec<NodeIndex> {
    let mut in_degree: Vec<usize> = dag
        .node_indices()
        .map(|idx| dag.edges_directed(idx, Direction::Incoming).count())
        .collect();

    let mut heap: BinaryHeap<Reverse<NodeIndex>> = dag
        .node_indices()
        .filter(|idx| in_degree[idx.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(dag.node_count());
    while let Some(Reverse(idx)) = heap.pop() {
        order.push(idx);
        for edge in dag.edges_directed(idx, Direction::Outgoing) {
            let target = edge.target();
            in_degree[target.index()] -= 1;
            if in_degree[target.index()] == 0 {
                heap.push(Reverse(target));
            }
        }
    }
    order
}

/// Group nodes by depth: roots have depth 0, everything else is the max
/// depth of its predecessors plus one.
fn compute_levels(
    dag: &DiGraph<NodeSpec, Option<String>>,
    order: &[NodeIndex],
) -> Vec<Vec<NodeIndex>> {
    let mut depths = vec![0usize; dag.node_count()];
    for &idx in order {
        depths[idx.index()] = dag
            .neighbors_directed(idx, Direction::Incoming)
            .map(|pred| depths[pred.index()] + 1)
            .max()
            .unwrap_or(0);
    }

    let Some(&max_depth) = depths.iter().max() else {
        return Vec::new();
    };
    let mut levels = vec![Vec::new(); max_depth + 1];
    for idx in dag.node_indices() {
        levels[depths[idx.index()]].push(idx);
    }
    levels
}

// ---------------------------------------------------------------------------
// GraphBuilder
// ---------------------------------------------------------------------------

/// Incremental, programmatic graph construction.
///
/// ```ignore
/// let graph = GraphBuilder::new(ExecutionMode::Parallel)
///     .add_node(NodeSpec::agent("fetch", "http", "get"))
///     .add_node(NodeSpec::agent("parse", "json", "parse"))
///     .add_edge("fetch", "parse")
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    name: Option<String>,
    mode: ExecutionMode,
    nodes: Vec<NodeSpec>,
    edges: Vec<EdgeSpec>,
}

impl GraphBuilder {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn add_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(EdgeSpec::new(from, to));
        self
    }

    pub fn add_guarded_edge(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        guard: impl Into<String>,
    ) -> Self {
        self.edges.push(EdgeSpec::guarded(from, to, guard));
        self
    }

    pub fn build(self) -> Result<Graph, GraphError> {
        let graph = Graph::build(self.nodes, self.edges, self.mode)?;
        Ok(match self.name {
            Some(name) => graph.named(name),
            None => graph,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeSpec {
        NodeSpec::agent(id, "test-agent", "run")
    }

    fn statuses(pairs: &[(&str, NodeStatus)]) -> HashMap<String, NodeStatus> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    #[test]
    fn test_empty_graph_builds() {
        let graph = Graph::build(vec![], vec![], ExecutionMode::Parallel).unwrap();
        assert!(graph.is_empty());
        assert!(graph.levels().is_empty());
        assert!(graph.topological_order().is_empty());
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let err = Graph::build(vec![node("a"), node("a")], vec![], ExecutionMode::Sequential)
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNode(ref id) if id == "a"));
    }

    #[test]
    fn test_agent_without_capability_rejected() {
        let err = Graph::build(
            vec![NodeSpec::new("bare", NodeKind::Agent)],
            vec![],
            ExecutionMode::Sequential,
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::MissingCapability(ref id) if id == "bare"));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let err = Graph::build(
            vec![node("a")],
            vec![EdgeSpec::new("a", "ghost")],
            ExecutionMode::Sequential,
        )
        .unwrap_err();
        match err {
            GraphError::DanglingEdge { missing, .. } => assert_eq!(missing, "ghost"),
            other => panic!("expected DanglingEdge, got {other:?}"),
        }
    }

    #[test]
    fn test_dangling_depends_on_rejected() {
        let err = Graph::build(
            vec![node("a").after("nope")],
            vec![],
            ExecutionMode::Sequential,
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::DanglingEdge { .. }));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = GraphBuilder::new(ExecutionMode::Parallel)
            .add_node(node("a"))
            .add_node(node("b"))
            .add_node(node("c"))
            .add_edge("a", "b")
            .add_edge("b", "c")
            .add_edge("c", "a")
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
        assert!(err.to_string().contains("cycle detected"));
    }

    #[test]
    fn test_self_loop_rejected() {
        let err = GraphBuilder::new(ExecutionMode::Parallel)
            .add_node(node("a"))
            .add_edge("a", "a")
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::Cycle(ref id) if id == "a"));
    }

    #[test]
    fn test_builder_name() {
        let graph = GraphBuilder::new(ExecutionMode::Sequential)
            .name("nightly")
            .add_node(node("a"))
            .build()
            .unwrap();
        assert_eq!(graph.name(), "nightly");
        assert_eq!(graph.mode(), ExecutionMode::Sequential);
        assert_eq!(graph.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Ordering and levels
    // -----------------------------------------------------------------------

    #[test]
    fn test_topological_order_respects_edges_and_insertion() {
        let graph = GraphBuilder::new(ExecutionMode::Sequential)
            .add_node(node("c"))
            .add_node(node("a"))
            .add_node(node("b"))
            .add_edge("a", "c")
            .build()
            .unwrap();
        // Among available nodes the earliest-declared goes first, so `c`
        // (declared first) runs as soon as `a` releases it.
        assert_eq!(graph.topological_order(), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_diamond_levels() {
        let graph = GraphBuilder::new(ExecutionMode::Pipeline)
            .add_node(node("a"))
            .add_node(node("b"))
            .add_node(node("c"))
            .add_node(node("d"))
            .add_edge("a", "b")
            .add_edge("a", "c")
            .add_edge("b", "d")
            .add_edge("c", "d")
            .build()
            .unwrap();
        let levels = graph.levels();
        assert_eq!(levels, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_depth_is_longest_path() {
        // a -> b -> c, and a -> c directly: c is still depth 2.
        let graph = GraphBuilder::new(ExecutionMode::Pipeline)
            .add_node(node("a"))
            .add_node(node("b").after("a"))
            .add_node(node("c").after("a").after("b"))
            .build()
            .unwrap();
        assert_eq!(graph.levels(), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    #[test]
    fn test_predecessors_and_successors_dedup() {
        let graph = GraphBuilder::new(ExecutionMode::Parallel)
            .add_node(node("a"))
            .add_node(node("b").after("a"))
            .add_edge("a", "b")
            .build()
            .unwrap();
        assert_eq!(graph.predecessors("b"), vec!["a"]);
        assert_eq!(graph.successors("a"), vec!["b"]);
        assert!(graph.predecessors("missing").is_empty());
    }

    #[test]
    fn test_roots_and_descendants() {
        let graph = GraphBuilder::new(ExecutionMode::Parallel)
            .add_node(node("a"))
            .add_node(node("b"))
            .add_node(node("c").after("a"))
            .add_node(node("d").after("c"))
            .build()
            .unwrap();
        assert_eq!(graph.roots(), vec!["a", "b"]);
        let below_a = graph.descendants("a");
        assert_eq!(below_a.len(), 2);
        assert!(below_a.contains("c"));
        assert!(below_a.contains("d"));
        assert!(graph.descendants("b").is_empty());
    }

    #[test]
    fn test_edges_from_keeps_declaration_order_and_guards() {
        let graph = GraphBuilder::new(ExecutionMode::Conditional)
            .add_node(node("a"))
            .add_node(node("b"))
            .add_node(node("c"))
            .add_guarded_edge("a", "b", "x == 1")
            .add_edge("a", "c")
            .build()
            .unwrap();
        assert_eq!(
            graph.edges_from("a"),
            vec![("b", Some("x == 1")), ("c", None)]
        );
    }

    #[test]
    fn test_ready_nodes_initial_roots() {
        let graph = GraphBuilder::new(ExecutionMode::Parallel)
            .add_node(node("a"))
            .add_node(node("b"))
            .add_node(node("c").after("a").after("b"))
            .build()
            .unwrap();
        assert_eq!(graph.ready_nodes(&HashMap::new()), vec!["a", "b"]);
    }

    #[test]
    fn test_ready_nodes_requires_all_predecessors_completed() {
        let graph = GraphBuilder::new(ExecutionMode::Parallel)
            .add_node(node("a"))
            .add_node(node("b"))
            .add_node(node("c").after("a").after("b"))
            .build()
            .unwrap();

        let partial = statuses(&[("a", NodeStatus::Completed), ("b", NodeStatus::Running)]);
        assert!(graph.ready_nodes(&partial).is_empty());

        let done = statuses(&[("a", NodeStatus::Completed), ("b", NodeStatus::Completed)]);
        assert_eq!(graph.ready_nodes(&done), vec!["c"]);
    }

    #[test]
    fn test_ready_nodes_excludes_running_and_terminal() {
        let graph = GraphBuilder::new(ExecutionMode::Parallel)
            .add_node(node("a"))
            .add_node(node("b"))
            .add_node(node("c"))
            .build()
            .unwrap();
        let current = statuses(&[
            ("a", NodeStatus::Running),
            ("b", NodeStatus::Failed),
            ("c", NodeStatus::Pending),
        ]);
        assert_eq!(graph.ready_nodes(&current), vec!["c"]);
    }

    #[test]
    fn test_failed_predecessor_blocks_dependents() {
        let graph = GraphBuilder::new(ExecutionMode::Parallel)
            .add_node(node("a"))
            .add_node(node("b").after("a"))
            .build()
            .unwrap();
        let current = statuses(&[("a", NodeStatus::Failed)]);
        assert!(graph.ready_nodes(&current).is_empty());
    }
}

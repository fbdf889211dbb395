//! StepGraph - the dependency DAG over step ids
//!
//! The graph uses a bidirectional adjacency list:
//! - `predecessors`: steps this step depends on (its `depends_on`)
//! - `successors`: steps that depend on this step
//!
//! Nodes are kept in insertion order, which is the order steps were
//! declared. Every iteration the scheduler does over the graph uses that
//! order, so discovery order is deterministic even though execution order
//! among independent steps is not.
//!
//! Building happens in three phases: all nodes, then all edges, then a cycle
//! check. Edges may therefore reference steps declared later in the list.

use super::error::{GraphError, GraphResult};
use super::StepId;
use crate::core::StepMetadata;
use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;
use std::collections::{HashMap, HashSet, VecDeque};

/// A node in the step graph. Pure topology, no execution state.
#[derive(Debug, Clone)]
pub struct StepNode {
    id: StepId,
    predecessors: Vec<StepId>,
    successors: Vec<StepId>,
}

impl StepNode {
    fn new(id: StepId) -> Self {
        Self {
            id,
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    pub fn id(&self) -> &StepId {
        &self.id
    }

    /// Steps that must finish before this one starts.
    pub fn predecessors(&self) -> &[StepId] {
        &self.predecessors
    }

    /// Steps waiting on this one.
    pub fn successors(&self) -> &[StepId] {
        &self.successors
    }

    pub fn in_degree(&self) -> usize {
        self.predecessors.len()
    }
}

/// Directed acyclic graph of step dependencies.
///
/// # Example
///
/// ```
/// use integrator::graph::{StepGraph, StepId};
///
/// let mut graph = StepGraph::new();
/// graph.add_step(StepId::new("fetch-accounts")).unwrap();
/// graph.add_step(StepId::new("fetch-users")).unwrap();
/// graph
///     .add_dependency(StepId::new("fetch-users"), StepId::new("fetch-accounts"))
///     .unwrap();
///
/// let order = graph.topological_sort().unwrap();
/// assert_eq!(order, vec![StepId::new("fetch-accounts"), StepId::new("fetch-users")]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    nodes: Vec<StepNode>,
    positions: HashMap<StepId, usize>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph for a list of steps and rejects cycles.
    pub fn from_steps(steps: &[StepMetadata]) -> GraphResult<Self> {
        let mut graph = Self::new();

        for step in steps {
            graph.add_step(StepId::new(&step.id))?;
        }

        for step in steps {
            for dependency in &step.depends_on {
                graph.add_dependency(StepId::new(&step.id), StepId::new(dependency))?;
            }
        }

        graph.validate()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a step. Returns an error if the id is already taken.
    pub fn add_step(&mut self, id: StepId) -> GraphResult<()> {
        if self.positions.contains_key(&id) {
            return Err(GraphError::duplicate_step(id));
        }

        self.positions.insert(id.clone(), self.nodes.len());
        self.nodes.push(StepNode::new(id));
        Ok(())
    }

    /// Adds a dependency: `step` depends on `dependency`.
    ///
    /// Cycles are not checked here; call [`StepGraph::validate`] once all
    /// edges are in. Adding the same edge twice is a no-op.
    pub fn add_dependency(&mut self, step: StepId, dependency: StepId) -> GraphResult<()> {
        if step == dependency {
            return Err(GraphError::self_dependency(step));
        }

        let Some(&step_pos) = self.positions.get(&step) else {
            return Err(GraphError::step_not_found(step));
        };
        let Some(&dependency_pos) = self.positions.get(&dependency) else {
            return Err(GraphError::dependency_not_found(step, dependency));
        };

        if self.nodes[step_pos].predecessors.contains(&dependency) {
            return Ok(());
        }

        self.nodes[step_pos].predecessors.push(dependency);
        self.nodes[dependency_pos].successors.push(step);
        Ok(())
    }

    pub fn get_step(&self, id: &StepId) -> Option<&StepNode> {
        self.positions.get(id).map(|&pos| &self.nodes[pos])
    }

    pub fn contains_step(&self, id: &StepId) -> bool {
        self.positions.contains_key(id)
    }

    /// Declaration index of a step.
    pub fn position(&self, id: &StepId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// All step ids in insertion order.
    pub fn step_ids(&self) -> impl Iterator<Item = &StepId> {
        self.nodes.iter().map(StepNode::id)
    }

    pub fn dependencies_of(&self, id: &StepId) -> &[StepId] {
        self.get_step(id).map(StepNode::predecessors).unwrap_or(&[])
    }

    pub fn dependents_of(&self, id: &StepId) -> &[StepId] {
        self.get_step(id).map(StepNode::successors).unwrap_or(&[])
    }

    /// Every step that depends on `id`, directly or through other steps,
    /// in breadth-first discovery order.
    pub fn transitive_dependents(&self, id: &StepId) -> Vec<StepId> {
        let mut seen: HashSet<&StepId> = HashSet::new();
        let mut queue: VecDeque<&StepId> = self.dependents_of(id).iter().collect();
        let mut result = Vec::new();

        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            result.push(next.clone());
            queue.extend(self.dependents_of(next));
        }

        result
    }

    /// Returns a valid execution order using Kahn's algorithm.
    ///
    /// Ties are broken by insertion order.
    pub fn topological_sort(&self) -> GraphResult<Vec<StepId>> {
        let mut in_degrees: Vec<usize> = self.nodes.iter().map(StepNode::in_degree).collect();
        let mut queue: VecDeque<usize> = in_degrees
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(pos, _)| pos)
            .collect();
        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(pos) = queue.pop_front() {
            let node = &self.nodes[pos];
            result.push(node.id.clone());

            let mut successors: Vec<usize> = node
                .successors
                .iter()
                .filter_map(|s| self.positions.get(s).copied())
                .collect();
            successors.sort_unstable();

            for successor in successors {
                in_degrees[successor] -= 1;
                if in_degrees[successor] == 0 {
                    queue.push_back(successor);
                }
            }
        }

        if result.len() != self.nodes.len() {
            let path = self
                .find_cycle()
                .map(|cycle| render_path(&cycle))
                .unwrap_or_else(|| "unknown".to_string());
            return Err(GraphError::cycle(path));
        }

        Ok(result)
    }

    /// Finds one cycle, returned as a closed path along `depends_on` edges
    /// (`[a, b, a]` means a depends on b and b depends on a).
    pub fn find_cycle(&self) -> Option<Vec<StepId>> {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = Vec::new();
        let mut on_stack = vec![false; self.nodes.len()];

        for start in 0..self.nodes.len() {
            if visited[start] {
                continue;
            }
            if let Some(cycle) = self.dfs_cycle(start, &mut visited, &mut on_stack, &mut stack) {
                return Some(cycle.into_iter().map(|pos| self.nodes[pos].id.clone()).collect());
            }
        }

        None
    }

    fn dfs_cycle(
        &self,
        pos: usize,
        visited: &mut [bool],
        on_stack: &mut [bool],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        visited[pos] = true;
        on_stack[pos] = true;
        stack.push(pos);

        for dependency in &self.nodes[pos].predecessors {
            let Some(&next) = self.positions.get(dependency) else {
                continue;
            };
            if on_stack[next] {
                // Back edge: the cycle is the stack suffix starting at `next`.
                let start = stack.iter().position(|&p| p == next).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(next);
                return Some(cycle);
            }
            if !visited[next] {
                if let Some(cycle) = self.dfs_cycle(next, visited, on_stack, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        on_stack[pos] = false;
        None
    }

    /// Validates the graph structure: no cycles, no dangling dependencies.
    pub fn validate(&self) -> GraphResult<()> {
        for node in &self.nodes {
            for dependency in &node.predecessors {
                if !self.positions.contains_key(dependency) {
                    return Err(GraphError::dependency_not_found(
                        node.id.clone(),
                        dependency.clone(),
                    ));
                }
            }
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(GraphError::cycle(render_path(&cycle)));
        }

        Ok(())
    }

    /// Renders the graph in Graphviz DOT format, edges pointing from a
    /// dependency to its dependent.
    pub fn to_dot(&self) -> String {
        let mut graph = DiGraph::<String, ()>::new();
        let indices: Vec<_> = self
            .nodes
            .iter()
            .map(|node| graph.add_node(node.id.to_string()))
            .collect();

        for (pos, node) in self.nodes.iter().enumerate() {
            for dependency in &node.predecessors {
                if let Some(&dep_pos) = self.positions.get(dependency) {
                    graph.add_edge(indices[dep_pos], indices[pos], ());
                }
            }
        }

        format!("{:?}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
    }
}

fn render_path(path: &[StepId]) -> String {
    path.iter()
        .map(StepId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

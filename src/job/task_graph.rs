use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::{
    algo,
    stable_graph::{NodeIndex, StableGraph},
    Direction,
};

use super::errors::JobError;

/// Dependency graph over the task positions of a job.
///
/// An edge goes from a predecessor to its successor. Nodes are removed from the graph
/// once their task reaches a terminal state, which also removes the edges to their
/// successors, so a task is available exactly when its node has no incoming edges.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    graph: StableGraph<usize, ()>,
    nodes: HashMap<usize, NodeIndex>,
    done: HashSet<usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node for `position` if there is none.
    pub fn add_node(&mut self, position: usize) {
        if !self.nodes.contains_key(&position) && !self.done.contains(&position) {
            let index = self.graph.add_node(position);
            self.nodes.insert(position, index);
        }
    }

    /// Declares that `successor` may only run once `predecessor` is done.
    pub fn add_dependency(&mut self, predecessor: usize, successor: usize) {
        self.add_node(predecessor);
        self.add_node(successor);
        if let (Some(&from), Some(&to)) = (self.nodes.get(&predecessor), self.nodes.get(&successor))
        {
            if self.graph.find_edge(from, to).is_none() {
                self.graph.add_edge(from, to, ());
            }
        }
    }

    /// Fails if the dependencies contain a cycle.
    pub fn validate(&self) -> Result<(), JobError> {
        if algo::is_cyclic_directed(&self.graph) {
            Err(JobError::CyclicDependency)
        } else {
            Ok(())
        }
    }

    pub fn contains(&self, position: usize) -> bool {
        self.nodes.contains_key(&position) || self.done.contains(&position)
    }

    /// Number of nodes whose task is not done yet.
    pub fn remaining(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_done(&self, position: usize) -> bool {
        self.done.contains(&position)
    }

    /// Positions whose predecessors are all done and which are not done themselves.
    pub fn available_nodes(&self) -> BTreeSet<usize> {
        self.nodes
            .iter()
            .filter(|(_, index)| {
                self.graph
                    .neighbors_directed(**index, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|(position, _)| *position)
            .collect()
    }

    /// Marks the task at `position` as done, unblocking its successors.
    /// Returns whether the node was still pending.
    pub fn node_done(&mut self, position: usize) -> bool {
        match self.nodes.remove(&position) {
            Some(index) => {
                // Removing the node also removes the edges to its successors.
                self.graph.remove_node(index);
                self.done.insert(position);
                true
            }
            None => false,
        }
    }

    /// Positions of the direct predecessors of `position` which are not done yet.
    pub fn pending_predecessors(&self, position: usize) -> Vec<usize> {
        match self.nodes.get(&position) {
            Some(index) => self
                .graph
                .neighbors_directed(*index, Direction::Incoming)
                .map(|predecessor| self.graph[predecessor])
                .collect(),
            None => Vec::new(),
        }
    }

    /// The pending positions in an order compatible with the dependencies.
    /// Ties are broken by position.
    pub fn topological_order(&self) -> Result<Vec<usize>, JobError> {
        let mut remaining = self.clone();
        let mut order = Vec::with_capacity(self.nodes.len());
        while remaining.remaining() > 0 {
            let available = remaining.available_nodes();
            if available.is_empty() {
                return Err(JobError::CyclicDependency);
            }
            for position in available {
                remaining.node_done(position);
                order.push(position);
            }
        }
        Ok(order)
    }

    /// The dependencies between pending positions, as `(predecessor, successor)` pairs.
    pub fn edges(&self) -> Vec<(usize, usize)> {
        self.graph
            .edge_indices()
            .filter_map(|edge| self.graph.edge_endpoints(edge))
            .map(|(from, to)| (self.graph[from], self.graph[to]))
            .collect()
    }

    /// Pending positions, in no particular order.
    pub fn nodes(&self) -> Vec<usize> {
        self.nodes.keys().copied().collect()
    }

    /// Restricts the graph to `positions`, keeping the dependencies between them.
    pub fn subgraph(&self, positions: &BTreeSet<usize>) -> TaskGraph {
        let mut subgraph = TaskGraph::new();
        for position in positions {
            if self.nodes.contains_key(position) {
                subgraph.add_node(*position);
            }
        }
        for (from, to) in self.edges() {
            if positions.contains(&from) && positions.contains(&to) {
                subgraph.add_dependency(from, to);
            }
        }
        subgraph
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Test that a linear chain releases one node at a time.
    #[test]
    fn test_linear_chain_availability() {
        let mut graph = TaskGraph::new();
        graph.add_dependency(0, 1);
        graph.add_dependency(1, 2);
        assert!(graph.validate().is_ok());

        let expected: BTreeSet<usize> = [0].into_iter().collect();
        assert_eq!(
            graph.available_nodes(),
            expected,
            "Only the head should be available."
        );

        assert!(graph.node_done(0));
        assert!(!graph.node_done(0), "A node cannot be completed twice.");
        let expected: BTreeSet<usize> = [1].into_iter().collect();
        assert_eq!(graph.available_nodes(), expected);

        assert!(graph.node_done(1));
        assert!(graph.node_done(2));
        assert!(graph.available_nodes().is_empty());
        assert_eq!(graph.remaining(), 0);
        assert!(graph.is_done(2));
    }

    /// Test that a node with two predecessors waits for both of them.
    #[test]
    fn test_diamond_waits_for_all_predecessors() {
        let mut graph = TaskGraph::new();
        graph.add_dependency(0, 1);
        graph.add_dependency(0, 2);
        graph.add_dependency(1, 3);
        graph.add_dependency(2, 3);

        graph.node_done(0);
        let expected: BTreeSet<usize> = [1, 2].into_iter().collect();
        assert_eq!(graph.available_nodes(), expected);

        graph.node_done(2);
        assert_eq!(graph.pending_predecessors(3), vec![1]);
        assert!(
            !graph.available_nodes().contains(&3),
            "Node 3 still depends on node 1."
        );

        graph.node_done(1);
        assert!(graph.available_nodes().contains(&3));
    }

    /// Test that cycles are rejected.
    #[test]
    fn test_cycle_detection() {
        let mut graph = TaskGraph::new();
        graph.add_dependency(0, 1);
        graph.add_dependency(1, 2);
        graph.add_dependency(2, 0);
        assert!(matches!(graph.validate(), Err(JobError::CyclicDependency)));
        assert!(graph.topological_order().is_err());
    }

    /// Test the topological order and the restriction to a subset of positions.
    #[test]
    fn test_topological_order_and_subgraph() {
        let mut graph = TaskGraph::new();
        graph.add_dependency(3, 1);
        graph.add_dependency(1, 0);
        graph.add_node(2);
        assert_eq!(graph.topological_order().unwrap(), vec![2, 3, 1, 0]);

        let positions: BTreeSet<usize> = [0, 1].into_iter().collect();
        let subgraph = graph.subgraph(&positions);
        assert_eq!(subgraph.remaining(), 2);
        assert_eq!(subgraph.topological_order().unwrap(), vec![1, 0]);
    }
}

use crate::GraphError;
use itertools::Either;
use petgraph::Direction as Edges;
use petgraph::graph::NodeIndex;
use petgraph::prelude::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

/// How a node takes part in control flow. Only the work-list iterator looks at this.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// An ordinary control-bearing node.
    #[default]
    Fixed,
    /// A control merge. When its state changes the work-list iterator enqueues its
    /// [data inputs](ControlFlowGraph::data_inputs) rather than its successors.
    ControlJoin,
    /// A branch. Its post-condition is not merged into its successors by the work-list
    /// iterator.
    ControlSplit,
    /// A node that carries no control; never seeded into the work-list.
    Floating,
}

/// The graph interface consumed by the orderings and the fixpoint iterators.
///
/// Node identities must be stable for the lifetime of the graph. Predecessor and successor
/// lists must mirror each other; [`validate`] checks this.
pub trait ControlFlowGraph {
    type Node: Copy + Eq + Hash + Debug;

    fn entry(&self) -> Self::Node;

    /// The unique exit node, required for backward traversal.
    fn exit(&self) -> Option<Self::Node> {
        None
    }

    fn nodes(&self) -> impl Iterator<Item = Self::Node> + '_;

    fn successors(&self, node: Self::Node) -> impl Iterator<Item = Self::Node> + '_;

    fn predecessors(&self, node: Self::Node) -> impl Iterator<Item = Self::Node> + '_;

    fn kind(&self, _node: Self::Node) -> NodeKind {
        NodeKind::Fixed
    }

    /// Nodes to revisit when the state of a [`NodeKind::ControlJoin`] changes.
    fn data_inputs(&self, node: Self::Node) -> impl Iterator<Item = Self::Node> + '_ {
        self.successors(node)
    }
}

/// Direction in which flow is propagated. Fixed when an ordering or iterator is built.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

/// A view of a graph in a chosen [`Direction`].
///
/// Backward views start at the graph's exit and swap predecessor and successor lists.
#[derive(Debug)]
pub struct Oriented<'g, G: ControlFlowGraph> {
    graph: &'g G,
    direction: Direction,
    entry: G::Node,
}

impl<G: ControlFlowGraph> Clone for Oriented<'_, G> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<G: ControlFlowGraph> Copy for Oriented<'_, G> {}

impl<'g, G: ControlFlowGraph> Oriented<'g, G> {
    pub fn new(graph: &'g G, direction: Direction) -> Result<Self, GraphError<G::Node>> {
        let entry = match direction {
            Direction::Forward => graph.entry(),
            Direction::Backward => graph.exit().ok_or(GraphError::MissingExit)?,
        };
        Ok(Self {
            graph,
            direction,
            entry,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn inner(&self) -> &'g G {
        self.graph
    }
}

impl<G: ControlFlowGraph> ControlFlowGraph for Oriented<'_, G> {
    type Node = G::Node;

    fn entry(&self) -> Self::Node {
        self.entry
    }

    fn exit(&self) -> Option<Self::Node> {
        match self.direction {
            Direction::Forward => self.graph.exit(),
            Direction::Backward => Some(self.graph.entry()),
        }
    }

    fn nodes(&self) -> impl Iterator<Item = Self::Node> + '_ {
        self.graph.nodes()
    }

    fn successors(&self, node: Self::Node) -> impl Iterator<Item = Self::Node> + '_ {
        match self.direction {
            Direction::Forward => Either::Left(self.graph.successors(node)),
            Direction::Backward => Either::Right(self.graph.predecessors(node)),
        }
    }

    fn predecessors(&self, node: Self::Node) -> impl Iterator<Item = Self::Node> + '_ {
        match self.direction {
            Direction::Forward => Either::Left(self.graph.predecessors(node)),
            Direction::Backward => Either::Right(self.graph.successors(node)),
        }
    }

    fn kind(&self, node: Self::Node) -> NodeKind {
        self.graph.kind(node)
    }

    fn data_inputs(&self, node: Self::Node) -> impl Iterator<Item = Self::Node> + '_ {
        self.graph.data_inputs(node)
    }
}

/// Checks that the entry exists and that every edge appears in both adjacency lists.
pub fn validate<G: ControlFlowGraph>(graph: &G) -> Result<(), GraphError<G::Node>> {
    let nodes: HashSet<G::Node> = graph.nodes().collect();
    if !nodes.contains(&graph.entry()) {
        return Err(GraphError::MissingEntry(graph.entry()));
    }
    for &from in &nodes {
        for to in graph.successors(from) {
            if !nodes.contains(&to) {
                return Err(GraphError::UnknownNode(to));
            }
            if !graph.predecessors(to).any(|p| p == from) {
                return Err(GraphError::InconsistentEdge { from, to });
            }
        }
        for pred in graph.predecessors(from) {
            if !nodes.contains(&pred) {
                return Err(GraphError::UnknownNode(pred));
            }
            if !graph.successors(pred).any(|s| s == from) {
                return Err(GraphError::InconsistentEdge { from: pred, to: from });
            }
        }
    }
    Ok(())
}

/// Edge weight of a [`BlockCfg`]. Edges carry no data.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct EmptyEdge;

/// A control-flow graph over block values `B`, stored in a petgraph [`DiGraph`].
///
/// Nodes are identified by their [`NodeIndex`]. Adjacency is reported in edge insertion
/// order.
#[derive(Debug, Clone)]
pub struct BlockCfg<B> {
    graph: DiGraph<B, EmptyEdge>,
    indices: HashMap<B, NodeIndex>,
    entry: NodeIndex,
    exit: Option<NodeIndex>,
}

impl<B: Clone + Eq + Hash> BlockCfg<B> {
    /// Creates a graph containing only its entry block.
    pub fn new(entry: B) -> Self {
        let mut graph = DiGraph::default();
        let idx = graph.add_node(entry.clone());
        let mut indices = HashMap::new();
        indices.insert(entry, idx);
        Self {
            graph,
            indices,
            entry: idx,
            exit: None,
        }
    }

    pub fn graph(&self) -> &DiGraph<B, EmptyEdge> {
        &self.graph
    }

    pub fn add_node(&mut self, block: B) -> NodeIndex {
        if let Some(idx) = self.indices.get(&block) {
            return *idx;
        }
        let idx = self.graph.add_node(block.clone());
        self.indices.insert(block, idx);
        idx
    }

    /// Adds an edge, inserting either block if it is missing. Duplicate edges are ignored.
    pub fn add_edge(&mut self, from: B, to: B) -> (NodeIndex, NodeIndex) {
        let from_idx = self.add_node(from);
        let to_idx = self.add_node(to);
        if self.graph.find_edge(from_idx, to_idx).is_none() {
            self.graph.add_edge(from_idx, to_idx, EmptyEdge);
        }
        (from_idx, to_idx)
    }

    pub fn set_exit(&mut self, block: B) -> NodeIndex {
        let idx = self.add_node(block);
        self.exit = Some(idx);
        idx
    }

    pub fn index_of(&self, block: &B) -> Option<NodeIndex> {
        self.indices.get(block).copied()
    }

    pub fn block(&self, idx: NodeIndex) -> Option<&B> {
        self.graph.node_weight(idx)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn neighbors(&self, node: NodeIndex, dir: Edges) -> impl Iterator<Item = NodeIndex> + '_ {
        // petgraph walks adjacency lists newest-first
        let mut adjacent: Vec<_> = self.graph.neighbors_directed(node, dir).collect();
        adjacent.reverse();
        adjacent.into_iter()
    }
}

impl<B: Clone + Eq + Hash> ControlFlowGraph for BlockCfg<B> {
    type Node = NodeIndex;

    fn entry(&self) -> NodeIndex {
        self.entry
    }

    fn exit(&self) -> Option<NodeIndex> {
        self.exit
    }

    fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    fn successors(&self, node: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.neighbors(node, Edges::Outgoing)
    }

    fn predecessors(&self, node: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.neighbors(node, Edges::Incoming)
    }
}

#[cfg(test)]
mod tests {
    use crate::GraphError;
    use crate::analysis::cfg::{BlockCfg, ControlFlowGraph, Direction, NodeKind, Oriented, validate};
    use crate::analysis::testing::TestCfg;

    #[test]
    fn test_block_cfg_adjacency_order() {
        let mut cfg = BlockCfg::new("entry");
        let (entry, then) = cfg.add_edge("entry", "then");
        let (_, other) = cfg.add_edge("entry", "else");
        let (_, join) = cfg.add_edge("then", "join");
        cfg.add_edge("else", "join");
        cfg.add_edge("else", "join");
        cfg.set_exit("join");

        assert_eq!(cfg.len(), 4);
        assert_eq!(cfg.entry(), entry);
        assert_eq!(cfg.exit(), Some(join));
        assert_eq!(cfg.successors(entry).collect::<Vec<_>>(), vec![then, other]);
        assert_eq!(cfg.predecessors(join).collect::<Vec<_>>(), vec![then, other]);
        assert_eq!(cfg.block(other), Some(&"else"));
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_backward_view_swaps_edges() {
        let cfg = TestCfg::new(&[(0, 1), (1, 2)]).with_exit(2);
        let backward = Oriented::new(&cfg, Direction::Backward).unwrap();
        assert_eq!(backward.entry(), 2);
        assert_eq!(backward.exit(), Some(0));
        assert_eq!(backward.successors(2).collect::<Vec<_>>(), vec![1]);
        assert_eq!(backward.predecessors(0).collect::<Vec<_>>(), vec![1]);

        let no_exit = TestCfg::new(&[(0, 1)]);
        assert!(matches!(
            Oriented::new(&no_exit, Direction::Backward),
            Err(GraphError::MissingExit)
        ));
    }

    #[test]
    fn test_validate_rejects_malformed_graphs() {
        let missing_entry = TestCfg::new(&[(0, 1)]).with_entry(7);
        assert!(matches!(
            validate(&missing_entry),
            Err(GraphError::MissingEntry(7))
        ));

        let lopsided = TestCfg::new(&[(0, 1), (1, 2)]).without_predecessor(2, 1);
        assert!(matches!(
            validate(&lopsided),
            Err(GraphError::InconsistentEdge { from: 1, to: 2 })
        ));
    }

    #[test]
    fn test_graph_settings_are_serializable() {
        fn stored<T: serde::Serialize + serde::de::DeserializeOwned>(_: T) {}
        stored(Direction::Backward);
        stored(NodeKind::ControlSplit);
    }
}

use crate::GraphError;
use crate::analysis::cfg::{ControlFlowGraph, Direction, Oriented, validate};
use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Display, Formatter};
use std::hash::Hash;

/// Marks a node whose component has already been emitted.
const DONE: u32 = u32::MAX;

/// An element of a weak topological ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WtoComponent<N> {
    Vertex(N),
    /// A strongly connected component, visited by iterating `components` after `head`
    /// until the head stabilizes.
    Cycle {
        head: N,
        components: Vec<WtoComponent<N>>,
    },
}

impl<N: Copy> WtoComponent<N> {
    /// The vertex, or the head of the cycle.
    pub fn node(&self) -> N {
        match self {
            WtoComponent::Vertex(n) => *n,
            WtoComponent::Cycle { head, .. } => *head,
        }
    }
}

impl<N: Debug> Display for WtoComponent<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WtoComponent::Vertex(n) => write!(f, "{n:?}"),
            WtoComponent::Cycle { head, components } if components.is_empty() => {
                write!(f, "({head:?})")
            }
            WtoComponent::Cycle { head, components } => {
                write!(f, "({head:?} {})", components.iter().join(" "))
            }
        }
    }
}

/**
A weak topological ordering of the nodes reachable from a graph's entry, computed with
Bourdoncle's algorithm.

Besides the nested components themselves the ordering records, for every node, the heads
of the cycles that enclose it. The iterators use this to tell back edges (an edge into a
head from inside its own cycle) from ordinary forward edges.

Nodes that are unreachable from the entry do not appear in the ordering.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wto<N: Eq + Hash> {
    entry: N,
    direction: Direction,
    components: Vec<WtoComponent<N>>,
    nesting: HashMap<N, Vec<N>>,
    heads: HashSet<N>,
}

impl<N: Copy + Eq + Hash + Debug> Wto<N> {
    pub fn new<G>(graph: &G, direction: Direction) -> Result<Self, GraphError<N>>
    where
        G: ControlFlowGraph<Node = N>,
    {
        let graph = Oriented::new(graph, direction)?;
        validate(&graph)?;
        let components = Bourdoncle::new(&graph).build();

        let mut nesting = HashMap::new();
        let mut heads = HashSet::new();
        let mut pending: Vec<(&WtoComponent<N>, Vec<N>)> =
            components.iter().map(|c| (c, Vec::new())).collect();
        while let Some((component, enclosing)) = pending.pop() {
            match component {
                WtoComponent::Vertex(n) => {
                    nesting.insert(*n, enclosing);
                }
                WtoComponent::Cycle { head, components } => {
                    heads.insert(*head);
                    let mut inner = enclosing.clone();
                    inner.push(*head);
                    nesting.insert(*head, enclosing);
                    pending.extend(components.iter().map(|c| (c, inner.clone())));
                }
            }
        }
        tracing::trace!("built WTO with {} nodes and {} heads", nesting.len(), heads.len());
        Ok(Self {
            entry: graph.entry(),
            direction,
            components,
            nesting,
            heads,
        })
    }

    /// The (oriented) entry the ordering was built from.
    pub fn entry(&self) -> N {
        self.entry
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Fails unless this ordering was built for `graph`'s entry and direction.
    pub(crate) fn check_built_for<G>(&self, graph: &Oriented<'_, G>) -> Result<(), GraphError<N>>
    where
        G: ControlFlowGraph<Node = N>,
    {
        if self.entry == graph.entry() && self.direction == graph.direction() {
            return Ok(());
        }
        Err(GraphError::OrderingMismatch {
            entry: graph.entry(),
            direction: graph.direction(),
            ordering_entry: self.entry,
            ordering_direction: self.direction,
        })
    }

    pub fn components(&self) -> &[WtoComponent<N>] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.nesting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nesting.is_empty()
    }

    pub fn contains_node(&self, node: N) -> bool {
        self.nesting.contains_key(&node)
    }

    pub fn is_head(&self, node: N) -> bool {
        self.heads.contains(&node)
    }

    pub fn heads(&self) -> impl Iterator<Item = N> + '_ {
        self.heads.iter().copied()
    }

    /// Heads of the cycles strictly enclosing `node`, outermost first. A head is not
    /// part of its own nesting.
    pub fn nesting(&self, node: N) -> Option<&[N]> {
        self.nesting.get(&node).map(Vec::as_slice)
    }

    /// Whether `node` belongs to the cycle headed by `head` (a head belongs to its own
    /// cycle).
    pub fn contains(&self, head: N, node: N) -> bool {
        self.is_head(head)
            && (head == node || self.nesting(node).is_some_and(|n| n.contains(&head)))
    }

    /// An edge is a back edge when it targets the head of a cycle containing its source.
    pub fn is_back_edge(&self, from: N, to: N) -> bool {
        self.contains(to, from)
    }

    /// All ordered nodes in visiting order, each head before its body.
    pub fn order(&self) -> Vec<N> {
        let mut order = Vec::with_capacity(self.len());
        let mut pending: Vec<&WtoComponent<N>> = self.components.iter().rev().collect();
        while let Some(component) = pending.pop() {
            order.push(component.node());
            if let WtoComponent::Cycle { components, .. } = component {
                pending.extend(components.iter().rev());
            }
        }
        order
    }
}

impl<N: Eq + Hash + Debug> Display for Wto<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.components.iter().join(" "))
    }
}

struct Visit<N> {
    node: N,
    successors: Vec<N>,
    next: usize,
    head: u32,
    is_loop: bool,
}

impl<N: Copy + Eq + Hash> Visit<N> {
    /// Returns the next successor that still needs a visit, folding the numbers of the
    /// already numbered ones into `head`.
    fn advance(&mut self, dfn: &HashMap<N, u32>) -> Option<N> {
        while let Some(&succ) = self.successors.get(self.next) {
            self.next += 1;
            match dfn.get(&succ) {
                None => return Some(succ),
                Some(&min) => self.absorb(min),
            }
        }
        None
    }

    fn absorb(&mut self, min: u32) {
        if min <= self.head {
            self.head = min;
            self.is_loop = true;
        }
    }
}

struct Component<N> {
    head: N,
    successors: Vec<N>,
    next: usize,
    min: u32,
}

impl<N: Copy + Eq + Hash> Component<N> {
    fn advance(&mut self, dfn: &HashMap<N, u32>) -> Option<N> {
        while let Some(&succ) = self.successors.get(self.next) {
            self.next += 1;
            if !dfn.contains_key(&succ) {
                return Some(succ);
            }
        }
        None
    }
}

enum Frame<N> {
    Visit(Visit<N>),
    Component(Component<N>),
}

enum Finished<N> {
    Returned(u32),
    Cycle(Component<N>),
}

/// Bourdoncle's recursive decomposition, run on an explicit frame stack.
///
/// A node missing from `dfn` has number zero; components are emitted in reverse and
/// flipped when their partition is closed.
struct Bourdoncle<'g, G: ControlFlowGraph> {
    graph: &'g G,
    dfn: HashMap<G::Node, u32>,
    stack: Vec<G::Node>,
    num: u32,
    partitions: Vec<Vec<WtoComponent<G::Node>>>,
}

impl<'g, G: ControlFlowGraph> Bourdoncle<'g, G> {
    fn new(graph: &'g G) -> Self {
        Self {
            graph,
            dfn: HashMap::new(),
            stack: Vec::new(),
            num: 0,
            partitions: vec![Vec::new()],
        }
    }

    fn build(mut self) -> Vec<WtoComponent<G::Node>> {
        let mut frames = vec![self.visit(self.graph.entry())];
        loop {
            let next = match frames.last_mut() {
                Some(Frame::Visit(visit)) => visit.advance(&self.dfn),
                Some(Frame::Component(component)) => component.advance(&self.dfn),
                None => break,
            };
            if let Some(succ) = next {
                frames.push(self.visit(succ));
                continue;
            }
            let returned = match frames.pop() {
                Some(Frame::Visit(visit)) => match self.finish(visit) {
                    Finished::Returned(min) => min,
                    Finished::Cycle(component) => {
                        self.partitions.push(Vec::new());
                        frames.push(Frame::Component(component));
                        continue;
                    }
                },
                Some(Frame::Component(component)) => {
                    let mut components = self.partitions.pop().unwrap_or_default();
                    components.reverse();
                    self.emit(WtoComponent::Cycle {
                        head: component.head,
                        components,
                    });
                    component.min
                }
                None => break,
            };
            if let Some(Frame::Visit(parent)) = frames.last_mut() {
                parent.absorb(returned);
            }
        }
        let mut components = self.partitions.pop().unwrap_or_default();
        components.reverse();
        components
    }

    fn visit(&mut self, node: G::Node) -> Frame<G::Node> {
        self.stack.push(node);
        self.num += 1;
        self.dfn.insert(node, self.num);
        Frame::Visit(Visit {
            node,
            successors: self.graph.successors(node).collect(),
            next: 0,
            head: self.num,
            is_loop: false,
        })
    }

    fn finish(&mut self, visit: Visit<G::Node>) -> Finished<G::Node> {
        if self.dfn.get(&visit.node) != Some(&visit.head) {
            return Finished::Returned(visit.head);
        }
        self.dfn.insert(visit.node, DONE);
        while let Some(elem) = self.stack.pop() {
            if elem == visit.node {
                break;
            }
            self.dfn.remove(&elem);
        }
        if visit.is_loop {
            Finished::Cycle(Component {
                head: visit.node,
                successors: visit.successors,
                next: 0,
                min: visit.head,
            })
        } else {
            self.emit(WtoComponent::Vertex(visit.node));
            Finished::Returned(visit.head)
        }
    }

    fn emit(&mut self, component: WtoComponent<G::Node>) {
        if let Some(partition) = self.partitions.last_mut() {
            partition.push(component);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::GraphError;
    use crate::analysis::cfg::Direction;
    use crate::analysis::ordering::wto::{Wto, WtoComponent};
    use crate::analysis::testing::TestCfg;

    fn nested() -> TestCfg {
        TestCfg::new(&[(0, 1), (1, 2), (2, 3), (3, 2), (2, 4), (4, 1), (1, 5)])
    }

    #[test]
    fn test_straight_line() {
        let cfg = TestCfg::new(&[(0, 1), (1, 2), (2, 3)]);
        let wto = Wto::new(&cfg, Direction::Forward).unwrap();
        assert_eq!(wto.to_string(), "0 1 2 3");
        assert_eq!(wto.heads().count(), 0);
        assert_eq!(wto.order(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_nested_loops() {
        let wto = Wto::new(&nested(), Direction::Forward).unwrap();
        assert_eq!(wto.to_string(), "0 (1 (2 3) 4) 5");
        assert_eq!(wto.order(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(wto.nesting(3), Some(&[1, 2][..]));
        assert_eq!(wto.nesting(2), Some(&[1][..]));
        assert_eq!(wto.nesting(5), Some(&[][..]));
        assert!(wto.is_head(1) && wto.is_head(2));
        assert!(wto.is_back_edge(3, 2));
        assert!(wto.is_back_edge(4, 1));
        assert!(!wto.is_back_edge(1, 2));
        assert!(!wto.is_back_edge(2, 4));
        assert!(wto.contains(1, 3));
        assert!(!wto.contains(2, 4));
    }

    #[test]
    fn test_self_loop_and_irreducible_entry() {
        let self_loop = TestCfg::new(&[(0, 1), (1, 1), (1, 2)]);
        let wto = Wto::new(&self_loop, Direction::Forward).unwrap();
        assert_eq!(wto.to_string(), "0 (1) 2");
        assert!(wto.is_back_edge(1, 1));

        let irreducible = TestCfg::new(&[(0, 1), (0, 2), (1, 2), (2, 1), (2, 3)]);
        let wto = Wto::new(&irreducible, Direction::Forward).unwrap();
        assert_eq!(wto.to_string(), "0 (1 2) 3");
        assert!(wto.is_back_edge(2, 1));
        assert!(!wto.is_back_edge(0, 2));
    }

    #[test]
    fn test_unreachable_nodes_are_left_out() {
        let cfg = TestCfg::new(&[(0, 1), (2, 1)]);
        let wto = Wto::new(&cfg, Direction::Forward).unwrap();
        assert_eq!(wto.components(), &[WtoComponent::Vertex(0), WtoComponent::Vertex(1)]);
        assert!(!wto.contains_node(2));
    }

    #[test]
    fn test_backward_ordering() {
        let cfg = TestCfg::new(&[(0, 1), (1, 2), (2, 1), (2, 3)]).with_exit(3);
        let wto = Wto::new(&cfg, Direction::Backward).unwrap();
        assert_eq!(wto.entry(), 3);
        assert_eq!(wto.to_string(), "3 (2 1) 0");
        assert!(wto.is_back_edge(1, 2));
    }

    #[test]
    fn test_construction_is_pure() {
        let cfg = nested();
        let first = Wto::new(&cfg, Direction::Forward).unwrap();
        let second = Wto::new(&cfg, Direction::Forward).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_malformed_graph() {
        let cfg = TestCfg::new(&[(0, 1)]).with_entry(4);
        assert!(matches!(
            Wto::new(&cfg, Direction::Forward),
            Err(GraphError::MissingEntry(4))
        ));
    }

    #[test]
    fn test_deep_chain_does_not_recurse() {
        let edges: Vec<_> = (0..50_000).map(|n| (n, n + 1)).chain([(50_000, 0)]).collect();
        let cfg = TestCfg::new(&edges);
        let wto = Wto::new(&cfg, Direction::Forward).unwrap();
        assert_eq!(wto.len(), 50_001);
        assert!(wto.is_head(0));
        assert!(wto.is_back_edge(50_000, 0));
    }
}

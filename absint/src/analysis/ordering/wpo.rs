use crate::GraphError;
use crate::analysis::cfg::{ControlFlowGraph, Direction, Oriented};
use crate::analysis::ordering::wto::{Wto, WtoComponent};
use itertools::Itertools;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::hash::Hash;
use std::sync::Arc;

/// What a [WpoNode] stands for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WpoKind<N> {
    /// A node outside of any loop head.
    Plain(N),
    /// A loop head, together with the position of its loop's exit.
    Head { node: N, exit: usize },
    /// The synthetic exit of the loop whose head sits at position `head`. It runs once
    /// the loop body has finished and decides whether the loop iterates again.
    Exit { head: usize },
}

impl<N: Copy> WpoKind<N> {
    /// The graph node at this position. Exits have none.
    pub fn node(&self) -> Option<N> {
        match self {
            WpoKind::Plain(n) | WpoKind::Head { node: n, .. } => Some(*n),
            WpoKind::Exit { .. } => None,
        }
    }
}

/// One scheduling position of a [Wpo].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WpoNode<N> {
    kind: WpoKind<N>,
    successors: Vec<usize>,
    predecessors: Vec<usize>,
    reducible: usize,
    irreducible: Vec<(usize, usize)>,
}

impl<N: Copy> WpoNode<N> {
    pub fn kind(&self) -> WpoKind<N> {
        self.kind
    }

    pub fn successors(&self) -> &[usize] {
        &self.successors
    }

    pub fn predecessors(&self) -> &[usize] {
        &self.predecessors
    }

    pub fn num_predecessors(&self) -> usize {
        self.predecessors.len()
    }

    /// Predecessors that fire again each time the innermost enclosing loop iterates.
    pub fn num_reducible(&self) -> usize {
        self.reducible
    }

    /// For exits: `(position, count)` pairs to add back to dependency counters once the
    /// loop has converged, re-arming edges that enter the loop from outside.
    pub fn irreducible(&self) -> &[(usize, usize)] {
        &self.irreducible
    }
}

/**
A weak partial ordering: the scheduling graph used by the concurrent iterator.

It is derived from a [Wto]. Every plain node and loop head gets a position, and every loop
gets an extra exit position placed after its body. Scheduling edges follow the graph's
forward edges, with three adjustments:

* back edges are dropped; the loop's exit re-runs the head instead,
* an edge leaving one or more loops starts at the exit of the outermost loop it leaves,
* every position without successors feeds the exit of the loop that owns it.

A position runs once all its predecessors have fired. Edges entering a loop from outside
(including irreducible edges into a loop body) fire only once per entry into the loop, so
they are left out of the reducible count and re-armed through the exit's irreducible table.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wpo<N: Eq + Hash> {
    nodes: Vec<WpoNode<N>>,
    positions: HashMap<N, usize>,
    wto: Arc<Wto<N>>,
}

impl<N: Copy + Eq + Hash + Debug> Wpo<N> {
    pub fn new<G>(graph: &G, direction: Direction) -> Result<Self, GraphError<N>>
    where
        G: ControlFlowGraph<Node = N>,
    {
        let wto = Wto::new(graph, direction)?;
        Self::from_wto(graph, Arc::new(wto))
    }

    /// Derives the ordering from an existing [Wto] of `graph`, traversing the graph in the
    /// WTO's direction.
    pub fn from_wto<G>(graph: &G, wto: Arc<Wto<N>>) -> Result<Self, GraphError<N>>
    where
        G: ControlFlowGraph<Node = N>,
    {
        let graph = Oriented::new(graph, wto.direction())?;
        let mut layout = Layout::new(&wto);
        layout.connect(&graph, &wto);
        let nodes = layout.count_dependencies();
        tracing::trace!("derived WPO with {} positions", nodes.len());
        Ok(Self {
            nodes,
            positions: layout.positions,
            wto,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&WpoNode<N>> {
        self.nodes.get(position)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &WpoNode<N>)> {
        self.nodes.iter().enumerate()
    }

    /// Position of the entry node. Always the first.
    pub fn entry(&self) -> usize {
        0
    }

    /// The plain or head position of a graph node.
    pub fn position(&self, node: N) -> Option<usize> {
        self.positions.get(&node).copied()
    }

    /// The graph node at `position`, or the head node for an exit.
    pub fn node(&self, position: usize) -> Option<N> {
        match self.nodes.get(position)?.kind {
            WpoKind::Exit { head } => self.nodes.get(head)?.kind.node(),
            kind => kind.node(),
        }
    }

    /// Every graph node that has a position, in layout order.
    pub fn graph_nodes(&self) -> impl Iterator<Item = N> + '_ {
        self.nodes.iter().filter_map(|n| n.kind.node())
    }

    pub fn wto(&self) -> &Arc<Wto<N>> {
        &self.wto
    }

    pub fn is_back_edge(&self, from: N, to: N) -> bool {
        self.wto.is_back_edge(from, to)
    }
}

impl<N: Copy + Eq + Hash + Debug> Display for Wpo<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (pos, node) in self.iter() {
            match node.kind {
                WpoKind::Plain(n) => write!(f, "{pos}: {n:?}")?,
                WpoKind::Head { node, exit } => write!(f, "{pos}: head {node:?} (exit {exit})")?,
                WpoKind::Exit { head } => match self.node(pos) {
                    Some(n) => write!(f, "{pos}: exit of {n:?} (head {head})")?,
                    None => write!(f, "{pos}: exit (head {head})")?,
                },
            }
            write!(f, " -> [{}]", node.successors.iter().join(", "))?;
            if !node.irreducible.is_empty() {
                let restores = node
                    .irreducible
                    .iter()
                    .map(|(p, c)| format!("{p}+{c}"))
                    .join(", ");
                write!(f, " restores [{restores}]")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

enum Step<'w, N> {
    Enter(&'w WtoComponent<N>),
    Close(usize),
}

/// Positions under construction. `enclosing[p]` lists the head positions of the loops
/// containing `p`, outermost first; a head is inside its own loop, an exit is not.
struct Layout<N> {
    kinds: Vec<WpoKind<N>>,
    enclosing: Vec<Vec<usize>>,
    positions: HashMap<N, usize>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
}

impl<N: Copy + Eq + Hash + Debug> Layout<N> {
    fn new(wto: &Wto<N>) -> Self {
        let mut layout = Self {
            kinds: Vec::new(),
            enclosing: Vec::new(),
            positions: HashMap::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
        };
        let mut loops: Vec<usize> = Vec::new();
        let mut pending: Vec<Step<N>> = wto.components().iter().rev().map(Step::Enter).collect();
        while let Some(step) = pending.pop() {
            match step {
                Step::Enter(WtoComponent::Vertex(n)) => {
                    layout.positions.insert(*n, layout.kinds.len());
                    layout.push(WpoKind::Plain(*n), loops.clone());
                }
                Step::Enter(WtoComponent::Cycle { head, components }) => {
                    let pos = layout.kinds.len();
                    layout.positions.insert(*head, pos);
                    loops.push(pos);
                    layout.push(WpoKind::Head { node: *head, exit: pos }, loops.clone());
                    pending.push(Step::Close(pos));
                    pending.extend(components.iter().rev().map(Step::Enter));
                }
                Step::Close(head) => {
                    loops.pop();
                    let exit = layout.kinds.len();
                    layout.push(WpoKind::Exit { head }, loops.clone());
                    if let Some(WpoKind::Head { exit: e, .. }) = layout.kinds.get_mut(head) {
                        *e = exit;
                    }
                }
            }
        }
        layout
    }

    fn push(&mut self, kind: WpoKind<N>, enclosing: Vec<usize>) {
        self.kinds.push(kind);
        self.enclosing.push(enclosing);
        self.successors.push(Vec::new());
        self.predecessors.push(Vec::new());
    }

    fn exit_of(&self, head: usize) -> usize {
        match self.kinds[head] {
            WpoKind::Head { exit, .. } => exit,
            _ => head,
        }
    }

    fn contains(&self, lp: usize, pos: usize) -> bool {
        self.enclosing[pos].contains(&lp)
    }

    /// The loop a position's leftover control flows into.
    fn owner(&self, pos: usize) -> Option<usize> {
        match self.kinds[pos] {
            WpoKind::Head { .. } => Some(pos),
            _ => self.enclosing[pos].last().copied(),
        }
    }

    /// Loops whose iterations re-fire edges into `pos`, outermost first.
    fn scope_chain(&self, pos: usize) -> &[usize] {
        let enclosing = &self.enclosing[pos];
        match self.kinds[pos] {
            WpoKind::Head { .. } => &enclosing[..enclosing.len().saturating_sub(1)],
            _ => enclosing,
        }
    }

    fn scope(&self, pos: usize) -> Option<usize> {
        match self.kinds[pos] {
            WpoKind::Exit { head } => Some(head),
            _ => self.scope_chain(pos).last().copied(),
        }
    }

    fn add_edge(&mut self, from: usize, to: usize) {
        if !self.successors[from].contains(&to) {
            self.successors[from].push(to);
            self.predecessors[to].push(from);
        }
    }

    fn connect<G: ControlFlowGraph<Node = N>>(&mut self, graph: &G, wto: &Wto<N>) {
        for pos in 0..self.kinds.len() {
            let Some(from) = self.kinds[pos].node() else {
                continue;
            };
            for to in graph.successors(from) {
                let Some(&target) = self.positions.get(&to) else {
                    continue;
                };
                if wto.is_back_edge(from, to) {
                    continue;
                }
                let source = match self.enclosing[pos]
                    .iter()
                    .find(|lp| !self.contains(**lp, target))
                {
                    Some(&outermost) => self.exit_of(outermost),
                    None => pos,
                };
                self.add_edge(source, target);
            }
        }
        for pos in 0..self.kinds.len() {
            if !self.successors[pos].is_empty() {
                continue;
            }
            if let Some(lp) = self.owner(pos) {
                let exit = self.exit_of(lp);
                self.add_edge(pos, exit);
            }
        }
    }

    fn count_dependencies(&self) -> Vec<WpoNode<N>> {
        let mut reducible = vec![0; self.kinds.len()];
        let mut irreducible: Vec<Vec<(usize, usize)>> = vec![Vec::new(); self.kinds.len()];
        for (target, preds) in self.predecessors.iter().enumerate() {
            for &source in preds {
                let outer = self
                    .scope(target)
                    .is_some_and(|lp| !self.contains(lp, source));
                if !outer {
                    reducible[target] += 1;
                    continue;
                }
                let restore_at = self
                    .scope_chain(target)
                    .iter()
                    .find(|lp| !self.contains(**lp, source))
                    .map(|lp| self.exit_of(*lp));
                if let Some(exit) = restore_at {
                    match irreducible[exit].iter_mut().find(|(p, _)| *p == target) {
                        Some((_, count)) => *count += 1,
                        None => irreducible[exit].push((target, 1)),
                    }
                }
            }
        }
        self.kinds
            .iter()
            .zip(reducible)
            .zip(irreducible)
            .enumerate()
            .map(|(pos, ((kind, reducible), irreducible))| WpoNode {
                kind: *kind,
                successors: self.successors[pos].clone(),
                predecessors: self.predecessors[pos].clone(),
                reducible,
                irreducible,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::analysis::cfg::Direction;
    use crate::analysis::ordering::wpo::{Wpo, WpoKind};
    use crate::analysis::testing::TestCfg;

    #[test]
    fn test_acyclic_positions_mirror_the_graph() {
        let cfg = TestCfg::new(&[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let wpo = Wpo::new(&cfg, Direction::Forward).unwrap();
        assert_eq!(wpo.len(), 4);
        let join = wpo.position(3).unwrap();
        let node = wpo.get(join).unwrap();
        assert_eq!(node.num_predecessors(), 2);
        assert_eq!(node.num_reducible(), 2);
        assert!(wpo.iter().all(|(_, n)| n.irreducible().is_empty()));
    }

    #[test]
    fn test_self_loop_gets_an_exit() {
        let cfg = TestCfg::new(&[(0, 1), (1, 1), (1, 2)]);
        let wpo = Wpo::new(&cfg, Direction::Forward).unwrap();
        let kinds: Vec<_> = wpo.iter().map(|(_, n)| n.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                WpoKind::Plain(0),
                WpoKind::Head { node: 1, exit: 2 },
                WpoKind::Exit { head: 1 },
                WpoKind::Plain(2),
            ]
        );
        assert_eq!(wpo.get(1).unwrap().successors(), &[2]);
        assert_eq!(wpo.get(2).unwrap().successors(), &[3]);
        assert_eq!(wpo.node(2), Some(1));
    }

    #[test]
    fn test_nested_loops_lift_exiting_edges() {
        let cfg = TestCfg::new(&[(0, 1), (1, 2), (2, 3), (3, 2), (2, 4), (4, 1), (1, 5)]);
        let wpo = Wpo::new(&cfg, Direction::Forward).unwrap();
        // 0 | head 1 | head 2 | 3 | exit 2 | 4 | exit 1 | 5
        let kinds: Vec<_> = wpo.iter().map(|(_, n)| n.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                WpoKind::Plain(0),
                WpoKind::Head { node: 1, exit: 6 },
                WpoKind::Head { node: 2, exit: 4 },
                WpoKind::Plain(3),
                WpoKind::Exit { head: 2 },
                WpoKind::Plain(4),
                WpoKind::Exit { head: 1 },
                WpoKind::Plain(5),
            ]
        );
        let succs: Vec<Vec<usize>> = wpo.iter().map(|(_, n)| n.successors().to_vec()).collect();
        assert_eq!(
            succs,
            vec![vec![1], vec![2], vec![3], vec![4], vec![5], vec![6], vec![7], vec![]]
        );
        assert!(wpo.iter().all(|(_, n)| n.irreducible().is_empty()));
        assert!(
            wpo.iter()
                .all(|(_, n)| n.num_reducible() == n.num_predecessors())
        );
    }

    #[test]
    fn test_irreducible_entry_is_restored_at_exit() {
        let cfg = TestCfg::new(&[(0, 1), (0, 2), (1, 2), (2, 1), (2, 3)]);
        let wpo = Wpo::new(&cfg, Direction::Forward).unwrap();
        let edges: Vec<(usize, usize)> = wpo
            .iter()
            .flat_map(|(p, n)| n.successors().iter().map(move |s| (p, *s)))
            .collect();
        assert_eq!(edges, vec![(0, 1), (0, 2), (1, 2), (2, 3), (3, 4)]);
        assert_eq!(wpo.get(3).unwrap().kind(), WpoKind::Exit { head: 1 });
        assert_eq!(wpo.get(3).unwrap().irreducible(), &[(2, 1)]);
        let body = wpo.get(2).unwrap();
        assert_eq!(body.num_predecessors(), 2);
        assert_eq!(body.num_reducible(), 1);
    }

    #[test]
    fn test_derivation_is_pure() {
        let cfg = TestCfg::new(&[(0, 1), (0, 2), (1, 2), (2, 1), (2, 3)]);
        let first = Wpo::new(&cfg, Direction::Forward).unwrap();
        let second = Wpo::new(&cfg, Direction::Forward).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_string(), second.to_string());
    }
}

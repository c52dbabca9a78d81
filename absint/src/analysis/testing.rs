//! Graphs and domains shared by the unit tests.

use crate::analysis::cfg::{ControlFlowGraph, NodeKind};
use crate::analysis::lattice::AbstractDomain;
use crate::analysis::lattice::flat::FlatLattice;
use std::collections::{BTreeMap, HashMap};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// Adjacency-list graph over `usize` nodes `0..=max`, entry `0` unless overridden.
#[derive(Debug, Clone)]
pub(crate) struct TestCfg {
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
    entry: usize,
    exit: Option<usize>,
    kinds: HashMap<usize, NodeKind>,
    data_inputs: HashMap<usize, Vec<usize>>,
}

impl TestCfg {
    pub(crate) fn new(edges: &[(usize, usize)]) -> Self {
        let len = edges
            .iter()
            .map(|(a, b)| a.max(b) + 1)
            .max()
            .unwrap_or(1);
        let mut successors = vec![Vec::new(); len];
        let mut predecessors = vec![Vec::new(); len];
        for &(from, to) in edges {
            successors[from].push(to);
            predecessors[to].push(from);
        }
        Self {
            successors,
            predecessors,
            entry: 0,
            exit: None,
            kinds: HashMap::new(),
            data_inputs: HashMap::new(),
        }
    }

    pub(crate) fn with_entry(mut self, entry: usize) -> Self {
        self.entry = entry;
        self
    }

    pub(crate) fn with_exit(mut self, exit: usize) -> Self {
        self.exit = Some(exit);
        self
    }

    pub(crate) fn with_kind(mut self, node: usize, kind: NodeKind) -> Self {
        self.kinds.insert(node, kind);
        self
    }

    pub(crate) fn with_data_inputs(mut self, node: usize, inputs: &[usize]) -> Self {
        self.data_inputs.insert(node, inputs.to_vec());
        self
    }

    pub(crate) fn without_predecessor(mut self, node: usize, pred: usize) -> Self {
        self.predecessors[node].retain(|p| *p != pred);
        self
    }
}

impl ControlFlowGraph for TestCfg {
    type Node = usize;

    fn entry(&self) -> usize {
        self.entry
    }

    fn exit(&self) -> Option<usize> {
        self.exit
    }

    fn nodes(&self) -> impl Iterator<Item = usize> + '_ {
        0..self.successors.len()
    }

    fn successors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.successors[node].iter().copied()
    }

    fn predecessors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.predecessors[node].iter().copied()
    }

    fn kind(&self, node: usize) -> NodeKind {
        self.kinds.get(&node).copied().unwrap_or_default()
    }

    fn data_inputs(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        match self.data_inputs.get(&node) {
            Some(inputs) => inputs.clone(),
            None => self.successors[node].clone(),
        }
        .into_iter()
    }
}

/// `{0, 1, 2, ..., inf}` ordered by magnitude; widening jumps to infinity on growth.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Counter {
    Finite(u64),
    Infinite,
}

impl Counter {
    pub(crate) fn incremented(&self) -> Self {
        match self {
            Counter::Finite(n) => Counter::Finite(n + 1),
            Counter::Infinite => Counter::Infinite,
        }
    }
}

impl AbstractDomain for Counter {
    fn join_with(&mut self, other: &Self) {
        if !other.leq(self) {
            *self = *other;
        }
    }

    fn widen_with(&mut self, other: &Self) {
        if !other.leq(self) {
            *self = Counter::Infinite;
        }
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (_, Counter::Infinite) => true,
            (Counter::Infinite, Counter::Finite(_)) => false,
            (Counter::Finite(a), Counter::Finite(b)) => a <= b,
        }
    }
}

/// A counter whose widening is just the join, so increasing loops never stabilize.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Unbounded(pub(crate) u64);

impl AbstractDomain for Unbounded {
    fn join_with(&mut self, other: &Self) {
        self.0 = self.0.max(other.0);
    }

    fn widen_with(&mut self, other: &Self) {
        self.join_with(other)
    }

    fn leq(&self, other: &Self) -> bool {
        self.0 <= other.0
    }
}

/// Constant propagation environment. A missing variable is unassigned (bottom).
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub(crate) struct Env(pub(crate) BTreeMap<char, FlatLattice<i64>>);

impl Env {
    pub(crate) fn get(&self, var: char) -> Option<FlatLattice<i64>> {
        self.0.get(&var).copied()
    }

    pub(crate) fn with(&self, var: char, value: FlatLattice<i64>) -> Self {
        let mut env = self.clone();
        env.0.insert(var, value);
        env
    }
}

impl AbstractDomain for Env {
    fn join_with(&mut self, other: &Self) {
        for (var, value) in &other.0 {
            self.0
                .entry(*var)
                .and_modify(|v| v.join_with(value))
                .or_insert(*value);
        }
    }

    fn widen_with(&mut self, other: &Self) {
        self.join_with(other)
    }

    fn leq(&self, other: &Self) -> bool {
        self.0
            .iter()
            .all(|(var, value)| other.0.get(var).is_some_and(|o| value.leq(o)))
    }
}

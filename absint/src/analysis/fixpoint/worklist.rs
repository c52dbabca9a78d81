use crate::FixpointError;
use crate::analysis::cfg::{ControlFlowGraph, Direction, NodeKind, Oriented, validate};
use crate::analysis::fixpoint::{Fixpoint, FixpointIterator, Termination, join_incoming};
use crate::analysis::lattice::AbstractDomain;
use crate::analysis::policy::IteratorPolicy;
use crate::analysis::state::AbstractStateMap;
use crate::analysis::transfer::{Checker, TransferFunction, run_checkers};
use std::collections::{HashSet, VecDeque};
use tracing::instrument;

/**
Node-by-node FIFO iteration, without any precomputed ordering.

Incoming states are joined from every predecessor except
[ControlSplit](NodeKind::ControlSplit) nodes. Every node that changes re-enqueues its
successors (or, for a [ControlJoin](NodeKind::ControlJoin), its
[data inputs](ControlFlowGraph::data_inputs)).
Since no loop structure is known, every node is extrapolated when its state grows, not just
loop heads. This makes the results coarser than [WtoIterator](super::WtoIterator) on the
same inputs.

A failing transfer function does not fail the run: it is logged and the run ends with
[Termination::Aborted], keeping the states computed so far.
*/
pub struct WorklistIterator<'a, G: ControlFlowGraph, D, T> {
    graph: Oriented<'a, G>,
    policy: IteratorPolicy,
    transfer: T,
    initial: D,
    states: AbstractStateMap<G::Node, D>,
    checkers: Vec<Box<dyn Checker<G::Node, D> + 'a>>,
}

impl<'a, G, D, T> WorklistIterator<'a, G, D, T>
where
    G: ControlFlowGraph,
    D: AbstractDomain,
    T: TransferFunction<G::Node, D>,
{
    pub fn new(
        graph: &'a G,
        direction: Direction,
        policy: IteratorPolicy,
        transfer: T,
        initial: D,
    ) -> Result<Self, FixpointError<G::Node>> {
        let graph = Oriented::new(graph, direction)?;
        validate(&graph)?;
        Ok(Self {
            graph,
            policy,
            transfer,
            initial,
            states: AbstractStateMap::new(),
            checkers: Vec::new(),
        })
    }

    pub fn with_state_map(mut self, mut states: AbstractStateMap<G::Node, D>) -> Self {
        states.clear();
        self.states = states;
        self
    }

    pub fn with_checker(mut self, checker: impl Checker<G::Node, D> + 'a) -> Self {
        self.checkers.push(Box::new(checker));
        self
    }

    pub fn into_states(self) -> AbstractStateMap<G::Node, D> {
        self.states
    }

    fn incoming(&self, node: G::Node) -> Option<D> {
        let seed = (node == self.graph.entry()).then(|| self.initial.copy_of());
        let preds = self
            .graph
            .predecessors(node)
            .filter(|pred| self.graph.kind(*pred) != NodeKind::ControlSplit);
        join_incoming(seed, preds, |pred| {
            self.states
                .get_post(pred)
                .map(|post| self.transfer.edge(pred, node, post))
        })
    }

    /// Returns whether the pre-condition of `node` changed.
    fn update_pre(&mut self, node: G::Node, incoming: &D) -> Result<bool, FixpointError<G::Node>> {
        if self
            .states
            .get_pre(node)
            .is_some_and(|pre| incoming.leq(pre))
        {
            return Ok(false);
        }
        self.states.extrapolate(node, incoming, &self.policy)?;
        Ok(true)
    }

    fn run(&mut self) -> Result<Termination<G::Node>, FixpointError<G::Node>> {
        let mut queue: VecDeque<G::Node> = VecDeque::new();
        let mut queued: HashSet<G::Node> = HashSet::new();
        for node in self.graph.nodes() {
            if self.graph.kind(node) != NodeKind::Floating && queued.insert(node) {
                queue.push_back(node);
            }
        }

        while let Some(node) = queue.pop_front() {
            queued.remove(&node);
            let Some(incoming) = self.incoming(node) else {
                continue;
            };
            if !self.update_pre(node, &incoming)? {
                continue;
            }
            let Some(pre) = self.states.get_pre(node) else {
                continue;
            };
            let post = match self.transfer.transfer(node, pre) {
                Ok(post) => post,
                Err(source) => {
                    let err = FixpointError::Transfer { node, source };
                    tracing::error!("Abandoning work-list iteration: {err}");
                    return Ok(Termination::Aborted(err));
                }
            };
            tracing::trace!("updated {node:?}");
            self.states.set_post_condition(node, post);
            if let Err(violation) = run_checkers(&self.checkers, node, &self.states) {
                tracing::warn!("Stopping early: {violation}");
                return Ok(Termination::Checker(violation));
            }

            let next: Vec<G::Node> = match self.graph.kind(node) {
                NodeKind::ControlJoin => self.graph.data_inputs(node).collect(),
                _ => self.graph.successors(node).collect(),
            };
            for succ in next {
                if queued.insert(succ) {
                    queue.push_back(succ);
                }
            }
        }
        Ok(Termination::Converged)
    }
}

impl<G, D, T> FixpointIterator for WorklistIterator<'_, G, D, T>
where
    G: ControlFlowGraph,
    D: AbstractDomain,
    T: TransferFunction<G::Node, D>,
{
    type Node = G::Node;
    type Domain = D;

    #[instrument(skip_all)]
    fn iterate_until_fixpoint(&mut self) -> Result<Fixpoint<'_, G::Node, D>, FixpointError<G::Node>> {
        self.states.clear();
        let termination = self.run()?;
        tracing::debug!("Work-list iteration finished with {} states", self.states.len());
        Ok(Fixpoint {
            states: &self.states,
            termination,
        })
    }

    fn states(&self) -> &AbstractStateMap<G::Node, D> {
        &self.states
    }

    fn clear(&mut self) {
        self.states.clear();
    }
}

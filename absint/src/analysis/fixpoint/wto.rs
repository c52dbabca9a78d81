use crate::FixpointError;
use crate::analysis::cfg::{ControlFlowGraph, Direction, Oriented};
use crate::analysis::fixpoint::{Fixpoint, FixpointIterator, Termination, join_incoming};
use crate::analysis::lattice::AbstractDomain;
use crate::analysis::ordering::{Wto, WtoComponent};
use crate::analysis::policy::IteratorPolicy;
use crate::analysis::state::AbstractStateMap;
use crate::analysis::transfer::{Checker, TransferFunction, Violation, run_checkers};
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::instrument;

type Step<N> = Result<ControlFlow<Violation<N>>, FixpointError<N>>;

/**
Sequential iteration over a [Wto].

Components are analyzed in ordering sequence. A vertex is updated once. A cycle seeds its
head from the predecessors outside the loop, then repeatedly runs the head and its nested
components until the state flowing back into the head is already covered by the head's
pre-condition; each unsuccessful round extrapolates the head (see [IteratorPolicy]).
Nested loops keep independent visit counters, and a converged head's counter is reset so
the next round of an enclosing loop starts it from a fresh join budget.
*/
pub struct WtoIterator<'a, G: ControlFlowGraph, D, T> {
    graph: Oriented<'a, G>,
    wto: Arc<Wto<G::Node>>,
    policy: IteratorPolicy,
    transfer: T,
    initial: D,
    states: AbstractStateMap<G::Node, D>,
    checkers: Vec<Box<dyn Checker<G::Node, D> + 'a>>,
}

impl<'a, G, D, T> WtoIterator<'a, G, D, T>
where
    G: ControlFlowGraph,
    D: AbstractDomain,
    T: TransferFunction<G::Node, D>,
{
    /// `initial` is the state flowing into the (oriented) entry.
    pub fn new(
        graph: &'a G,
        direction: Direction,
        policy: IteratorPolicy,
        transfer: T,
        initial: D,
    ) -> Result<Self, FixpointError<G::Node>> {
        let wto = Arc::new(Wto::new(graph, direction)?);
        Ok(Self {
            graph: Oriented::new(graph, direction)?,
            wto,
            policy,
            transfer,
            initial,
            states: AbstractStateMap::new(),
            checkers: Vec::new(),
        })
    }

    /// Uses a previously built ordering of the same graph and direction.
    pub fn with_wto(mut self, wto: Arc<Wto<G::Node>>) -> Result<Self, FixpointError<G::Node>> {
        wto.check_built_for(&self.graph)?;
        self.wto = wto;
        Ok(self)
    }

    /// Reuses the allocation of an existing map. Its contents are discarded.
    pub fn with_state_map(mut self, mut states: AbstractStateMap<G::Node, D>) -> Self {
        states.clear();
        self.states = states;
        self
    }

    pub fn with_checker(mut self, checker: impl Checker<G::Node, D> + 'a) -> Self {
        self.checkers.push(Box::new(checker));
        self
    }

    pub fn wto(&self) -> &Arc<Wto<G::Node>> {
        &self.wto
    }

    /// Hands the state map back, e.g. to reuse it for another procedure.
    pub fn into_states(self) -> AbstractStateMap<G::Node, D> {
        self.states
    }

    fn incoming(&self, node: G::Node, include: impl Fn(G::Node) -> bool) -> Option<D> {
        let seed = (node == self.graph.entry()).then(|| self.initial.copy_of());
        join_incoming(
            seed,
            self.graph.predecessors(node).filter(|p| include(*p)),
            |pred| {
                self.states
                    .get_post(pred)
                    .map(|post| self.transfer.edge(pred, node, post))
            },
        )
    }

    fn apply(&mut self, node: G::Node) -> Step<G::Node> {
        let Some(pre) = self.states.get_pre(node) else {
            return Ok(ControlFlow::Continue(()));
        };
        let post = self
            .transfer
            .transfer(node, pre)
            .map_err(|source| FixpointError::Transfer { node, source })?;
        tracing::trace!("updated {node:?}");
        self.states.set_post_condition(node, post);
        match run_checkers(&self.checkers, node, &self.states) {
            Ok(()) => Ok(ControlFlow::Continue(())),
            Err(violation) => {
                tracing::warn!("Stopping early: {violation}");
                Ok(ControlFlow::Break(violation))
            }
        }
    }

    fn visit(&mut self, component: &WtoComponent<G::Node>) -> Step<G::Node> {
        match component {
            WtoComponent::Vertex(node) => self.update_vertex(*node),
            WtoComponent::Cycle { head, components } => self.update_cycle(*head, components),
        }
    }

    fn update_vertex(&mut self, node: G::Node) -> Step<G::Node> {
        let Some(pre) = self.incoming(node, |_| true) else {
            return Ok(ControlFlow::Continue(()));
        };
        self.states.set_pre_condition(node, pre);
        self.apply(node)
    }

    fn update_cycle(&mut self, head: G::Node, components: &[WtoComponent<G::Node>]) -> Step<G::Node> {
        let Some(pre) = self.incoming(head, |pred| !self.wto.is_back_edge(pred, head)) else {
            return Ok(ControlFlow::Continue(()));
        };
        self.states.set_pre_condition(head, pre);
        loop {
            if let ControlFlow::Break(violation) = self.apply(head)? {
                return Ok(ControlFlow::Break(violation));
            }
            for component in components {
                if let ControlFlow::Break(violation) = self.visit(component)? {
                    return Ok(ControlFlow::Break(violation));
                }
            }
            let Some(incoming) = self.incoming(head, |_| true) else {
                break;
            };
            if self
                .states
                .get_pre(head)
                .is_some_and(|pre| incoming.leq(pre))
            {
                tracing::debug!(
                    "Loop at {head:?} converged after {} extrapolations",
                    self.states.visited_count(head)
                );
                self.states.reset_count(head);
                break;
            }
            self.states.extrapolate(head, &incoming, &self.policy)?;
        }
        Ok(ControlFlow::Continue(()))
    }
}

impl<G, D, T> FixpointIterator for WtoIterator<'_, G, D, T>
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
        let wto = self.wto.clone();
        let mut termination = Termination::Converged;
        for component in wto.components() {
            if let ControlFlow::Break(violation) = self.visit(component)? {
                termination = Termination::Checker(violation);
                break;
            }
        }
        tracing::debug!("WTO iteration finished with {} states", self.states.len());
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

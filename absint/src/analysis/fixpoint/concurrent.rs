use crate::{FixpointError, GraphError};
use crate::analysis::cfg::{ControlFlowGraph, Direction, Oriented};
use crate::analysis::fixpoint::{Fixpoint, FixpointIterator, Termination, join_incoming};
use crate::analysis::lattice::AbstractDomain;
use crate::analysis::ordering::{Wpo, WpoKind, WpoNode};
use crate::analysis::policy::IteratorPolicy;
use crate::analysis::state::{AbstractStateMap, NodeState};
use crate::analysis::transfer::TransferFunction;
use rayon::{Scope, ThreadPool, ThreadPoolBuilder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::instrument;

/**
Deterministic parallel iteration over a [Wpo].

Each position carries a dependency counter initialised to its number of scheduling
predecessors. Finishing a position decrements the counters of its successors, and whichever
worker brings a counter to zero runs that position next. Loop exits decide whether their
loop has stabilized; if not they extrapolate the head and run it again, which re-arms the
loop body.

Because every position performs the same operations as its sequential counterpart and
joins its predecessors in the same order, the result equals that of
[WtoIterator](super::WtoIterator) regardless of the number of workers. Checkers are not
supported by this strategy.
*/
pub struct ConcurrentIterator<'a, G: ControlFlowGraph, D, T> {
    graph: Oriented<'a, G>,
    wpo: Arc<Wpo<G::Node>>,
    policy: IteratorPolicy,
    transfer: T,
    initial: D,
    states: AbstractStateMap<G::Node, D>,
    pool: Option<ThreadPool>,
}

impl<'a, G, D, T> ConcurrentIterator<'a, G, D, T>
where
    G: ControlFlowGraph + Sync,
    G::Node: Send + Sync,
    D: AbstractDomain + Send + Sync,
    T: TransferFunction<G::Node, D> + Sync,
{
    pub fn new(
        graph: &'a G,
        direction: Direction,
        policy: IteratorPolicy,
        transfer: T,
        initial: D,
    ) -> Result<Self, FixpointError<G::Node>> {
        let wpo = Arc::new(Wpo::new(graph, direction)?);
        Ok(Self {
            graph: Oriented::new(graph, direction)?,
            wpo,
            policy,
            transfer,
            initial,
            states: AbstractStateMap::new(),
            pool: None,
        })
    }

    /// Uses a previously built ordering of the same graph and direction.
    pub fn with_wpo(mut self, wpo: Arc<Wpo<G::Node>>) -> Result<Self, FixpointError<G::Node>> {
        wpo.wto().check_built_for(&self.graph)?;
        self.wpo = wpo;
        Ok(self)
    }

    pub fn with_state_map(mut self, mut states: AbstractStateMap<G::Node, D>) -> Self {
        states.clear();
        self.states = states;
        self
    }

    /// Runs on a dedicated pool of `workers` threads instead of rayon's global pool.
    pub fn with_workers(mut self, workers: usize) -> Result<Self, FixpointError<G::Node>> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("absint-worker-{i}"))
            .build()?;
        self.pool = Some(pool);
        Ok(self)
    }

    pub fn wpo(&self) -> &Arc<Wpo<G::Node>> {
        &self.wpo
    }

    pub fn into_states(self) -> AbstractStateMap<G::Node, D> {
        self.states
    }
}

impl<G, D, T> FixpointIterator for ConcurrentIterator<'_, G, D, T>
where
    G: ControlFlowGraph + Sync,
    G::Node: Send + Sync,
    D: AbstractDomain + Send + Sync,
    T: TransferFunction<G::Node, D> + Sync,
{
    type Node = G::Node;
    type Domain = D;

    #[instrument(skip_all)]
    fn iterate_until_fixpoint(&mut self) -> Result<Fixpoint<'_, G::Node, D>, FixpointError<G::Node>> {
        self.states.clear();
        let run = Run::new(
            &self.graph,
            &self.wpo,
            &self.policy,
            &self.transfer,
            &self.initial,
        );
        match &self.pool {
            Some(pool) => pool.scope(|scope| run.start(scope)),
            None => rayon::scope(|scope| run.start(scope)),
        }
        run.finish(&mut self.states)?;
        tracing::debug!("Concurrent iteration finished with {} states", self.states.len());
        Ok(Fixpoint {
            states: &self.states,
            termination: Termination::Converged,
        })
    }

    fn states(&self) -> &AbstractStateMap<G::Node, D> {
        &self.states
    }

    fn clear(&mut self) {
        self.states.clear();
    }
}

/// A scheduling position together with its outstanding dependency count.
struct WorkNode<'w, N> {
    position: usize,
    node: &'w WpoNode<N>,
    refcount: AtomicUsize,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum HeadMode {
    /// Entered from outside the loop; the pre-condition is recomputed.
    Fresh,
    /// Re-run by the loop's exit after extrapolation.
    Iterate,
}

fn lock<T>(cell: &Mutex<T>) -> MutexGuard<'_, T> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared state of one run. Cells exist for every ordered node before any worker starts,
/// and no code path holds two cell locks at once.
struct Run<'r, G: ControlFlowGraph, D, T> {
    graph: &'r Oriented<'r, G>,
    wpo: &'r Wpo<G::Node>,
    policy: &'r IteratorPolicy,
    transfer: &'r T,
    initial: &'r D,
    cells: HashMap<G::Node, Mutex<NodeState<D>>>,
    work: Vec<WorkNode<'r, G::Node>>,
    error: Mutex<Option<FixpointError<G::Node>>>,
    aborted: AtomicBool,
}

impl<'r, G, D, T> Run<'r, G, D, T>
where
    G: ControlFlowGraph + Sync,
    G::Node: Send + Sync,
    D: AbstractDomain + Send + Sync,
    T: TransferFunction<G::Node, D> + Sync,
{
    fn new(
        graph: &'r Oriented<'r, G>,
        wpo: &'r Wpo<G::Node>,
        policy: &'r IteratorPolicy,
        transfer: &'r T,
        initial: &'r D,
    ) -> Self {
        let cells = wpo
            .graph_nodes()
            .map(|n| (n, Mutex::new(NodeState::default())))
            .collect();
        let work = wpo
            .iter()
            .map(|(position, node)| WorkNode {
                position,
                node,
                refcount: AtomicUsize::new(node.num_predecessors()),
            })
            .collect();
        Self {
            graph,
            wpo,
            policy,
            transfer,
            initial,
            cells,
            work,
            error: Mutex::new(None),
            aborted: AtomicBool::new(false),
        }
    }

    fn start<'s>(&'s self, scope: &Scope<'s>) {
        if !self.work.is_empty() {
            self.schedule(scope, self.wpo.entry());
        }
    }

    /// Moves the cells into `states`, or returns the first error a worker hit.
    fn finish(self, states: &mut AbstractStateMap<G::Node, D>) -> Result<(), FixpointError<G::Node>> {
        let error = self
            .error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        for (node, cell) in self.cells {
            let state = cell.into_inner().unwrap_or_else(PoisonError::into_inner);
            if state.is_touched() {
                states.insert(node, state);
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn schedule<'s>(&'s self, scope: &Scope<'s>, position: usize) {
        scope.spawn(move |scope| self.execute(scope, position));
    }

    fn execute<'s>(&'s self, scope: &Scope<'s>, position: usize) {
        if self.aborted.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.update(scope, position) {
            self.fail(err);
        }
    }

    fn fail(&self, err: FixpointError<G::Node>) {
        tracing::debug!("Worker failed: {err}");
        let mut slot = lock(&self.error);
        if slot.is_none() {
            *slot = Some(err);
        }
        self.aborted.store(true, Ordering::Release);
    }

    fn update<'s>(&'s self, scope: &Scope<'s>, position: usize) -> Result<(), FixpointError<G::Node>> {
        let work = &self.work[position];
        match work.node.kind() {
            WpoKind::Plain(node) => {
                if let Some(pre) = self.incoming(node, |_| true) {
                    lock(self.cell(node)?).set_pre(pre);
                    self.apply(node)?;
                }
                self.release(scope, work);
            }
            WpoKind::Head { node, .. } => {
                self.update_head(node, HeadMode::Fresh)?;
                self.release(scope, work);
            }
            WpoKind::Exit { head } => self.update_head_back_edge(scope, work, head)?,
        }
        Ok(())
    }

    fn update_head(&self, head: G::Node, mode: HeadMode) -> Result<(), FixpointError<G::Node>> {
        if mode == HeadMode::Fresh {
            let Some(pre) = self.incoming(head, |pred| !self.wpo.is_back_edge(pred, head)) else {
                return Ok(());
            };
            lock(self.cell(head)?).set_pre(pre);
        }
        self.apply(head)
    }

    /// Runs at a loop's exit once the loop body has finished a round.
    fn update_head_back_edge<'s>(
        &'s self,
        scope: &Scope<'s>,
        exit: &WorkNode<'r, G::Node>,
        head_position: usize,
    ) -> Result<(), FixpointError<G::Node>> {
        let head_work = &self.work[head_position];
        let Some(head) = head_work.node.kind().node() else {
            return Ok(());
        };
        let incoming = self.incoming(head, |_| true);
        let cell = self.cell(head)?;
        let converged = {
            let mut state = lock(cell);
            match &incoming {
                Some(incoming) if !state.pre().is_some_and(|pre| incoming.leq(pre)) => {
                    state.extrapolate(head, incoming, self.policy)?;
                    false
                }
                _ => {
                    tracing::debug!(
                        "Loop at {head:?} converged after {} extrapolations",
                        state.visits()
                    );
                    state.reset_count();
                    true
                }
            }
        };
        if converged {
            for &(position, count) in exit.node.irreducible() {
                self.work[position]
                    .refcount
                    .fetch_add(count, Ordering::AcqRel);
            }
            self.release(scope, exit);
        } else {
            exit.refcount
                .store(exit.node.num_reducible(), Ordering::Release);
            self.update_head(head, HeadMode::Iterate)?;
            self.release(scope, head_work);
        }
        Ok(())
    }

    /// Re-arms `work` for the next round of its loop and hands its successors the token.
    fn release<'s>(&'s self, scope: &Scope<'s>, work: &WorkNode<'r, G::Node>) {
        work.refcount
            .store(work.node.num_reducible(), Ordering::Release);
        for &succ in work.node.successors() {
            if self.work[succ].refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
                tracing::trace!("position {} enables {succ}", work.position);
                self.schedule(scope, succ);
            }
        }
    }

    fn cell(&self, node: G::Node) -> Result<&Mutex<NodeState<D>>, FixpointError<G::Node>> {
        self.cells
            .get(&node)
            .ok_or(FixpointError::Graph(GraphError::UnknownNode(node)))
    }

    fn incoming(&self, node: G::Node, include: impl Fn(G::Node) -> bool) -> Option<D> {
        let seed = (node == self.graph.entry()).then(|| self.initial.copy_of());
        join_incoming(
            seed,
            self.graph.predecessors(node).filter(|p| include(*p)),
            |pred| {
                let cell = self.cells.get(&pred)?;
                let state = lock(cell);
                state
                    .post()
                    .map(|post| self.transfer.edge(pred, node, post))
            },
        )
    }

    fn apply(&self, node: G::Node) -> Result<(), FixpointError<G::Node>> {
        let cell = self.cell(node)?;
        let Some(pre) = lock(cell).pre().map(D::copy_of) else {
            return Ok(());
        };
        let post = self
            .transfer
            .transfer(node, &pre)
            .map_err(|source| FixpointError::Transfer { node, source })?;
        tracing::trace!("updated {node:?}");
        lock(cell).set_post(post);
        Ok(())
    }
}

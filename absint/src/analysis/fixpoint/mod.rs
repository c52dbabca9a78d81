//! The fixpoint iterators.
//!
//! All strategies share the same per-node operations: a node's incoming state is the
//! entry's initial value (if it is the entry) joined with the edge-filtered post-conditions
//! of its predecessors, in predecessor order. Keeping the join order identical is what lets
//! the concurrent iterator reproduce the sequential result exactly.

#[cfg(feature = "rayon")]
pub mod concurrent;
pub mod worklist;
pub mod wto;

#[cfg(feature = "rayon")]
pub use concurrent::ConcurrentIterator;
pub use worklist::WorklistIterator;
pub use wto::WtoIterator;

use crate::FixpointError;
use crate::analysis::lattice::AbstractDomain;
use crate::analysis::state::AbstractStateMap;
use crate::analysis::transfer::Violation;
use std::fmt::Debug;
use std::hash::Hash;

/// How a run ended.
#[derive(Debug)]
pub enum Termination<N: Debug> {
    /// Every node reached its fixpoint.
    Converged,
    /// A checker reported a violation and the run stopped early.
    Checker(Violation<N>),
    /// The run gave up after a recoverable failure. States computed so far are kept.
    Aborted(FixpointError<N>),
}

impl<N: Debug> Termination<N> {
    pub fn is_converged(&self) -> bool {
        matches!(self, Termination::Converged)
    }
}

/// The outcome of [FixpointIterator::iterate_until_fixpoint].
#[derive(Debug)]
pub struct Fixpoint<'a, N: Debug, D> {
    pub states: &'a AbstractStateMap<N, D>,
    pub termination: Termination<N>,
}

impl<N: Debug, D> Fixpoint<'_, N, D> {
    pub fn is_converged(&self) -> bool {
        self.termination.is_converged()
    }
}

/**
Common interface of the iteration strategies.

A run starts from an empty [AbstractStateMap] (the previous run's states are discarded),
so calling [iterate_until_fixpoint](Self::iterate_until_fixpoint) twice yields the same
result. Errors returned from a run are fatal: the map is left in whatever state the run
reached and should be cleared before reuse.
*/
pub trait FixpointIterator {
    type Node: Copy + Eq + Hash + Debug;
    type Domain: AbstractDomain;

    fn iterate_until_fixpoint(
        &mut self,
    ) -> Result<Fixpoint<'_, Self::Node, Self::Domain>, FixpointError<Self::Node>>;

    fn states(&self) -> &AbstractStateMap<Self::Node, Self::Domain>;

    /// Drops all recorded states, keeping the allocation.
    fn clear(&mut self);

    fn get_pre_condition(&self, node: Self::Node) -> Option<&Self::Domain> {
        self.states().get_pre(node)
    }

    fn get_post_condition(&self, node: Self::Node) -> Option<&Self::Domain> {
        self.states().get_post(node)
    }
}

/// Joins `seed` with the contribution of every predecessor that has one, in order.
pub(crate) fn join_incoming<N, D, I, F>(seed: Option<D>, preds: I, contribution: F) -> Option<D>
where
    D: AbstractDomain,
    I: IntoIterator<Item = N>,
    F: FnMut(N) -> Option<D>,
{
    preds
        .into_iter()
        .filter_map(contribution)
        .fold(seed, |acc, state| match acc {
            None => Some(state),
            Some(mut acc) => {
                acc.join_with(&state);
                Some(acc)
            }
        })
}

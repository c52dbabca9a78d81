use crate::analysis::cfg::Direction;
use thiserror::Error;

/// Error type returned by caller-supplied transfer functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Problems with an input graph. These are reported before any iteration begins.
#[derive(Debug, Error)]
pub enum GraphError<N> {
    #[error("Entry node {0:?} is not a node of the graph")]
    MissingEntry(N),
    #[error("Backward traversal requested on a graph without an exit node")]
    MissingExit,
    #[error("Node {0:?} is referenced by an edge but is not a node of the graph")]
    UnknownNode(N),
    #[error("Edge {from:?} -> {to:?} is not mirrored between the successor and predecessor lists")]
    InconsistentEdge { from: N, to: N },
    #[error(
        "Ordering was built from {ordering_entry:?} ({ordering_direction:?}) but the graph is iterated from {entry:?} ({direction:?})"
    )]
    OrderingMismatch {
        entry: N,
        direction: Direction,
        ordering_entry: N,
        ordering_direction: Direction,
    },
}

#[derive(Debug, Error)]
pub enum FixpointError<N> {
    #[error(
        "No fixpoint at {node:?} after {visits} extrapolations (policy allows {max_join_iterations} joins and {max_widen_iterations} widenings); the widening operator does not stabilize"
    )]
    NonConvergence {
        node: N,
        visits: usize,
        max_join_iterations: usize,
        max_widen_iterations: usize,
    },
    #[error("Transfer function failed at {node:?}")]
    Transfer {
        node: N,
        #[source]
        source: BoxError,
    },
    #[error("Malformed control-flow graph")]
    Graph(#[from] GraphError<N>),
    #[cfg(feature = "rayon")]
    #[error("Could not start the worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl<N> FixpointError<N> {
    /// Whether this error is the fatal non-convergence condition.
    pub fn is_non_convergence(&self) -> bool {
        matches!(self, FixpointError::NonConvergence { .. })
    }
}

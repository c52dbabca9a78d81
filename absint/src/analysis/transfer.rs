use crate::BoxError;
use crate::analysis::lattice::AbstractDomain;
use crate::analysis::state::AbstractStateMap;
use std::fmt::Debug;
use thiserror::Error;

/// The effect of a block on the abstract state.
///
/// Implementations must be monotone: a larger pre-condition never yields a smaller
/// post-condition. Closures `Fn(N, &D) -> Result<D, BoxError>` implement this trait
/// directly.
pub trait TransferFunction<N, D: AbstractDomain> {
    fn transfer(&self, node: N, pre: &D) -> Result<D, BoxError>;

    /// Filters the post-condition of `from` as it flows along the edge to `to`.
    fn edge(&self, _from: N, _to: N, post: &D) -> D {
        post.copy_of()
    }
}

impl<N, D, F> TransferFunction<N, D> for F
where
    D: AbstractDomain,
    F: Fn(N, &D) -> Result<D, BoxError>,
{
    fn transfer(&self, node: N, pre: &D) -> Result<D, BoxError> {
        self(node, pre)
    }
}

/// A property checked against the states of a node right after it is updated.
///
/// Returning an error stops the run early; the iterator reports it as a [Violation].
pub trait Checker<N, D> {
    fn name(&self) -> &str;

    fn check(&self, node: N, states: &AbstractStateMap<N, D>) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("checker `{checker}` failed at {node:?}: {message}")]
pub struct Violation<N: Debug> {
    pub checker: String,
    pub node: N,
    pub message: String,
}

pub(crate) fn run_checkers<N, D>(
    checkers: &[Box<dyn Checker<N, D> + '_>],
    node: N,
    states: &AbstractStateMap<N, D>,
) -> Result<(), Violation<N>>
where
    N: Copy + Debug,
{
    for checker in checkers {
        if let Err(message) = checker.check(node, states) {
            return Err(Violation {
                checker: checker.name().to_string(),
                node,
                message,
            });
        }
    }
    Ok(())
}

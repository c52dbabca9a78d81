pub mod analysis;
mod error;

pub use error::{BoxError, FixpointError, GraphError};

pub use analysis::cfg::{BlockCfg, ControlFlowGraph, Direction, NodeKind};
#[cfg(feature = "rayon")]
pub use analysis::fixpoint::ConcurrentIterator;
pub use analysis::fixpoint::{
    Fixpoint, FixpointIterator, Termination, WorklistIterator, WtoIterator,
};
pub use analysis::lattice::AbstractDomain;
pub use analysis::ordering::{OrderingCache, Wpo, Wto};
pub use analysis::policy::IteratorPolicy;
pub use analysis::state::AbstractStateMap;
pub use analysis::transfer::{Checker, TransferFunction, Violation};

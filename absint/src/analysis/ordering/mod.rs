//! Precomputed visiting orders.
//!
//! Both orderings are pure functions of the graph and the traversal direction, so they can
//! be built once per procedure and shared (see [cache::OrderingCache]).

pub mod cache;
pub mod wpo;
pub mod wto;

pub use cache::OrderingCache;
pub use wpo::{Wpo, WpoKind, WpoNode};
pub use wto::{Wto, WtoComponent};

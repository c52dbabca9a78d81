use serde::{Deserialize, Serialize};

/// Controls how loop heads are extrapolated.
///
/// A head is joined for its first `max_join_iterations` extrapolations and widened for the
/// following `max_widen_iterations`. Needing more than that is reported as
/// [NonConvergence](crate::FixpointError::NonConvergence).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct IteratorPolicy {
    pub max_join_iterations: usize,
    pub max_widen_iterations: usize,
}

impl Default for IteratorPolicy {
    fn default() -> Self {
        Self {
            max_join_iterations: 10,
            max_widen_iterations: 20,
        }
    }
}

/// The operator chosen for one extrapolation step.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Extrapolation {
    /// The node had no pre-condition yet; the incoming state was stored as is.
    Seeded,
    Join,
    Widen,
}

impl IteratorPolicy {
    pub const fn new(max_join_iterations: usize, max_widen_iterations: usize) -> Self {
        Self {
            max_join_iterations,
            max_widen_iterations,
        }
    }

    /// Total number of extrapolations a node may undergo.
    pub fn ceiling(&self) -> usize {
        self.max_join_iterations
            .saturating_add(self.max_widen_iterations)
    }

    /// The operator for a node that has already been extrapolated `visits` times, or
    /// `None` once the budget is spent.
    pub fn operator(&self, visits: usize) -> Option<Extrapolation> {
        if visits >= self.ceiling() {
            None
        } else if visits < self.max_join_iterations {
            Some(Extrapolation::Join)
        } else {
            Some(Extrapolation::Widen)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::analysis::policy::{Extrapolation, IteratorPolicy};

    #[test]
    fn test_operator_schedule() {
        let policy = IteratorPolicy::new(2, 1);
        assert_eq!(policy.operator(0), Some(Extrapolation::Join));
        assert_eq!(policy.operator(1), Some(Extrapolation::Join));
        assert_eq!(policy.operator(2), Some(Extrapolation::Widen));
        assert_eq!(policy.operator(3), None);

        let eager = IteratorPolicy::new(0, 3);
        assert_eq!(eager.operator(0), Some(Extrapolation::Widen));
        assert_eq!(IteratorPolicy::default(), IteratorPolicy::new(10, 20));
    }
}

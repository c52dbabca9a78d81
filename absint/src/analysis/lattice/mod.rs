pub mod flat;

use std::fmt::Debug;

/**
The value type every analysis must provide.

Values form a join-semilattice under [join_with](AbstractDomain::join_with) and
[leq](AbstractDomain::leq). Lattices without finite ascending chains must also provide
a [widen_with](AbstractDomain::widen_with) that over-approximates the join and
stabilizes any ascending chain after finitely many applications; the fixpoint
iterators switch to it once a loop head has exhausted its join budget (see
[IteratorPolicy](crate::analysis::policy::IteratorPolicy)).

There is no bottom element in this contract: "no state yet" is represented by the
absence of a value in the [AbstractStateMap](crate::analysis::state::AbstractStateMap).
*/
pub trait AbstractDomain: Clone + Debug {
    /// In-place least upper bound. Must be commutative, idempotent and monotonic.
    fn join_with(&mut self, other: &Self);

    /// In-place widening. The result must be `>=` the join of the two operands.
    fn widen_with(&mut self, other: &Self);

    /// Partial order test.
    fn leq(&self, other: &Self) -> bool;

    /// An independent copy of this value.
    fn copy_of(&self) -> Self {
        self.clone()
    }
}

impl<A, B> AbstractDomain for (A, B)
where
    A: AbstractDomain,
    B: AbstractDomain,
{
    fn join_with(&mut self, other: &Self) {
        self.0.join_with(&other.0);
        self.1.join_with(&other.1);
    }

    fn widen_with(&mut self, other: &Self) {
        self.0.widen_with(&other.0);
        self.1.widen_with(&other.1);
    }

    fn leq(&self, other: &Self) -> bool {
        self.0.leq(&other.0) && self.1.leq(&other.1)
    }
}

#[cfg(test)]
mod tests {
    use crate::analysis::lattice::AbstractDomain;
    use crate::analysis::lattice::flat::FlatLattice;

    #[test]
    fn test_product_is_componentwise() {
        let mut a = (FlatLattice::Value(1), FlatLattice::Value('x'));
        let b = (FlatLattice::Value(1), FlatLattice::Value('y'));
        assert!(!a.leq(&b));
        a.join_with(&b);
        assert_eq!(a, (FlatLattice::Value(1), FlatLattice::Top));
        assert!(b.leq(&a));
        assert!(!a.leq(&b));
    }
}

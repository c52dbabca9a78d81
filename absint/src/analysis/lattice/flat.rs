use crate::analysis::lattice::AbstractDomain;
use std::fmt::{Debug, Display, Formatter};
use std::hash::Hash;

/// A single known value, or Top when more than one value is possible.
///
/// The lattice has height two, so widening is the join.
#[derive(PartialEq, Eq, Copy, Clone, Hash, Debug)]
pub enum FlatLattice<C> {
    Value(C),
    Top,
}

impl<C> From<C> for FlatLattice<C> {
    fn from(value: C) -> Self {
        FlatLattice::Value(value)
    }
}

impl<C: Display> Display for FlatLattice<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatLattice::Value(a) => write!(f, "{a}"),
            FlatLattice::Top => write!(f, "T"),
        }
    }
}

impl<C> FlatLattice<C> {
    pub fn is_top(&self) -> bool {
        matches!(self, FlatLattice::Top)
    }

    pub fn value(&self) -> Option<&C> {
        match self {
            FlatLattice::Value(c) => Some(c),
            FlatLattice::Top => None,
        }
    }
}

impl<C: Clone + Debug + Eq> AbstractDomain for FlatLattice<C> {
    fn join_with(&mut self, other: &Self) {
        match (&self, other) {
            (Self::Top, _) => (),
            (_, Self::Top) => *self = Self::Top,
            (Self::Value(a), Self::Value(b)) => {
                if a != b {
                    *self = Self::Top
                }
            }
        };
    }

    fn widen_with(&mut self, other: &Self) {
        self.join_with(other)
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (_, Self::Top) => true,
            (Self::Top, Self::Value(_)) => false,
            (Self::Value(a), Self::Value(b)) => a == b,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::analysis::lattice::AbstractDomain;
    use crate::analysis::lattice::flat::FlatLattice;

    #[test]
    pub fn test_flat_lattice() {
        let val1 = FlatLattice::Value(4u64);
        let val2 = FlatLattice::Value(5u64);
        let top = FlatLattice::Top;
        assert!(val1.leq(&val1));
        assert!(val1.leq(&top));
        assert!(val2.leq(&top));
        assert!(!top.leq(&val1));
        assert!(!val1.leq(&val2));
        assert!(!val2.leq(&val1));

        let mut joined = val1;
        joined.join_with(&val1);
        assert_eq!(joined, val1);
        joined.join_with(&val2);
        assert!(joined.is_top());
        assert_eq!(joined.value(), None);
    }
}

use crate::FixpointError;
use crate::analysis::lattice::AbstractDomain;
use crate::analysis::policy::{Extrapolation, IteratorPolicy};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;

/// The states recorded for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState<D> {
    pre: Option<D>,
    post: Option<D>,
    visits: usize,
}

impl<D> Default for NodeState<D> {
    fn default() -> Self {
        Self {
            pre: None,
            post: None,
            visits: 0,
        }
    }
}

impl<D: AbstractDomain> NodeState<D> {
    pub fn pre(&self) -> Option<&D> {
        self.pre.as_ref()
    }

    pub fn post(&self) -> Option<&D> {
        self.post.as_ref()
    }

    /// Number of extrapolations since the counter was last reset.
    pub fn visits(&self) -> usize {
        self.visits
    }

    pub(crate) fn set_pre(&mut self, pre: D) {
        self.pre = Some(pre);
    }

    pub(crate) fn set_post(&mut self, post: D) {
        self.post = Some(post);
    }

    pub(crate) fn reset_count(&mut self) {
        self.visits = 0;
    }

    #[cfg_attr(not(feature = "rayon"), allow(dead_code))]
    pub(crate) fn is_touched(&self) -> bool {
        self.pre.is_some() || self.post.is_some()
    }

    /// Merges `incoming` into the pre-condition with the operator `policy` prescribes for
    /// the current visit count.
    pub(crate) fn extrapolate<N>(
        &mut self,
        node: N,
        incoming: &D,
        policy: &IteratorPolicy,
    ) -> Result<Extrapolation, FixpointError<N>> {
        let Some(pre) = self.pre.as_mut() else {
            self.pre = Some(incoming.copy_of());
            return Ok(Extrapolation::Seeded);
        };
        let op = policy
            .operator(self.visits)
            .ok_or(FixpointError::NonConvergence {
                node,
                visits: self.visits,
                max_join_iterations: policy.max_join_iterations,
                max_widen_iterations: policy.max_widen_iterations,
            })?;
        self.visits += 1;
        match op {
            Extrapolation::Join => pre.join_with(incoming),
            Extrapolation::Widen => pre.widen_with(incoming),
            Extrapolation::Seeded => {}
        }
        Ok(op)
    }
}

/// Pre- and post-conditions for every node an iterator has reached.
///
/// Entries are created on first write. The map belongs to a single iterator while it
/// runs; [clear](AbstractStateMap::clear) keeps the allocation for the next procedure.
#[derive(Debug, Clone)]
pub struct AbstractStateMap<N, D> {
    states: HashMap<N, NodeState<D>>,
}

impl<N: Eq + Hash, D: PartialEq> PartialEq for AbstractStateMap<N, D> {
    fn eq(&self, other: &Self) -> bool {
        self.states == other.states
    }
}

impl<N, D> Default for AbstractStateMap<N, D> {
    fn default() -> Self {
        Self {
            states: HashMap::new(),
        }
    }
}

impl<N: Copy + Eq + Hash, D: AbstractDomain> AbstractStateMap<N, D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: N) -> Option<&NodeState<D>> {
        self.states.get(&node)
    }

    pub fn get_pre(&self, node: N) -> Option<&D> {
        self.states.get(&node).and_then(NodeState::pre)
    }

    pub fn get_post(&self, node: N) -> Option<&D> {
        self.states.get(&node).and_then(NodeState::post)
    }

    pub fn set_pre_condition(&mut self, node: N, pre: D) {
        self.entry(node).set_pre(pre);
    }

    pub fn set_post_condition(&mut self, node: N, post: D) {
        self.entry(node).set_post(post);
    }

    pub fn visited_count(&self, node: N) -> usize {
        self.states.get(&node).map(NodeState::visits).unwrap_or(0)
    }

    /// Zeroes the visit counter of `node`, so a converged loop head starts with a fresh
    /// join budget the next time an enclosing loop re-enters it.
    pub fn reset_count(&mut self, node: N) {
        if let Some(state) = self.states.get_mut(&node) {
            state.reset_count();
        }
    }

    /// See [IteratorPolicy] for the operator schedule.
    pub fn extrapolate(
        &mut self,
        node: N,
        incoming: &D,
        policy: &IteratorPolicy,
    ) -> Result<Extrapolation, FixpointError<N>> {
        self.entry(node).extrapolate(node, incoming, policy)
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn contains(&self, node: N) -> bool {
        self.states.contains_key(&node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = N> + '_ {
        self.states.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (N, &NodeState<D>)> {
        self.states.iter().map(|(n, s)| (*n, s))
    }

    #[cfg_attr(not(feature = "rayon"), allow(dead_code))]
    pub(crate) fn insert(&mut self, node: N, state: NodeState<D>) {
        self.states.insert(node, state);
    }

    fn entry(&mut self, node: N) -> &mut NodeState<D> {
        match self.states.entry(node) {
            Entry::Occupied(o) => o.into_mut(),
            Entry::Vacant(v) => v.insert(NodeState::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::FixpointError;
    use crate::analysis::policy::{Extrapolation, IteratorPolicy};
    use crate::analysis::state::AbstractStateMap;
    use crate::analysis::testing::Counter;

    #[test]
    fn test_entries_are_created_lazily() {
        let mut states: AbstractStateMap<usize, Counter> = AbstractStateMap::new();
        assert!(states.is_empty());
        assert_eq!(states.get_pre(3), None);
        assert_eq!(states.visited_count(3), 0);

        states.set_post_condition(3, Counter::Finite(1));
        assert_eq!(states.len(), 1);
        assert_eq!(states.get_pre(3), None);
        assert_eq!(states.get_post(3), Some(&Counter::Finite(1)));

        states.clear();
        assert!(!states.contains(3));
    }

    #[test]
    fn test_maps_compare_by_contents() {
        let mut first: AbstractStateMap<usize, Counter> = AbstractStateMap::new();
        let mut second: AbstractStateMap<usize, Counter> = AbstractStateMap::new();
        first.set_pre_condition(1, Counter::Finite(0));
        first.set_post_condition(2, Counter::Finite(1));
        second.set_post_condition(2, Counter::Finite(1));
        assert_ne!(first, second);

        second.set_pre_condition(1, Counter::Finite(0));
        assert_eq!(first, second);

        second.set_post_condition(1, Counter::Infinite);
        assert_ne!(first, second);
    }

    #[test]
    fn test_extrapolation_follows_policy() {
        let policy = IteratorPolicy::new(1, 1);
        let mut states: AbstractStateMap<usize, Counter> = AbstractStateMap::new();

        let seeded = states.extrapolate(0, &Counter::Finite(0), &policy).unwrap();
        assert_eq!(seeded, Extrapolation::Seeded);
        assert_eq!(states.visited_count(0), 0);

        let joined = states.extrapolate(0, &Counter::Finite(1), &policy).unwrap();
        assert_eq!(joined, Extrapolation::Join);
        assert_eq!(states.get_pre(0), Some(&Counter::Finite(1)));

        let widened = states.extrapolate(0, &Counter::Finite(2), &policy).unwrap();
        assert_eq!(widened, Extrapolation::Widen);
        assert_eq!(states.get_pre(0), Some(&Counter::Infinite));
        assert_eq!(states.visited_count(0), 2);

        let err = states
            .extrapolate(0, &Counter::Finite(3), &policy)
            .unwrap_err();
        assert!(matches!(
            err,
            FixpointError::NonConvergence {
                node: 0,
                visits: 2,
                ..
            }
        ));

        states.reset_count(0);
        assert_eq!(states.visited_count(0), 0);
        assert_eq!(states.get_pre(0), Some(&Counter::Infinite));
    }
}

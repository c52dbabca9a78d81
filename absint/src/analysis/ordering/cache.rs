use crate::GraphError;
use crate::analysis::cfg::{ControlFlowGraph, Direction};
use crate::analysis::ordering::wpo::Wpo;
use crate::analysis::ordering::wto::Wto;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// Keeps built orderings around so repeated analyses of the same procedure skip the
/// decomposition.
///
/// Entries are keyed by a caller-chosen procedure key and the traversal direction. The
/// cache trusts the key: if the graph behind a key changes, [invalidate](Self::invalidate)
/// it.
#[derive(Debug)]
pub struct OrderingCache<K, N: Eq + Hash> {
    wtos: HashMap<(K, Direction), Arc<Wto<N>>>,
    wpos: HashMap<(K, Direction), Arc<Wpo<N>>>,
}

impl<K, N: Eq + Hash> Default for OrderingCache<K, N> {
    fn default() -> Self {
        Self {
            wtos: HashMap::new(),
            wpos: HashMap::new(),
        }
    }
}

impl<K, N> OrderingCache<K, N>
where
    K: Clone + Eq + Hash,
    N: Copy + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wto<G>(
        &mut self,
        key: &K,
        graph: &G,
        direction: Direction,
    ) -> Result<Arc<Wto<N>>, GraphError<N>>
    where
        G: ControlFlowGraph<Node = N>,
    {
        let slot = (key.clone(), direction);
        if let Some(wto) = self.wtos.get(&slot) {
            return Ok(wto.clone());
        }
        let wto = Arc::new(Wto::new(graph, direction)?);
        self.wtos.insert(slot, wto.clone());
        Ok(wto)
    }

    /// Returns the cached WPO for `key`, deriving it from the cached WTO when only that
    /// one exists.
    pub fn wpo<G>(
        &mut self,
        key: &K,
        graph: &G,
        direction: Direction,
    ) -> Result<Arc<Wpo<N>>, GraphError<N>>
    where
        G: ControlFlowGraph<Node = N>,
    {
        let slot = (key.clone(), direction);
        if let Some(wpo) = self.wpos.get(&slot) {
            return Ok(wpo.clone());
        }
        let wto = self.wto(key, graph, direction)?;
        let wpo = Arc::new(Wpo::from_wto(graph, wto)?);
        self.wpos.insert(slot, wpo.clone());
        Ok(wpo)
    }

    pub fn invalidate(&mut self, key: &K) {
        self.wtos.retain(|(k, _), _| k != key);
        self.wpos.retain(|(k, _), _| k != key);
    }

    pub fn clear(&mut self) {
        self.wtos.clear();
        self.wpos.clear();
    }

    /// Number of cached orderings of either kind.
    pub fn len(&self) -> usize {
        self.wtos.len() + self.wpos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wtos.is_empty() && self.wpos.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::analysis::cfg::Direction;
    use crate::analysis::ordering::cache::OrderingCache;
    use crate::analysis::testing::TestCfg;
    use std::sync::Arc;

    #[test]
    fn test_orderings_are_reused_per_key() {
        let cfg = TestCfg::new(&[(0, 1), (1, 1), (1, 2)]).with_exit(2);
        let mut cache: OrderingCache<&str, usize> = OrderingCache::new();

        let wto = cache.wto(&"main", &cfg, Direction::Forward).unwrap();
        let again = cache.wto(&"main", &cfg, Direction::Forward).unwrap();
        assert!(Arc::ptr_eq(&wto, &again));

        let wpo = cache.wpo(&"main", &cfg, Direction::Forward).unwrap();
        assert!(Arc::ptr_eq(wpo.wto(), &wto));

        let backward = cache.wto(&"main", &cfg, Direction::Backward).unwrap();
        assert_eq!(backward.entry(), 2);
        assert_eq!(cache.len(), 3);

        cache.invalidate(&"main");
        assert!(cache.is_empty());
        let rebuilt = cache.wto(&"main", &cfg, Direction::Forward).unwrap();
        assert!(!Arc::ptr_eq(&wto, &rebuilt));
        assert_eq!(wto, rebuilt);
    }
}

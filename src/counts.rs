//! Lazily resolved per-node element counts.
//!
//! Counts are annotations on the nodes of a cached [`Tree`], not part of the payload. A
//! resolution pass for one cache variant runs under that variant's lock; unrelated variants
//! resolve in parallel.

use parking_lot::Mutex;
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio::sync::OwnedMutexGuard;

use crate::{
    cache::CacheVariantKey,
    error::ArborError,
    properties::EntityId,
    tree::{NodeIndex, Tree},
};

/// The aggregate query behind a count, e.g. the number of products in a category.
pub trait ElementCounter: Send + Sync {
    /// Count items of `node_id` in the variant `key`. With `deep`, items of every descendant
    /// (found by the `path` prefix) are included.
    fn count(
        &self,
        key: &CacheVariantKey,
        node_id: EntityId,
        path: &str,
        deep: bool,
    ) -> impl Future<Output = Result<usize, ArborError>> + Send;
}

type VariantLocks = Mutex<HashMap<CacheVariantKey, Arc<tokio::sync::Mutex<()>>>>;

/// Held per-variant lock. On drop the map entry is removed once nobody else holds or awaits it.
struct VariantLease<'a> {
    locks: &'a VariantLocks,
    key: &'a CacheVariantKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for VariantLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        self.guard.take();
        if locks
            .get(self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(self.key);
        }
    }
}

#[derive(Debug)]
pub struct ElementCountResolver<C> {
    counter: C,
    locks: VariantLocks,
}

impl<C: ElementCounter> ElementCountResolver<C> {
    pub fn new(counter: C) -> Self {
        ElementCountResolver {
            counter,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn counter(&self) -> &C {
        &self.counter
    }

    /// Number of variants with a resolution in flight.
    pub fn locked_variants(&self) -> usize {
        self.locks.lock().len()
    }

    async fn lease<'a>(&'a self, key: &'a CacheVariantKey) -> VariantLease<'a> {
        let lock = self.locks.lock().entry(key.clone()).or_default().clone();
        VariantLease {
            locks: &self.locks,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Resolve counts for `node_id` and what a reader displays around it: its direct children,
    /// and each ancestor together with that ancestor's direct children. Returns the count of
    /// `node_id` itself.
    #[tracing::instrument(skip(self, key, tree), fields(key = %key))]
    pub async fn resolve_counts<T: Send + Sync>(
        &self,
        key: &CacheVariantKey,
        tree: &Tree<T>,
        node_id: EntityId,
        deep: bool,
    ) -> Result<usize, ArborError> {
        let idx = tree
            .index_of(node_id)
            .ok_or_else(|| ArborError::NotFound(format!("node {node_id} in variant {key}")))?;
        let targets = Self::targets(tree, idx);

        if targets.iter().any(|i| !Self::resolved(tree, *i)) {
            let _lease = self.lease(key).await;
            // Another caller may have finished while we waited.
            for target in targets.iter().filter(|i| !Self::resolved(tree, **i)) {
                let Some(node) = tree.node(*target) else {
                    continue;
                };
                let count = self
                    .counter
                    .count(key, node.id(), node.path(), deep)
                    .await?;
                node.set_element_count(count);
            }
        }
        Ok(tree
            .node(idx)
            .and_then(|node| node.element_count())
            .unwrap_or_default())
    }

    fn resolved<T>(tree: &Tree<T>, idx: NodeIndex) -> bool {
        tree.node(idx).is_none_or(|node| node.counts_resolved())
    }

    fn targets<T>(tree: &Tree<T>, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut targets = vec![idx];
        let mut levels = vec![idx];
        levels.extend(tree.ancestors(idx).filter_map(|a| tree.index_of(a.id())));
        for (depth, level) in levels.iter().enumerate() {
            if depth > 0 {
                targets.push(*level);
            }
            if let Some(node) = tree.node(*level) {
                targets.extend(node.children().iter().copied());
            }
        }
        // Siblings of a top-level ancestor are roots.
        targets.extend(tree.roots().iter().copied());
        targets.sort_unstable();
        targets.dedup();
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{properties::HierarchicalEntity, tree::TreeBuilder};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_log::test;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl ElementCounter for Counting {
        async fn count(
            &self,
            _key: &CacheVariantKey,
            node_id: EntityId,
            _path: &str,
            _deep: bool,
        ) -> Result<usize, ArborError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(node_id as usize * 10)
        }
    }

    fn tree() -> Tree<EntityId> {
        let mut rows = Vec::new();
        for (id, parent) in [(1, None), (2, Some(1)), (3, Some(1)), (4, Some(2)), (5, Some(4)), (6, None)] {
            let mut row = HierarchicalEntity::draft("main", "n");
            row.id = id;
            row.parent_id = parent;
            rows.push(row);
        }
        TreeBuilder::default().build(&rows, |r| r.id).unwrap()
    }

    #[test(tokio::test)]
    async fn resolves_node_children_and_ancestor_levels() {
        let tree = tree();
        let resolver = ElementCountResolver::new(Counting::default());
        let key = CacheVariantKey::agnostic("main", 1);

        let count = resolver.resolve_counts(&key, &tree, 4, false).await.unwrap();
        assert_eq!(count, 40);
        for id in [1, 2, 3, 4, 5, 6] {
            assert!(tree.get(id).unwrap().counts_resolved(), "node {id}");
        }

        let calls = resolver.counter().calls.load(Ordering::SeqCst);
        resolver.resolve_counts(&key, &tree, 4, false).await.unwrap();
        assert_eq!(resolver.counter().calls.load(Ordering::SeqCst), calls);
    }

    #[test(tokio::test)]
    async fn variant_locks_are_released_after_resolution() {
        let resolver = ElementCountResolver::new(Counting::default());
        for lang in 1..=3 {
            let key = CacheVariantKey::agnostic("main", lang);
            resolver.resolve_counts(&key, &tree(), 5, true).await.unwrap();
        }
        assert_eq!(resolver.locked_variants(), 0);
    }

    #[test(tokio::test)]
    async fn unknown_node_is_not_found() {
        let tree = tree();
        let resolver = ElementCountResolver::new(Counting::default());
        let res = resolver
            .resolve_counts(&CacheVariantKey::agnostic("main", 1), &tree, 77, true)
            .await;
        assert!(matches!(res, Err(ArborError::NotFound(_))));
    }
}

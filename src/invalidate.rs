//! Picks the cheapest correct action per change reason and applies it to the cached
//! variants of one tree.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    cache::{CacheBackend, CacheVariantKey, CacheVariantStore, CachedTree, KeyPattern},
    properties::{
        ChangeReason, EntityEntry, EntitySnapshot, EntryState, HierarchicalEntity, LocalizedValue,
    },
    tree::{PatchOutcome, Tree, TreePayload},
};

/// One tree and the changed rows that carry the reason being applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationTarget {
    pub tree: String,
    pub entries: Vec<EntitySnapshot>,
}

impl InvalidationTarget {
    pub fn new(tree: &str) -> Self {
        InvalidationTarget {
            tree: tree.to_string(),
            entries: Vec::new(),
        }
    }

    /// Record a committed row. A deleted localization is recorded without its text, so the
    /// variants of its language are evicted instead of patched with the removed value.
    pub fn push(&mut self, entry: &EntityEntry) {
        let snapshot = match (&entry.snapshot, entry.state) {
            (EntitySnapshot::Localized(value), EntryState::Deleted) => {
                EntitySnapshot::Localized(LocalizedValue {
                    value: None,
                    ..value.clone()
                })
            }
            (snapshot, _) => snapshot.clone(),
        };
        self.entries.push(snapshot);
    }

    fn nodes(&self) -> impl Iterator<Item = &HierarchicalEntity> {
        self.entries.iter().filter_map(|e| match e {
            EntitySnapshot::Node(entity) => Some(entity),
            _ => None,
        })
    }

    fn localized(&self) -> impl Iterator<Item = &LocalizedValue> {
        self.entries.iter().filter_map(|e| match e {
            EntitySnapshot::Localized(value) => Some(value),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationOutcome {
    pub evicted: usize,
    pub patched: usize,
    pub counts_reset: usize,
}

impl InvalidationOutcome {
    pub fn merge(&mut self, other: InvalidationOutcome) {
        self.evicted += other.evicted;
        self.patched += other.patched;
        self.counts_reset += other.counts_reset;
    }
}

enum VariantPatch<T> {
    /// Nothing in the target concerns this variant.
    Unchanged,
    Patched(Tree<T>),
    Unpatchable,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InvalidationEngine;

impl InvalidationEngine {
    /// After this returns, no cached variant of `target.tree` contradicts the rows in
    /// `target`: each was patched in place or evicted.
    #[tracing::instrument(skip(self, target, store), fields(tree = %target.tree))]
    pub async fn apply<T, B>(
        &self,
        reason: ChangeReason,
        target: &InvalidationTarget,
        store: &CacheVariantStore<T, B>,
    ) -> InvalidationOutcome
    where
        T: TreePayload,
        B: CacheBackend<CachedTree<T>>,
    {
        let tree = target.tree.as_str();
        let outcome = match reason {
            ChangeReason::Hierarchy => InvalidationOutcome {
                evicted: store.remove_by_pattern(&KeyPattern::tree(tree)).await,
                ..Default::default()
            },
            ChangeReason::StoreMapping => InvalidationOutcome {
                evicted: store
                    .remove_by_pattern(&KeyPattern::tree_non_agnostic_store(tree))
                    .await,
                ..Default::default()
            },
            ChangeReason::Acl => InvalidationOutcome {
                evicted: store
                    .remove_by_pattern(&KeyPattern::tree_non_agnostic_roles(tree))
                    .await,
                ..Default::default()
            },
            ChangeReason::ElementCounts => self.reset_counts(tree, store).await,
            ChangeReason::Data => {
                let nodes = target.nodes().collect::<Vec<_>>();
                self.patch_or_evict(store, KeyPattern::tree(tree), |key, cached| {
                    if nodes.is_empty() {
                        return VariantPatch::Unchanged;
                    }
                    let mut next = (*cached.tree).clone();
                    for entity in nodes.iter() {
                        if next.patch_node(entity.id, |v| v.patch_data(entity))
                            != PatchOutcome::Patched
                        {
                            tracing::debug!("Cannot patch {} in {}", entity.id, key);
                            return VariantPatch::Unpatchable;
                        }
                    }
                    VariantPatch::Patched(next)
                })
                .await
            }
            ChangeReason::Localization => {
                let values = target.localized().collect::<Vec<_>>();
                self.patch_or_evict(store, KeyPattern::tree(tree), |key, cached| {
                    let matching = values
                        .iter()
                        .filter(|v| v.language_id == key.language_id)
                        .collect::<Vec<_>>();
                    if matching.is_empty() {
                        return VariantPatch::Unchanged;
                    }
                    let mut next = (*cached.tree).clone();
                    for value in matching {
                        // A removed localization cannot be reverted without the base row.
                        let Some(text) = value.value.as_deref() else {
                            return VariantPatch::Unpatchable;
                        };
                        if next.patch_node(value.entity_id, |v| v.patch_localized(&value.key, text))
                            != PatchOutcome::Patched
                        {
                            tracing::debug!(
                                "Cannot patch {}.{} in {}",
                                value.entity_id,
                                value.key,
                                key
                            );
                            return VariantPatch::Unpatchable;
                        }
                    }
                    VariantPatch::Patched(next)
                })
                .await
            }
        };
        tracing::debug!("Applied {} to '{}': {:?}", reason, tree, outcome);
        outcome
    }

    async fn reset_counts<T, B>(&self, tree: &str, store: &CacheVariantStore<T, B>) -> InvalidationOutcome
    where
        T: TreePayload,
        B: CacheBackend<CachedTree<T>>,
    {
        let mut outcome = InvalidationOutcome::default();
        for key in store.keys(&KeyPattern::tree(tree)).await {
            if let Some(cached) = store.get(&key).await {
                cached.tree.reset_counts();
                outcome.counts_reset += 1;
            }
        }
        outcome
    }

    async fn patch_or_evict<T, B, F>(
        &self,
        store: &CacheVariantStore<T, B>,
        pattern: KeyPattern,
        patch: F,
    ) -> InvalidationOutcome
    where
        T: TreePayload,
        B: CacheBackend<CachedTree<T>>,
        F: Fn(&CacheVariantKey, &CachedTree<T>) -> VariantPatch<T>,
    {
        let mut outcome = InvalidationOutcome::default();
        for key in store.keys(&pattern).await {
            let generation = store.eviction_generation(&key.tree);
            let Some(cached) = store.get(&key).await else {
                continue;
            };
            match patch(&key, &cached) {
                VariantPatch::Unchanged => {}
                VariantPatch::Patched(next) => {
                    if store
                        .put_unless_evicted(&key, Arc::new(next), cached.ttl, generation)
                        .await
                    {
                        outcome.patched += 1;
                    }
                }
                VariantPatch::Unpatchable => {
                    tracing::info!("Evicting unpatchable variant {}", key);
                    if store.remove(&key).await {
                        outcome.evicted += 1;
                    }
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{DimToken, MemoryCacheBackend},
        tree::{MenuItemInfo, TreeBuilder},
    };
    use std::{collections::HashMap, time::Duration};
    use test_log::test;

    type Store = CacheVariantStore<MenuItemInfo, MemoryCacheBackend<CachedTree<MenuItemInfo>>>;

    fn rows() -> Vec<HierarchicalEntity> {
        let mut root = HierarchicalEntity::draft("main", "Catalog");
        root.id = 1;
        let mut shoes = HierarchicalEntity::draft("main", "Shoes").with_parent(1);
        shoes.id = 2;
        vec![root, shoes]
    }

    async fn seeded(keys: &[CacheVariantKey]) -> Store {
        let store = Store::new(MemoryCacheBackend::new());
        let tree = Arc::new(
            TreeBuilder::default()
                .build_payloads::<MenuItemInfo>(&rows(), &HashMap::new())
                .unwrap(),
        );
        for key in keys {
            store.put(key, tree.clone(), Duration::from_secs(60)).await;
        }
        store
    }

    #[test(tokio::test)]
    async fn acl_eviction_keeps_role_agnostic_variants() {
        let agnostic = CacheVariantKey::agnostic("main", 1);
        let roles = CacheVariantKey::new("main", 1, DimToken::Agnostic, DimToken::ids([4]));
        let store = seeded(&[agnostic.clone(), roles.clone()]).await;

        let outcome = InvalidationEngine
            .apply(ChangeReason::Acl, &InvalidationTarget::new("main"), &store)
            .await;

        assert_eq!(outcome.evicted, 1);
        assert!(store.get(&agnostic).await.is_some());
        assert!(store.get(&roles).await.is_none());
    }

    #[test(tokio::test)]
    async fn localization_patch_only_touches_matching_language() {
        let en = CacheVariantKey::agnostic("main", 1);
        let de = CacheVariantKey::agnostic("main", 2);
        let store = seeded(&[en.clone(), de.clone()]).await;
        let en_before = store.get(&en).await.unwrap().tree;
        let target = InvalidationTarget {
            tree: "main".into(),
            entries: vec![EntitySnapshot::Localized(LocalizedValue {
                entity_id: 2,
                tree: "main".into(),
                language_id: 2,
                key: "Name".into(),
                value: Some("Schuhe".into()),
            })],
        };

        let outcome = InvalidationEngine
            .apply(ChangeReason::Localization, &target, &store)
            .await;

        assert_eq!(outcome.patched, 1);
        let de_tree = store.get(&de).await.unwrap().tree;
        let en_tree = store.get(&en).await.unwrap().tree;
        assert_eq!(de_tree.get(2).unwrap().value().name, "Schuhe");
        assert_eq!(en_tree.get(2).unwrap().value().name, "Shoes");
        assert!(Arc::ptr_eq(&en_tree, &en_before));
    }

    #[test(tokio::test)]
    async fn data_change_on_absent_node_evicts_the_variant() {
        let key = CacheVariantKey::agnostic("main", 1);
        let store = seeded(&[key.clone()]).await;
        let mut stranger = HierarchicalEntity::draft("main", "Hidden");
        stranger.id = 99;
        let target = InvalidationTarget {
            tree: "main".into(),
            entries: vec![EntitySnapshot::Node(stranger)],
        };

        let outcome = InvalidationEngine
            .apply(ChangeReason::Data, &target, &store)
            .await;

        assert_eq!(outcome.evicted, 1);
        assert!(store.get(&key).await.is_none());
    }

    #[test(tokio::test)]
    async fn element_counts_reset_without_eviction() {
        let key = CacheVariantKey::agnostic("main", 1);
        let store = seeded(&[key.clone()]).await;
        let cached = store.get(&key).await.unwrap();
        cached.tree.get(2).unwrap().set_element_count(5);

        let outcome = InvalidationEngine
            .apply(
                ChangeReason::ElementCounts,
                &InvalidationTarget::new("main"),
                &store,
            )
            .await;

        assert_eq!(outcome.evicted, 0);
        assert_eq!(outcome.counts_reset, 1);
        let again = store.get(&key).await.unwrap();
        assert!(Arc::ptr_eq(&again.tree, &cached.tree));
        assert_eq!(again.tree.get(2).unwrap().element_count(), None);
    }
}

//! The read path: get a cached variant or build it from persistence.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use crate::{
    cache::{CacheBackend, CacheVariantKey, CacheVariantStore, CachedTree},
    cancel::Cancel,
    config::ArborConfig,
    error::ArborError,
    properties::{EntityId, HierarchicalEntity},
    source::HierarchySource,
    tree::{group_overrides, Tree, TreeBuilder, TreePayload},
};

pub struct TreeProvider<S, T, B> {
    source: Arc<S>,
    store: Arc<CacheVariantStore<T, B>>,
    config: ArborConfig,
}

impl<S, T, B> TreeProvider<S, T, B>
where
    S: HierarchySource,
    T: TreePayload,
    B: CacheBackend<CachedTree<T>>,
{
    pub fn new(source: Arc<S>, store: Arc<CacheVariantStore<T, B>>, config: ArborConfig) -> Self {
        TreeProvider {
            source,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<CacheVariantStore<T, B>> {
        &self.store
    }

    /// The variant for `key`, from the cache when present. A miss (or a disabled or
    /// unavailable cache) builds the tree from persistence.
    #[tracing::instrument(skip(self, key, cancel), fields(key = %key))]
    pub async fn get_tree(
        &self,
        key: &CacheVariantKey,
        cancel: &Cancel,
    ) -> Result<Arc<Tree<T>>, ArborError> {
        cancel.check()?;
        if self.config.cache.enabled {
            if let Some(cached) = self.store.get(key).await {
                tracing::debug!("Cache hit");
                return Ok(cached.tree);
            }
        }

        let generation = self.store.eviction_generation(&key.tree);
        let tree = Arc::new(self.build(key).await?);
        cancel.check()?;
        if self.config.cache.enabled {
            // A save committed during the build leaves this tree uncached.
            self.store
                .put_unless_evicted(key, tree.clone(), self.config.cache.default_ttl(), generation)
                .await;
        }
        tracing::info!("Built variant {} with {} nodes", key, tree.len());
        Ok(tree)
    }

    /// Build the variant for `key` without consulting the cache.
    pub async fn build(&self, key: &CacheVariantKey) -> Result<Tree<T>, ArborError> {
        let rows = visible_rows(self.source.load_tree(&key.tree).await?, key);
        let localized = self
            .source
            .localized_values(&key.tree, key.language_id)
            .await?
            .into_iter()
            .filter(|v| self.config.tree.localized_keys.contains(&v.key))
            .collect::<Vec<_>>();
        TreeBuilder::new(self.config.tree.orphan_policy)
            .build_payloads(&rows, &group_overrides(&localized))
    }
}

/// Rows a reader of `key` may see. A hidden row hides its whole subtree; rows whose parent is
/// missing altogether are left for the builder's orphan policy.
fn visible_rows(rows: Vec<HierarchicalEntity>, key: &CacheVariantKey) -> Vec<HierarchicalEntity> {
    let stores = key.store.as_filter();
    let roles = key.roles.as_filter();
    let hidden = rows
        .iter()
        .filter(|r| {
            r.deleted || !r.published || !r.visible_in_store(stores) || !r.visible_to_roles(roles)
        })
        .map(|r| r.id)
        .collect::<HashSet<_>>();
    let parents = rows
        .iter()
        .map(|r| (r.id, r.parent_id))
        .collect::<BTreeMap<_, _>>();

    let mut memo: HashMap<EntityId, bool> = HashMap::new();
    let mut visible = |id: EntityId| -> bool {
        let mut chain = Vec::new();
        let mut current = Some(id);
        let mut result = true;
        while let Some(cur) = current {
            if let Some(known) = memo.get(&cur) {
                result = *known;
                break;
            }
            if hidden.contains(&cur) || chain.len() > parents.len() {
                result = false;
                break;
            }
            chain.push(cur);
            current = parents.get(&cur).copied().flatten();
        }
        for id in chain {
            memo.insert(id, result);
        }
        result
    };

    rows.into_iter().filter(|r| visible(r.id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{DimToken, MemoryCacheBackend},
        properties::LocalizedValue,
        source::MemorySource,
        tree::MenuItemInfo,
    };
    use std::collections::BTreeSet;
    use test_log::test;

    type Provider =
        TreeProvider<MemorySource, MenuItemInfo, MemoryCacheBackend<CachedTree<MenuItemInfo>>>;

    fn row(id: EntityId, parent: Option<EntityId>) -> HierarchicalEntity {
        let mut row = HierarchicalEntity::draft("main", &format!("node-{id}"));
        row.id = id;
        row.parent_id = parent;
        row
    }

    fn provider(config: ArborConfig) -> Provider {
        let mut limited = row(3, Some(1));
        limited.limited_to_stores = true;
        limited.store_ids = BTreeSet::from([7]);
        let mut hidden = row(4, Some(1));
        hidden.published = false;
        let source = MemorySource::with_rows([
            row(1, None),
            row(2, Some(1)),
            limited,
            hidden,
            row(5, Some(4)),
        ]);
        source.set_localized(LocalizedValue {
            entity_id: 2,
            tree: "main".into(),
            language_id: 2,
            key: "Name".into(),
            value: Some("Zwei".into()),
        });
        Provider::new(
            Arc::new(source),
            Arc::new(CacheVariantStore::new(MemoryCacheBackend::new())),
            config,
        )
    }

    #[test(tokio::test)]
    async fn variants_filter_by_dimensions_and_language() {
        let provider = provider(ArborConfig::default());
        let cancel = Cancel::never();

        let agnostic = provider
            .get_tree(&CacheVariantKey::agnostic("main", 1), &cancel)
            .await
            .unwrap();
        assert!(agnostic.get(3).is_some());
        assert!(agnostic.get(4).is_none());
        assert!(agnostic.get(5).is_none());

        let store3 = provider
            .get_tree(
                &CacheVariantKey::new("main", 1, DimToken::ids([3]), DimToken::Agnostic),
                &cancel,
            )
            .await
            .unwrap();
        assert!(store3.get(3).is_none());

        let german = provider
            .get_tree(&CacheVariantKey::agnostic("main", 2), &cancel)
            .await
            .unwrap();
        assert_eq!(german.get(2).unwrap().value().name, "Zwei");
    }

    #[test(tokio::test)]
    async fn hits_are_served_from_cache() {
        let provider = provider(ArborConfig::default());
        let key = CacheVariantKey::agnostic("main", 1);
        let first = provider.get_tree(&key, &Cancel::never()).await.unwrap();
        let second = provider.get_tree(&key, &Cancel::never()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test(tokio::test)]
    async fn unavailable_cache_falls_back_to_building() {
        let provider = provider(ArborConfig::default());
        provider.store().backend().set_available(false);
        let key = CacheVariantKey::agnostic("main", 1);
        let tree = provider.get_tree(&key, &Cancel::never()).await.unwrap();
        assert_eq!(tree.len(), 3);
        assert!(provider.store().is_degraded());
    }
}

//! Shared fixtures for scenario tests

use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    cache::{CacheVariantKey, CacheVariantStore, CachedTree, MemoryCacheBackend},
    properties::{EntityId, HierarchicalEntity},
    source::MemorySource,
    tree::{MenuItemInfo, TreeBuilder},
};

pub type MenuStore = CacheVariantStore<MenuItemInfo, MemoryCacheBackend<CachedTree<MenuItemInfo>>>;

pub const TREE: &str = "main";

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// A published row of [`TREE`] with the given stored parent and path.
pub fn node(id: EntityId, parent: Option<EntityId>, path: &str) -> HierarchicalEntity {
    HierarchicalEntity {
        id,
        tree: TREE.to_string(),
        parent_id: parent,
        tree_path: path.to_string(),
        display_order: id as i32,
        published: true,
        name: format!("Item {id}"),
        ..Default::default()
    }
}

/// Catalog fixture:
///
/// ```text
/// 2          7
/// └─ 5       └─ 8
///    └─ 9
///       └─ 12
/// ```
pub fn catalog_rows() -> Vec<HierarchicalEntity> {
    vec![
        node(2, None, "2"),
        node(5, Some(2), "2/5"),
        node(9, Some(5), "2/5/9"),
        node(12, Some(9), "2/5/9/12"),
        node(7, None, "7"),
        node(8, Some(7), "7/8"),
    ]
}

pub fn catalog_source() -> MemorySource {
    init_logging();
    MemorySource::with_rows(catalog_rows())
}

/// A store holding the catalog tree under every key in `keys`.
pub async fn seeded_store(keys: &[CacheVariantKey]) -> MenuStore {
    init_logging();
    let store = MenuStore::new(MemoryCacheBackend::new());
    let tree = Arc::new(
        TreeBuilder::default()
            .build_payloads::<MenuItemInfo>(&catalog_rows(), &HashMap::new())
            .unwrap(),
    );
    for key in keys {
        store.put(key, tree.clone(), Duration::from_secs(300)).await;
    }
    store
}

//! The persistence collaborator.
//!
//! [`HierarchySource`] is the narrow contract the core needs from whatever stores the
//! hierarchical rows. [`MemorySource`] is the in-process implementation used by tests and by
//! applications that keep their trees in memory; the SQLite implementation lives in
//! [`crate::db`] behind the `service` feature.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    future::Future,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::{
    cancel::Cancel,
    error::ArborError,
    paths::path,
    properties::{EntityId, HierarchicalEntity, LocalizedValue},
};

/// One all-or-nothing move: the node's own parent/path write plus the prefix rewrite of every
/// descendant row in the same tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRewrite {
    pub tree: String,
    pub entity_id: EntityId,
    pub new_parent_id: Option<EntityId>,
    pub old_path: String,
    pub new_path: String,
}

pub trait HierarchySource: Sync {
    fn find_by_id(
        &self,
        id: EntityId,
    ) -> impl Future<Output = Result<Option<HierarchicalEntity>, ArborError>> + Send;

    /// `(id, parent_id)` pairs from `id` upward, stopping at a root, a missing row, or after
    /// `max_depth` steps (the caller decides what an exhausted walk means).
    fn find_ancestor_chain(
        &self,
        id: EntityId,
        max_depth: usize,
    ) -> impl Future<Output = Result<Vec<(EntityId, Option<EntityId>)>, ArborError>> + Send {
        async move {
            let mut chain = Vec::new();
            let mut current = Some(id);
            while let Some(cur) = current {
                if chain.len() >= max_depth {
                    break;
                }
                let Some(row) = self.find_by_id(cur).await? else {
                    break;
                };
                chain.push((row.id, row.parent_id));
                current = row.parent_id;
            }
            Ok(chain)
        }
    }

    /// Number of rows in the tree; the upper bound for any well-formed ancestor walk.
    fn entity_count(&self, tree: &str) -> impl Future<Output = Result<usize, ArborError>> + Send;

    /// Every row of the tree, including unpublished and soft-deleted ones.
    fn load_tree(
        &self,
        tree: &str,
    ) -> impl Future<Output = Result<Vec<HierarchicalEntity>, ArborError>> + Send;

    fn localized_values(
        &self,
        tree: &str,
        language_id: u32,
    ) -> impl Future<Output = Result<Vec<LocalizedValue>, ArborError>> + Send;

    /// Persist a draft row, assigning its id and its path beneath the parent's path.
    fn insert(
        &self,
        entity: HierarchicalEntity,
        cancel: &Cancel,
    ) -> impl Future<Output = Result<HierarchicalEntity, ArborError>> + Send;

    /// Apply a [`PathRewrite`] atomically. Returns the number of rows written.
    fn execute_batch_path_rewrite(
        &self,
        rewrite: &PathRewrite,
        cancel: &Cancel,
    ) -> impl Future<Output = Result<u64, ArborError>> + Send;

    /// Detach the given rows to root (`parent_id = NULL`).
    fn execute_set_parent_null(
        &self,
        ids: &[EntityId],
    ) -> impl Future<Output = Result<u64, ArborError>> + Send;

    /// Overwrite the paths of the given rows in one unit.
    fn write_paths(
        &self,
        paths: &[(EntityId, String)],
        cancel: &Cancel,
    ) -> impl Future<Output = Result<u64, ArborError>> + Send;
}

#[derive(Debug, Default)]
pub struct MemorySource {
    rows: RwLock<BTreeMap<EntityId, HierarchicalEntity>>,
    localized: RwLock<Vec<LocalizedValue>>,
    next_id: AtomicU64,
    fail_rewrites: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with rows exactly as given (paths are not validated, so corrupt fixtures are
    /// possible).
    pub fn with_rows<I: IntoIterator<Item = HierarchicalEntity>>(rows: I) -> Self {
        let source = MemorySource::default();
        {
            let mut guard = source.rows.write();
            for row in rows {
                guard.insert(row.id, row);
            }
        }
        let max_id = source.rows.read().keys().next_back().copied().unwrap_or(0);
        source.next_id.store(max_id, Ordering::SeqCst);
        source
    }

    /// Write a row as the persistence framework would on save. Does not touch paths.
    pub fn upsert(&self, entity: HierarchicalEntity) {
        self.next_id.fetch_max(entity.id, Ordering::SeqCst);
        self.rows.write().insert(entity.id, entity);
    }

    pub fn set_localized(&self, value: LocalizedValue) {
        let mut guard = self.localized.write();
        guard.retain(|v| {
            !(v.entity_id == value.entity_id
                && v.language_id == value.language_id
                && v.key == value.key)
        });
        if value.value.is_some() {
            guard.push(value);
        }
    }

    pub fn get(&self, id: EntityId) -> Option<HierarchicalEntity> {
        self.rows.read().get(&id).cloned()
    }

    pub fn paths(&self) -> BTreeMap<EntityId, String> {
        self.rows
            .read()
            .values()
            .map(|row| (row.id, row.tree_path.clone()))
            .collect()
    }

    /// Make subsequent batch rewrites fail after staging, before anything is written.
    pub fn fail_rewrites(&self, fail: bool) {
        self.fail_rewrites.store(fail, Ordering::SeqCst);
    }
}

impl HierarchySource for MemorySource {
    async fn find_by_id(&self, id: EntityId) -> Result<Option<HierarchicalEntity>, ArborError> {
        Ok(self.rows.read().get(&id).cloned())
    }

    async fn find_ancestor_chain(
        &self,
        id: EntityId,
        max_depth: usize,
    ) -> Result<Vec<(EntityId, Option<EntityId>)>, ArborError> {
        let rows = self.rows.read();
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(row) = current.and_then(|cur| rows.get(&cur)) {
            if chain.len() >= max_depth {
                break;
            }
            chain.push((row.id, row.parent_id));
            current = row.parent_id;
        }
        Ok(chain)
    }

    async fn entity_count(&self, tree: &str) -> Result<usize, ArborError> {
        Ok(self.rows.read().values().filter(|r| r.tree == tree).count())
    }

    async fn load_tree(&self, tree: &str) -> Result<Vec<HierarchicalEntity>, ArborError> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|r| r.tree == tree)
            .cloned()
            .collect())
    }

    async fn localized_values(
        &self,
        tree: &str,
        language_id: u32,
    ) -> Result<Vec<LocalizedValue>, ArborError> {
        Ok(self
            .localized
            .read()
            .iter()
            .filter(|v| v.tree == tree && v.language_id == language_id)
            .cloned()
            .collect())
    }

    async fn insert(
        &self,
        mut entity: HierarchicalEntity,
        cancel: &Cancel,
    ) -> Result<HierarchicalEntity, ArborError> {
        cancel.check()?;
        let mut rows = self.rows.write();
        let parent_path = match entity.parent_id {
            Some(parent_id) => {
                let parent = rows.get(&parent_id).ok_or_else(|| {
                    ArborError::NotFound(format!("parent {parent_id} of new row"))
                })?;
                if parent.tree != entity.tree {
                    return Err(ArborError::InvalidArgument(format!(
                        "parent {parent_id} belongs to tree '{}', not '{}'",
                        parent.tree, entity.tree
                    )));
                }
                parent.tree_path.clone()
            }
            None => String::new(),
        };
        if entity.is_draft() {
            entity.id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        } else if rows.contains_key(&entity.id) {
            return Err(ArborError::InvalidArgument(format!(
                "row {} already exists",
                entity.id
            )));
        }
        entity.tree_path = path::build(&parent_path, entity.id)?;
        self.next_id.fetch_max(entity.id, Ordering::SeqCst);
        rows.insert(entity.id, entity.clone());
        Ok(entity)
    }

    async fn execute_batch_path_rewrite(
        &self,
        rewrite: &PathRewrite,
        cancel: &Cancel,
    ) -> Result<u64, ArborError> {
        cancel.check()?;
        let mut rows = self.rows.write();
        if !rows.contains_key(&rewrite.entity_id) {
            return Err(ArborError::NotFound(format!("row {}", rewrite.entity_id)));
        }

        // Stage the whole unit first so a failure leaves every row untouched.
        let staged = rows
            .values()
            .filter(|row| row.tree == rewrite.tree && row.id != rewrite.entity_id)
            .filter(|row| path::is_descendant_path(&row.tree_path, &rewrite.old_path))
            .filter_map(|row| {
                path::rebase(&row.tree_path, &rewrite.old_path, &rewrite.new_path)
                    .map(|new_path| (row.id, new_path))
            })
            .collect::<Vec<_>>();

        if self.fail_rewrites.load(Ordering::SeqCst) {
            return Err(ArborError::PersistenceFailure(format!(
                "injected failure rewriting {} descendant paths of {}",
                staged.len(),
                rewrite.entity_id
            )));
        }

        if let Some(own) = rows.get_mut(&rewrite.entity_id) {
            own.parent_id = rewrite.new_parent_id;
            own.tree_path = rewrite.new_path.clone();
        }
        for (id, new_path) in staged.iter() {
            if let Some(row) = rows.get_mut(id) {
                row.tree_path = new_path.clone();
            }
        }
        Ok(staged.len() as u64 + 1)
    }

    async fn execute_set_parent_null(&self, ids: &[EntityId]) -> Result<u64, ArborError> {
        let mut rows = self.rows.write();
        let mut affected = 0;
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                row.parent_id = None;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn write_paths(
        &self,
        paths: &[(EntityId, String)],
        cancel: &Cancel,
    ) -> Result<u64, ArborError> {
        cancel.check()?;
        let mut rows = self.rows.write();
        if let Some((missing, _)) = paths.iter().find(|(id, _)| !rows.contains_key(id)) {
            return Err(ArborError::NotFound(format!("row {missing}")));
        }
        for (id, new_path) in paths {
            if let Some(row) = rows.get_mut(id) {
                row.tree_path = new_path.clone();
            }
        }
        Ok(paths.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test(tokio::test)]
    async fn insert_assigns_id_and_path() {
        let source = MemorySource::new();
        let cancel = Cancel::never();
        let root = source
            .insert(HierarchicalEntity::draft("main", "Root"), &cancel)
            .await
            .unwrap();
        let child = source
            .insert(
                HierarchicalEntity::draft("main", "Child").with_parent(root.id),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(root.tree_path, root.id.to_string());
        assert_eq!(child.tree_path, format!("{}/{}", root.id, child.id));
    }

    #[test(tokio::test)]
    async fn insert_rejects_parent_from_other_tree() {
        let source = MemorySource::new();
        let cancel = Cancel::never();
        let footer = source
            .insert(HierarchicalEntity::draft("footer", "Legal"), &cancel)
            .await
            .unwrap();
        let res = source
            .insert(
                HierarchicalEntity::draft("main", "Stray").with_parent(footer.id),
                &cancel,
            )
            .await;
        assert!(matches!(res, Err(ArborError::InvalidArgument(_))));
    }

    #[test(tokio::test)]
    async fn ancestor_chain_is_bounded() {
        let mut a = HierarchicalEntity::draft("main", "A");
        a.id = 1;
        a.parent_id = Some(2);
        let mut b = HierarchicalEntity::draft("main", "B");
        b.id = 2;
        b.parent_id = Some(1);
        let source = MemorySource::with_rows([a, b]);

        let chain = source.find_ancestor_chain(1, 5).await.unwrap();
        assert_eq!(chain.len(), 5);
    }
}

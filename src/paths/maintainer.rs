//! Keeps stored paths consistent with the parent chain.
//!
//! Moves are validated up front by [`CycleGuard`] and written as a single
//! [`PathRewrite`] unit. [`TreePathMaintainer::reconcile`] is the data-repair pass for rows
//! that already form a cycle in storage: it detaches one row per cycle to root and rebuilds
//! every path from the parent links.

use petgraph::{algo::tarjan_scc, graphmap::DiGraphMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::{
    cancel::Cancel,
    config::PathsConfig,
    error::ArborError,
    paths::{guard::CycleGuard, path},
    properties::{EntityId, HierarchicalEntity},
    source::{HierarchySource, PathRewrite},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Every stored cycle found, each sorted ascending.
    pub cycles: Vec<Vec<EntityId>>,
    /// Rows detached to root.
    pub healed: Vec<EntityId>,
    /// Rows whose detach statement failed; the pass continued past them.
    pub failed: Vec<EntityId>,
    pub paths_rewritten: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TreePathMaintainer {
    max_depth_override: Option<usize>,
}

impl TreePathMaintainer {
    pub fn new(config: &PathsConfig) -> Self {
        TreePathMaintainer {
            max_depth_override: config.max_depth_override,
        }
    }

    async fn guard_for<S: HierarchySource>(
        &self,
        tree: &str,
        source: &S,
    ) -> Result<CycleGuard, ArborError> {
        let count = source.entity_count(tree).await?;
        let depth = match self.max_depth_override {
            Some(cap) => cap.min(count),
            None => count,
        };
        Ok(CycleGuard::new(depth))
    }

    /// Recompute `entity`'s path under its (new) `parent_id` and rewrite every descendant.
    ///
    /// Nothing is written if the move would create a cycle, if the parent is missing or if it
    /// belongs to another tree. On success `entity.tree_path` holds the new path.
    #[tracing::instrument(skip(self, entity, source, cancel), fields(id = entity.id))]
    pub async fn on_parent_changed<S: HierarchySource>(
        &self,
        entity: &mut HierarchicalEntity,
        old_path: &str,
        source: &S,
        cancel: &Cancel,
    ) -> Result<String, ArborError> {
        cancel.check()?;
        let parent_path = match entity.parent_id {
            Some(parent_id) => {
                let guard = self.guard_for(&entity.tree, source).await?;
                // One query for the whole walk instead of a lookup per step.
                let ancestors = source
                    .find_ancestor_chain(parent_id, guard.max_depth() + 1)
                    .await?
                    .into_iter()
                    .collect::<BTreeMap<_, _>>();
                if let Some(chain) = guard.find_cycle(entity.id, parent_id, &ancestors).await? {
                    tracing::warn!(
                        "Refusing to move {} under {}: cycle {:?}",
                        entity.id,
                        parent_id,
                        chain
                    );
                    return Err(ArborError::CycleDetected { chain });
                }
                let parent = source.find_by_id(parent_id).await?.ok_or_else(|| {
                    ArborError::NotFound(format!("parent {parent_id} of {}", entity.id))
                })?;
                if parent.tree != entity.tree {
                    return Err(ArborError::InvalidArgument(format!(
                        "parent {parent_id} belongs to tree '{}', not '{}'",
                        parent.tree, entity.tree
                    )));
                }
                parent.tree_path
            }
            None => String::new(),
        };

        let new_path = path::build(&parent_path, entity.id)?;
        if new_path == old_path {
            entity.tree_path = new_path.clone();
            return Ok(new_path);
        }

        let old_path_valid = path::parse(old_path)
            .map(|ids| ids.last() == Some(&entity.id))
            .unwrap_or(false);

        let rewrite = PathRewrite {
            tree: entity.tree.clone(),
            entity_id: entity.id,
            new_parent_id: entity.parent_id,
            old_path: old_path.to_string(),
            new_path: new_path.clone(),
        };
        let written = source.execute_batch_path_rewrite(&rewrite, cancel).await?;
        entity.tree_path = new_path.clone();
        tracing::debug!(
            "Moved {} from '{}' to '{}' ({} rows written)",
            entity.id,
            old_path,
            new_path,
            written
        );

        if !old_path_valid {
            // Descendants cannot be found by prefix of a corrupt path.
            tracing::warn!(
                "Stored path '{}' of {} is invalid; rebuilding all paths of '{}'",
                old_path,
                entity.id,
                entity.tree
            );
            self.rebuild_paths(&entity.tree, source, cancel).await?;
        }
        Ok(new_path)
    }

    /// Insert a draft row; the source assigns its id and the path beneath its parent.
    #[tracing::instrument(skip(self, entity, source, cancel), fields(tree = %entity.tree))]
    pub async fn insert<S: HierarchySource>(
        &self,
        entity: HierarchicalEntity,
        source: &S,
        cancel: &Cancel,
    ) -> Result<HierarchicalEntity, ArborError> {
        cancel.check()?;
        let inserted = source.insert(entity, cancel).await?;
        tracing::debug!("Inserted {} at '{}'", inserted.id, inserted.tree_path);
        Ok(inserted)
    }

    /// Find rows whose stored parent chain loops back on itself, detach the smallest id of
    /// each cycle to root, then rebuild the tree's paths.
    #[tracing::instrument(skip(self, source, cancel))]
    pub async fn reconcile<S: HierarchySource>(
        &self,
        tree: &str,
        source: &S,
        cancel: &Cancel,
    ) -> Result<ReconcileReport, ArborError> {
        cancel.check()?;
        let rows = source.load_tree(tree).await?;
        let mut report = ReconcileReport {
            cycles: find_stored_cycles(&rows),
            ..Default::default()
        };

        for cycle in report.cycles.iter() {
            let Some(&victim) = cycle.first() else {
                continue;
            };
            match source.execute_set_parent_null(&[victim]).await {
                Ok(_) => {
                    tracing::info!(
                        "Healed invalid hierarchy in '{}': detached {} to root (cycle {:?})",
                        tree,
                        victim,
                        cycle
                    );
                    report.healed.push(victim);
                }
                Err(e) => {
                    tracing::error!("Failed to detach {} from cycle {:?}: {}", victim, cycle, e);
                    report.failed.push(victim);
                }
            }
        }

        report.paths_rewritten = self.rebuild_paths(tree, source, cancel).await?;
        Ok(report)
    }

    /// Recompute every reachable path from the parent links and write those that differ in
    /// one unit. Returns the number of rewritten rows.
    #[tracing::instrument(skip(self, source, cancel))]
    pub async fn rebuild_paths<S: HierarchySource>(
        &self,
        tree: &str,
        source: &S,
        cancel: &Cancel,
    ) -> Result<usize, ArborError> {
        cancel.check()?;
        let rows = source.load_tree(tree).await?;
        let computed = compute_paths(&rows)?;

        let mut changes = Vec::new();
        for row in rows.iter() {
            match computed.get(&row.id) {
                Some(path) if *path != row.tree_path => changes.push((row.id, path.clone())),
                Some(_) => {}
                None => tracing::warn!(
                    "Row {} in '{}' is unreachable from any root; path '{}' left as is",
                    row.id,
                    tree,
                    row.tree_path
                ),
            }
        }
        if !changes.is_empty() {
            source.write_paths(&changes, cancel).await?;
            tracing::info!("Rewrote {} paths in '{}'", changes.len(), tree);
        }
        Ok(changes.len())
    }
}

/// Strongly connected components of the child -> parent graph that form a loop.
pub(crate) fn find_stored_cycles(rows: &[HierarchicalEntity]) -> Vec<Vec<EntityId>> {
    let ids = rows.iter().map(|r| r.id).collect::<BTreeSet<_>>();
    let mut graph = DiGraphMap::<EntityId, ()>::new();
    for row in rows.iter() {
        graph.add_node(row.id);
        if let Some(parent) = row.parent_id.filter(|p| ids.contains(p)) {
            graph.add_edge(row.id, parent, ());
        }
    }
    let mut cycles = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|mut scc| {
            scc.sort_unstable();
            scc
        })
        .collect::<Vec<_>>();
    cycles.sort();
    cycles
}

/// Paths for every row reachable from a root. Rows in cycles or beneath a missing parent are
/// absent from the result.
pub(crate) fn compute_paths(
    rows: &[HierarchicalEntity],
) -> Result<BTreeMap<EntityId, String>, ArborError> {
    let mut children: BTreeMap<EntityId, Vec<EntityId>> = BTreeMap::new();
    let mut queue = VecDeque::new();
    for row in rows.iter() {
        match row.parent_id {
            Some(parent) => children.entry(parent).or_default().push(row.id),
            None => queue.push_back((row.id, path::build("", row.id)?)),
        }
    }

    let mut paths = BTreeMap::new();
    while let Some((id, node_path)) = queue.pop_front() {
        if paths.contains_key(&id) {
            continue;
        }
        if let Some(kids) = children.get(&id) {
            for kid in kids {
                queue.push_back((*kid, path::build(&node_path, *kid)?));
            }
        }
        paths.insert(id, node_path);
    }
    Ok(paths)
}

//! Save-time orchestration.
//!
//! A persistence framework wires [`TreeChangeHook`] into its save pipeline: `begin` once per
//! save, `before_save` for each changed row before it is written, and `after_save` with the
//! committed batch. Path maintenance happens before the write (so a cycle aborts the save);
//! classification, invalidation and notification happen after the commit.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use crate::{
    cache::{CacheBackend, CacheVariantStore, CachedTree, KeyPattern},
    cancel::Cancel,
    classify::ChangeClassifier,
    error::ArborError,
    event::{ChangeNotifier, EventBus, PendingInvalidation},
    invalidate::{InvalidationEngine, InvalidationOutcome, InvalidationTarget},
    paths::{path, TreePathMaintainer},
    properties::{prop, ChangeReason, EntityEntry, EntityId, EntityKind, EntryState, ReasonSet},
    source::HierarchySource,
    tree::TreePayload,
};

/// State carried through one save.
#[derive(Debug, Default, Clone)]
pub struct SaveScope {
    pending: PendingInvalidation,
    moved: Vec<(EntityId, String)>,
}

impl SaveScope {
    /// `(id, new path)` of every node moved by `before_save`.
    pub fn moved(&self) -> &[(EntityId, String)] {
        &self.moved
    }

    pub fn pending(&self) -> &PendingInvalidation {
        &self.pending
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReport {
    pub outcome: InvalidationOutcome,
    /// `(tree, reason)` pairs acted on, in application order.
    pub applied: Vec<(String, ChangeReason)>,
    /// Reasons skipped because a full eviction of the same tree made them moot.
    pub superseded: Vec<(String, ChangeReason)>,
    pub published: Vec<ChangeReason>,
}

pub struct TreeChangeHook<S, T, B, E> {
    source: Arc<S>,
    store: Arc<CacheVariantStore<T, B>>,
    notifier: ChangeNotifier<E>,
    classifier: ChangeClassifier,
    maintainer: TreePathMaintainer,
    engine: InvalidationEngine,
}

impl<S, T, B, E> TreeChangeHook<S, T, B, E>
where
    S: HierarchySource,
    T: TreePayload,
    B: CacheBackend<CachedTree<T>>,
    E: EventBus,
{
    pub fn new(
        source: Arc<S>,
        store: Arc<CacheVariantStore<T, B>>,
        notifier: ChangeNotifier<E>,
        classifier: ChangeClassifier,
        maintainer: TreePathMaintainer,
    ) -> Self {
        TreeChangeHook {
            source,
            store,
            notifier,
            classifier,
            maintainer,
            engine: InvalidationEngine,
        }
    }

    pub fn classifier(&self) -> &ChangeClassifier {
        &self.classifier
    }

    pub fn begin(&self) -> SaveScope {
        SaveScope::default()
    }

    /// Keep `entry`'s path consistent with its parent before it is written. An error here
    /// (cycle, missing parent, failed rewrite, cancellation) must abort the save.
    #[tracing::instrument(skip_all, fields(kind = ?entry.kind, state = ?entry.state))]
    pub async fn before_save(
        &self,
        scope: &mut SaveScope,
        entry: &mut EntityEntry,
        cancel: &Cancel,
    ) -> Result<ReasonSet, ArborError> {
        cancel.check()?;
        let reasons = self.classifier.classify_entry(entry);
        if entry.kind != EntityKind::TreeNode {
            return Ok(reasons);
        }

        match entry.state {
            EntryState::Modified if entry.modified.contains(prop::PARENT_ID) => {
                let old_path = entry
                    .initial
                    .as_ref()
                    .map(|initial| initial.tree_path.clone())
                    .unwrap_or_default();
                let Some(node) = entry.node_mut() else {
                    return Ok(reasons);
                };
                let new_path = self
                    .maintainer
                    .on_parent_changed(node, &old_path, self.source.as_ref(), cancel)
                    .await?;
                scope.moved.push((node.id, new_path));
            }
            EntryState::Added => {
                let Some(node) = entry.node_mut() else {
                    return Ok(reasons);
                };
                if node.tree_path.is_empty() && !node.is_draft() {
                    let parent_path = match node.parent_id {
                        Some(parent_id) => self
                            .source
                            .find_by_id(parent_id)
                            .await?
                            .map(|parent| parent.tree_path)
                            .ok_or_else(|| {
                                ArborError::NotFound(format!("parent {parent_id} of {}", node.id))
                            })?,
                        None => String::new(),
                    };
                    node.tree_path = path::build(&parent_path, node.id)?;
                }
            }
            _ => {}
        }
        Ok(reasons)
    }

    /// Classify the committed batch and bring every affected tree's cached variants up to
    /// date, then publish one event per reason.
    ///
    /// If cancelled part way, every variant of each affected tree is evicted before
    /// [`ArborError::OperationCancelled`] is returned, so no stale variant survives.
    #[tracing::instrument(skip_all, fields(entries = committed.len()))]
    pub async fn after_save(
        &self,
        mut scope: SaveScope,
        committed: &[EntityEntry],
        cancel: &Cancel,
    ) -> Result<SaveReport, ArborError> {
        let mut by_tree: BTreeMap<String, BTreeMap<ChangeReason, InvalidationTarget>> =
            BTreeMap::new();
        for entry in committed.iter() {
            let reasons = self.classifier.classify_entry(entry);
            for reason in reasons.iter() {
                by_tree
                    .entry(entry.tree.clone())
                    .or_default()
                    .entry(reason)
                    .or_insert_with(|| InvalidationTarget::new(&entry.tree))
                    .push(entry);
            }
        }

        let mut report = SaveReport::default();
        for (tree, targets) in by_tree.iter() {
            let present = ReasonSet(targets.keys().copied().collect());
            let effective = present.effective();
            // BTreeMap order is ChangeReason declaration order: Hierarchy first.
            for (reason, target) in targets.iter() {
                if !effective.contains(*reason) {
                    tracing::debug!("{} on '{}' superseded by Hierarchy", reason, tree);
                    scope.pending.mark_handled(tree, *reason);
                    report.superseded.push((tree.clone(), *reason));
                    continue;
                }
                if !scope.pending.mark_handled(tree, *reason) {
                    continue;
                }
                if cancel.is_cancelled() {
                    self.evict_all(by_tree.keys()).await;
                    return Err(ArborError::OperationCancelled);
                }
                let outcome = self.engine.apply(*reason, target, &self.store).await;
                report.outcome.merge(outcome);
                report.applied.push((tree.clone(), *reason));
                scope.pending.queue(*reason, tree);
            }
        }

        report.published = self.notifier.flush(&mut scope.pending);
        tracing::debug!(
            "Save processed: {} actions, {} superseded, published {:?}",
            report.applied.len(),
            report.superseded.len(),
            report.published
        );
        Ok(report)
    }

    async fn evict_all<'a, I: Iterator<Item = &'a String>>(&self, trees: I) {
        let trees = trees.cloned().collect::<BTreeSet<_>>();
        tracing::warn!("Invalidation cancelled; evicting all variants of {:?}", trees);
        for tree in trees.iter() {
            self.store.remove_by_pattern(&KeyPattern::tree(tree)).await;
        }
    }
}

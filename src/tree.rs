//! In-memory trees assembled from flat hierarchical rows.
//!
//! A [`Tree`] owns all of its nodes in one arena. A node's `children` list is the ownership
//! edge; its `parent` is a plain index used for upward navigation only. Values are held behind
//! `Arc` so a field patch swaps a node's value object without touching the tree's shape.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    fmt::Write,
    sync::Arc,
};

use crate::{
    error::ArborError,
    properties::{prop, EntityId, HierarchicalEntity, LocalizedValue},
};

pub type NodeIndex = usize;

/// What to do with a row whose parent id is not in the row set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Treat the row as an additional root.
    Promote,
    /// Leave the row (and therefore its subtree) out, logging a warning.
    #[default]
    Drop,
    /// Fail the build with [`ArborError::MalformedTree`].
    Reject,
}

/// Localized values of one entity for one language, keyed by property name.
pub type LocaleOverrides = BTreeMap<String, String>;

/// Group localized values by entity id.
pub fn group_overrides(values: &[LocalizedValue]) -> HashMap<EntityId, LocaleOverrides> {
    let mut grouped: HashMap<EntityId, LocaleOverrides> = HashMap::new();
    for value in values.iter() {
        if let Some(text) = &value.value {
            grouped
                .entry(value.entity_id)
                .or_default()
                .insert(value.key.clone(), text.clone());
        }
    }
    grouped
}

/// Payload carried by each cached node.
///
/// The patch methods return a replacement value object, or `None` when the payload cannot
/// absorb the change in place (the cached variant must then be evicted).
pub trait TreePayload: Send + Sync + 'static {
    fn from_entity(entity: &HierarchicalEntity, overrides: &LocaleOverrides) -> Self
    where
        Self: Sized;

    fn patch_data(&self, _entity: &HierarchicalEntity) -> Option<Self>
    where
        Self: Sized,
    {
        None
    }

    fn patch_localized(&self, _key: &str, _value: &str) -> Option<Self>
    where
        Self: Sized,
    {
        None
    }
}

/// Display payload of a navigation menu item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItemInfo {
    pub id: EntityId,
    pub name: String,
    pub alias: Option<String>,
    pub external_link: Option<String>,
    pub media_file_id: Option<u64>,
    pub badge_text: Option<String>,
    pub badge_style: i32,
    pub published: bool,
    /// Keys whose value came from a localization rather than the entity row.
    pub localized: BTreeSet<String>,
}

impl TreePayload for MenuItemInfo {
    fn from_entity(entity: &HierarchicalEntity, overrides: &LocaleOverrides) -> Self {
        let mut info = MenuItemInfo {
            id: entity.id,
            name: entity.name.clone(),
            alias: entity.alias.clone(),
            external_link: entity.external_link.clone(),
            media_file_id: entity.media_file_id,
            badge_text: entity.badge_text.clone(),
            badge_style: entity.badge_style,
            published: entity.published,
            localized: BTreeSet::new(),
        };
        for (key, value) in overrides.iter() {
            if info.set_localized(key, value) {
                info.localized.insert(key.clone());
            }
        }
        info
    }

    fn patch_data(&self, entity: &HierarchicalEntity) -> Option<Self> {
        let mut next = self.clone();
        if !self.localized.contains(prop::NAME) {
            next.name = entity.name.clone();
        }
        if !self.localized.contains(prop::BADGE_TEXT) {
            next.badge_text = entity.badge_text.clone();
        }
        next.alias = entity.alias.clone();
        next.external_link = entity.external_link.clone();
        next.media_file_id = entity.media_file_id;
        next.badge_style = entity.badge_style;
        Some(next)
    }

    fn patch_localized(&self, key: &str, value: &str) -> Option<Self> {
        let mut next = self.clone();
        if !next.set_localized(key, value) {
            return None;
        }
        next.localized.insert(key.to_string());
        Some(next)
    }
}

impl MenuItemInfo {
    fn set_localized(&mut self, key: &str, value: &str) -> bool {
        match key {
            prop::NAME => self.name = value.to_string(),
            prop::BADGE_TEXT => self.badge_text = Some(value.to_string()),
            _ => return false,
        }
        true
    }
}

#[derive(Debug)]
pub struct TreeNode<T> {
    id: EntityId,
    path: String,
    value: Arc<T>,
    parent: Option<NodeIndex>,
    children: Vec<NodeIndex>,
    /// Lazily resolved aggregate; `None` until computed.
    element_count: RwLock<Option<usize>>,
}

impl<T> Clone for TreeNode<T> {
    fn clone(&self) -> Self {
        TreeNode {
            id: self.id,
            path: self.path.clone(),
            value: self.value.clone(),
            parent: self.parent,
            children: self.children.clone(),
            element_count: RwLock::new(*self.element_count.read()),
        }
    }
}

impl<T> TreeNode<T> {
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    pub fn parent(&self) -> Option<NodeIndex> {
        self.parent
    }

    pub fn children(&self) -> &[NodeIndex] {
        &self.children
    }

    pub fn element_count(&self) -> Option<usize> {
        *self.element_count.read()
    }

    pub fn counts_resolved(&self) -> bool {
        self.element_count.read().is_some()
    }

    pub(crate) fn set_element_count(&self, count: usize) {
        *self.element_count.write() = Some(count);
    }

    pub(crate) fn reset_element_count(&self) {
        *self.element_count.write() = None;
    }
}

/// Result of trying to patch one node in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Patched,
    NotFound,
    Unsupported,
}

#[derive(Debug)]
pub struct Tree<T> {
    nodes: Vec<TreeNode<T>>,
    roots: Vec<NodeIndex>,
    index: HashMap<EntityId, NodeIndex>,
}

impl<T> Clone for Tree<T> {
    fn clone(&self) -> Self {
        Tree {
            nodes: self.nodes.clone(),
            roots: self.roots.clone(),
            index: self.index.clone(),
        }
    }
}

impl<T> Default for Tree<T> {
    fn default() -> Self {
        Tree {
            nodes: Vec::new(),
            roots: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> Tree<T> {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeIndex] {
        &self.roots
    }

    pub fn node(&self, idx: NodeIndex) -> Option<&TreeNode<T>> {
        self.nodes.get(idx)
    }

    pub fn index_of(&self, id: EntityId) -> Option<NodeIndex> {
        self.index.get(&id).copied()
    }

    pub fn get(&self, id: EntityId) -> Option<&TreeNode<T>> {
        self.index_of(id).and_then(|idx| self.nodes.get(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TreeNode<T>> {
        self.nodes.iter()
    }

    pub fn children(&self, idx: NodeIndex) -> impl Iterator<Item = &TreeNode<T>> {
        self.nodes
            .get(idx)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|child| self.nodes.get(*child))
    }

    pub fn parent(&self, idx: NodeIndex) -> Option<&TreeNode<T>> {
        self.nodes.get(idx)?.parent.and_then(|p| self.nodes.get(p))
    }

    /// Ancestors of `idx`, nearest first.
    pub fn ancestors(&self, idx: NodeIndex) -> impl Iterator<Item = &TreeNode<T>> {
        let mut current = self.nodes.get(idx).and_then(|n| n.parent);
        std::iter::from_fn(move || {
            let node = self.nodes.get(current?)?;
            current = node.parent;
            Some(node)
        })
    }

    /// `(id, parent id, ordered child ids)` per node in arena order. Two trees with equal
    /// shapes have the same parent/child relationships and sibling ordering.
    pub fn shape(&self) -> Vec<(EntityId, Option<EntityId>, Vec<EntityId>)> {
        self.nodes
            .iter()
            .map(|n| {
                (
                    n.id,
                    n.parent.map(|p| self.nodes[p].id),
                    n.children.iter().map(|c| self.nodes[*c].id).collect(),
                )
            })
            .collect()
    }

    /// Replace the value object of node `id` with the one produced by `patch`.
    pub fn patch_node<F>(&mut self, id: EntityId, patch: F) -> PatchOutcome
    where
        F: FnOnce(&T) -> Option<T>,
    {
        let Some(idx) = self.index_of(id) else {
            return PatchOutcome::NotFound;
        };
        let node = &mut self.nodes[idx];
        match patch(&node.value) {
            Some(next) => {
                node.value = Arc::new(next);
                PatchOutcome::Patched
            }
            None => PatchOutcome::Unsupported,
        }
    }

    /// Forget every resolved element count.
    pub fn reset_counts(&self) {
        for node in self.nodes.iter() {
            node.reset_element_count();
        }
    }

    /// Indented outline, one node per line.
    pub fn render<F: Fn(&T) -> String>(&self, label: F) -> String {
        let mut out = String::new();
        let mut stack = self
            .roots
            .iter()
            .rev()
            .map(|r| (*r, 0usize))
            .collect::<Vec<_>>();
        while let Some((idx, depth)) = stack.pop() {
            let node = &self.nodes[idx];
            let _ = writeln!(out, "{}{} [{}]", "  ".repeat(depth), label(&node.value), node.id);
            stack.extend(node.children.iter().rev().map(|c| (*c, depth + 1)));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TreeBuilder {
    policy: OrphanPolicy,
}

impl TreeBuilder {
    pub fn new(policy: OrphanPolicy) -> Self {
        TreeBuilder { policy }
    }

    /// Build a tree of [`TreePayload`] values, applying per-entity localized overrides.
    pub fn build_payloads<T: TreePayload>(
        &self,
        rows: &[HierarchicalEntity],
        overrides: &HashMap<EntityId, LocaleOverrides>,
    ) -> Result<Tree<T>, ArborError> {
        let empty = LocaleOverrides::new();
        self.build(rows, |row| {
            T::from_entity(row, overrides.get(&row.id).unwrap_or(&empty))
        })
    }

    /// Link rows under their parents, ordering siblings by `(display_order, id)`.
    #[tracing::instrument(skip_all, fields(rows = rows.len()))]
    pub fn build<T, F>(&self, rows: &[HierarchicalEntity], mut payload: F) -> Result<Tree<T>, ArborError>
    where
        F: FnMut(&HierarchicalEntity) -> T,
    {
        let mut by_id: BTreeMap<EntityId, &HierarchicalEntity> = BTreeMap::new();
        for row in rows.iter() {
            if by_id.insert(row.id, row).is_some() {
                return Err(ArborError::MalformedTree(format!(
                    "row {} appears more than once",
                    row.id
                )));
            }
        }

        let mut ordered = rows.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|row| (row.display_order, row.id));

        let mut roots = Vec::new();
        let mut children: HashMap<EntityId, Vec<&HierarchicalEntity>> = HashMap::new();
        for row in ordered {
            match row.parent_id {
                None => roots.push(row),
                Some(parent) if by_id.contains_key(&parent) => {
                    children.entry(parent).or_default().push(row)
                }
                Some(parent) => match self.policy {
                    OrphanPolicy::Promote => {
                        tracing::debug!("Promoting orphan {} (parent {} absent)", row.id, parent);
                        roots.push(row);
                    }
                    OrphanPolicy::Drop => {
                        tracing::warn!("Dropping orphan {} (parent {} absent)", row.id, parent);
                    }
                    OrphanPolicy::Reject => {
                        return Err(ArborError::MalformedTree(format!(
                            "row {} references missing parent {}",
                            row.id, parent
                        )));
                    }
                },
            }
        }

        let mut tree = Tree::default();
        let mut queue = VecDeque::new();
        for root in roots {
            let idx = tree.push(root, None, &mut payload);
            tree.roots.push(idx);
            queue.push_back(idx);
        }
        while let Some(idx) = queue.pop_front() {
            let id = tree.nodes[idx].id;
            for child in children.get(&id).map(Vec::as_slice).unwrap_or_default() {
                let child_idx = tree.push(child, Some(idx), &mut payload);
                tree.nodes[idx].children.push(child_idx);
                queue.push_back(child_idx);
            }
        }

        if tree.len() < rows.len() {
            tracing::warn!(
                "{} of {} rows are unreachable from a root and were left out",
                rows.len() - tree.len(),
                rows.len()
            );
        }
        Ok(tree)
    }
}

impl<T> Tree<T> {
    fn push<F>(&mut self, row: &HierarchicalEntity, parent: Option<NodeIndex>, payload: &mut F) -> NodeIndex
    where
        F: FnMut(&HierarchicalEntity) -> T,
    {
        let idx = self.nodes.len();
        self.nodes.push(TreeNode {
            id: row.id,
            path: row.tree_path.clone(),
            value: Arc::new(payload(row)),
            parent,
            children: Vec::new(),
            element_count: RwLock::new(None),
        });
        self.index.insert(row.id, idx);
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: EntityId, parent: Option<EntityId>, order: i32) -> HierarchicalEntity {
        HierarchicalEntity {
            id,
            tree: "main".into(),
            parent_id: parent,
            tree_path: String::new(),
            display_order: order,
            name: format!("item-{id}"),
            published: true,
            ..Default::default()
        }
    }

    fn sample() -> Vec<HierarchicalEntity> {
        vec![
            row(9, Some(5), 0),
            row(2, None, 0),
            row(7, Some(2), 1),
            row(5, Some(2), 0),
            row(11, Some(2), 0),
        ]
    }

    #[test]
    fn children_are_ordered_by_display_order_then_id() {
        let tree = TreeBuilder::default()
            .build(&sample(), |r| r.name.clone())
            .unwrap();
        let root = tree.roots()[0];
        let kids = tree.children(root).map(|n| n.id()).collect::<Vec<_>>();
        assert_eq!(kids, vec![5, 11, 7]);
        let nine = tree.index_of(9).unwrap();
        let ancestors = tree.ancestors(nine).map(|n| n.id()).collect::<Vec<_>>();
        assert_eq!(ancestors, vec![5, 2]);
    }

    #[test]
    fn rebuild_is_idempotent() {
        let builder = TreeBuilder::default();
        let a = builder.build(&sample(), |r| r.id).unwrap();
        let mut reversed = sample();
        reversed.reverse();
        let b = builder.build(&reversed, |r| r.id).unwrap();
        assert_eq!(a.shape(), b.shape());
    }

    #[test]
    fn orphan_policies() {
        let mut rows = sample();
        rows.push(row(40, Some(99), 0));
        rows.push(row(41, Some(40), 0));

        let dropped = TreeBuilder::new(OrphanPolicy::Drop)
            .build(&rows, |r| r.id)
            .unwrap();
        assert!(dropped.get(40).is_none());
        assert!(dropped.get(41).is_none());

        let promoted = TreeBuilder::new(OrphanPolicy::Promote)
            .build(&rows, |r| r.id)
            .unwrap();
        assert_eq!(promoted.roots().len(), 2);
        assert_eq!(promoted.get(41).and_then(|n| n.parent()), promoted.index_of(40));

        let rejected = TreeBuilder::new(OrphanPolicy::Reject).build(&rows, |r| r.id);
        assert!(matches!(rejected, Err(ArborError::MalformedTree(_))));
    }

    #[test]
    fn duplicate_rows_are_malformed() {
        let rows = vec![row(1, None, 0), row(1, None, 1)];
        let res = TreeBuilder::default().build(&rows, |r| r.id);
        assert!(matches!(res, Err(ArborError::MalformedTree(_))));
    }

    #[test]
    fn patch_replaces_value_but_not_shape() {
        let mut tree: Tree<MenuItemInfo> = TreeBuilder::default()
            .build_payloads(&sample(), &HashMap::new())
            .unwrap();
        let shape = tree.shape();
        let untouched = tree.get(7).unwrap().value().clone();

        let mut renamed = row(5, Some(2), 0);
        renamed.name = "Renamed".into();
        let outcome = tree.patch_node(5, |v| v.patch_data(&renamed));

        assert_eq!(outcome, PatchOutcome::Patched);
        assert_eq!(tree.get(5).unwrap().value().name, "Renamed");
        assert!(Arc::ptr_eq(tree.get(7).unwrap().value(), &untouched));
        assert_eq!(tree.shape(), shape);
        assert_eq!(tree.patch_node(404, |v| v.patch_data(&renamed)), PatchOutcome::NotFound);
    }

    #[test]
    fn data_patch_keeps_localized_name() {
        let overrides = LocaleOverrides::from([("Name".to_string(), "Schuhe".to_string())]);
        let entity = row(5, None, 0);
        let info = MenuItemInfo::from_entity(&entity, &overrides);
        assert_eq!(info.name, "Schuhe");

        let mut changed = entity.clone();
        changed.name = "Footwear".into();
        changed.alias = Some("footwear".into());
        let patched = info.patch_data(&changed).unwrap();
        assert_eq!(patched.name, "Schuhe");
        assert_eq!(patched.alias.as_deref(), Some("footwear"));

        assert!(info.patch_localized("ShortDescription", "x").is_none());
    }
}

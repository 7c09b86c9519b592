pub use enumset::EnumSet;

use enumset::EnumSetType;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter},
    ops::{Deref, DerefMut},
};

/// Row identifier of a hierarchical entity. Zero is never a valid persisted id; it marks a
/// draft that has not been inserted yet.
pub type EntityId = u64;

/// Property names reported by the persistence layer for modified columns.
pub mod prop {
    pub const PARENT_ID: &str = "ParentId";
    pub const PUBLISHED: &str = "Published";
    pub const DELETED: &str = "Deleted";
    pub const DISPLAY_ORDER: &str = "DisplayOrder";
    pub const TREE_PATH: &str = "TreePath";
    pub const NAME: &str = "Name";
    pub const ALIAS: &str = "Alias";
    pub const EXTERNAL_LINK: &str = "ExternalLink";
    pub const MEDIA_FILE_ID: &str = "MediaFileId";
    pub const BADGE_TEXT: &str = "BadgeText";
    pub const BADGE_STYLE: &str = "BadgeStyle";
    pub const LIMITED_TO_STORES: &str = "LimitedToStores";
    pub const SUBJECT_TO_ACL: &str = "SubjectToAcl";
    pub const CREATED_ON_UTC: &str = "CreatedOnUtc";
    pub const UPDATED_ON_UTC: &str = "UpdatedOnUtc";
}

/// A self-referencing row of a logical tree (menu items, categories, ...).
///
/// `tree_path` is the denormalized ancestor chain (see [crate::paths::path]) and must always
/// agree with the `parent_id` chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchicalEntity {
    pub id: EntityId,
    /// Name of the logical tree this row belongs to. Also the scope of path rewrites.
    pub tree: String,
    pub parent_id: Option<EntityId>,
    pub tree_path: String,
    pub display_order: i32,
    pub published: bool,
    pub deleted: bool,
    pub name: String,
    pub alias: Option<String>,
    pub external_link: Option<String>,
    pub media_file_id: Option<u64>,
    pub badge_text: Option<String>,
    pub badge_style: i32,
    pub limited_to_stores: bool,
    pub store_ids: BTreeSet<u32>,
    pub subject_to_acl: bool,
    pub role_ids: BTreeSet<u32>,
}

impl HierarchicalEntity {
    /// An unsaved, published root row. Set `parent_id` before inserting to create a child.
    pub fn draft(tree: &str, name: &str) -> Self {
        HierarchicalEntity {
            tree: tree.to_string(),
            name: name.to_string(),
            published: true,
            ..Default::default()
        }
    }

    pub fn is_draft(&self) -> bool {
        self.id == 0
    }

    pub fn with_parent(mut self, parent_id: EntityId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_order(mut self, display_order: i32) -> Self {
        self.display_order = display_order;
        self
    }

    /// Whether the row is visible in a variant for the given store. `None` means the variant
    /// is store-agnostic.
    pub fn visible_in_store(&self, store: Option<&[u32]>) -> bool {
        match store {
            Some(stores) if self.limited_to_stores => {
                stores.iter().any(|s| self.store_ids.contains(s))
            }
            _ => true,
        }
    }

    /// Whether the row is visible to the given customer roles. `None` means the variant is
    /// ACL-agnostic.
    pub fn visible_to_roles(&self, roles: Option<&[u32]>) -> bool {
        match roles {
            Some(roles) if self.subject_to_acl => roles.iter().any(|r| self.role_ids.contains(r)),
            _ => true,
        }
    }

    /// Names of the properties that differ between `self` (initial) and `other` (current).
    pub fn modified_properties(&self, other: &HierarchicalEntity) -> BTreeSet<String> {
        let mut modified = BTreeSet::new();
        let mut check = |changed: bool, name: &str| {
            if changed {
                modified.insert(name.to_string());
            }
        };
        check(self.parent_id != other.parent_id, prop::PARENT_ID);
        check(self.tree_path != other.tree_path, prop::TREE_PATH);
        check(self.display_order != other.display_order, prop::DISPLAY_ORDER);
        check(self.published != other.published, prop::PUBLISHED);
        check(self.deleted != other.deleted, prop::DELETED);
        check(self.name != other.name, prop::NAME);
        check(self.alias != other.alias, prop::ALIAS);
        check(self.external_link != other.external_link, prop::EXTERNAL_LINK);
        check(self.media_file_id != other.media_file_id, prop::MEDIA_FILE_ID);
        check(self.badge_text != other.badge_text, prop::BADGE_TEXT);
        check(self.badge_style != other.badge_style, prop::BADGE_STYLE);
        check(
            self.limited_to_stores != other.limited_to_stores
                || self.store_ids != other.store_ids,
            prop::LIMITED_TO_STORES,
        );
        check(
            self.subject_to_acl != other.subject_to_acl || self.role_ids != other.role_ids,
            prop::SUBJECT_TO_ACL,
        );
        modified
    }
}

/// A localized override of one property of a tree node for one language. `value == None`
/// records a removed localization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedValue {
    pub entity_id: EntityId,
    pub tree: String,
    pub language_id: u32,
    pub key: String,
    pub value: Option<String>,
}

/// Tag carried by every mutation; the classifier dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// The hierarchical entity itself.
    TreeNode,
    /// Rows counted beneath a node (e.g. product-to-category memberships).
    Membership,
    LocalizedProperty,
    StoreMapping,
    AclRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    Added,
    Modified,
    Deleted,
}

/// The row payload attached to a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntitySnapshot {
    Node(HierarchicalEntity),
    Localized(LocalizedValue),
    /// Store mapping or ACL record attached to the node `entity_id`.
    Mapping { entity_id: EntityId, target_id: u32 },
    /// A counted item `item_id` joined to or removed from the node `entity_id`.
    Membership { entity_id: EntityId, item_id: u64 },
}

impl EntitySnapshot {
    pub fn entity_id(&self) -> EntityId {
        match self {
            EntitySnapshot::Node(entity) => entity.id,
            EntitySnapshot::Localized(value) => value.entity_id,
            EntitySnapshot::Mapping { entity_id, .. } => *entity_id,
            EntitySnapshot::Membership { entity_id, .. } => *entity_id,
        }
    }
}

/// One changed row as seen by the mutation hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityEntry {
    pub kind: EntityKind,
    pub state: EntryState,
    pub tree: String,
    pub modified: BTreeSet<String>,
    pub snapshot: EntitySnapshot,
    /// Row state before the save, for modified tree nodes.
    pub initial: Option<HierarchicalEntity>,
}

impl EntityEntry {
    pub fn node_added(entity: HierarchicalEntity) -> Self {
        EntityEntry {
            kind: EntityKind::TreeNode,
            state: EntryState::Added,
            tree: entity.tree.clone(),
            modified: BTreeSet::new(),
            snapshot: EntitySnapshot::Node(entity),
            initial: None,
        }
    }

    /// A modified tree node; the modified property set is derived from the two states.
    pub fn node_modified(initial: HierarchicalEntity, current: HierarchicalEntity) -> Self {
        EntityEntry {
            kind: EntityKind::TreeNode,
            state: EntryState::Modified,
            tree: current.tree.clone(),
            modified: initial.modified_properties(&current),
            snapshot: EntitySnapshot::Node(current),
            initial: Some(initial),
        }
    }

    pub fn node_deleted(entity: HierarchicalEntity) -> Self {
        EntityEntry {
            kind: EntityKind::TreeNode,
            state: EntryState::Deleted,
            tree: entity.tree.clone(),
            modified: BTreeSet::new(),
            initial: Some(entity.clone()),
            snapshot: EntitySnapshot::Node(entity),
        }
    }

    pub fn localized(value: LocalizedValue, state: EntryState) -> Self {
        EntityEntry {
            kind: EntityKind::LocalizedProperty,
            state,
            tree: value.tree.clone(),
            modified: BTreeSet::from([value.key.clone()]),
            snapshot: EntitySnapshot::Localized(value),
            initial: None,
        }
    }

    pub fn store_mapping(tree: &str, entity_id: EntityId, store_id: u32, state: EntryState) -> Self {
        Self::mapping(EntityKind::StoreMapping, tree, entity_id, store_id, state)
    }

    pub fn acl_record(tree: &str, entity_id: EntityId, role_id: u32, state: EntryState) -> Self {
        Self::mapping(EntityKind::AclRecord, tree, entity_id, role_id, state)
    }

    fn mapping(
        kind: EntityKind,
        tree: &str,
        entity_id: EntityId,
        target_id: u32,
        state: EntryState,
    ) -> Self {
        EntityEntry {
            kind,
            state,
            tree: tree.to_string(),
            modified: BTreeSet::new(),
            snapshot: EntitySnapshot::Mapping {
                entity_id,
                target_id,
            },
            initial: None,
        }
    }

    pub fn membership(tree: &str, entity_id: EntityId, item_id: u64, state: EntryState) -> Self {
        EntityEntry {
            kind: EntityKind::Membership,
            state,
            tree: tree.to_string(),
            modified: BTreeSet::new(),
            snapshot: EntitySnapshot::Membership { entity_id, item_id },
            initial: None,
        }
    }

    pub fn node(&self) -> Option<&HierarchicalEntity> {
        match &self.snapshot {
            EntitySnapshot::Node(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn node_mut(&mut self) -> Option<&mut HierarchicalEntity> {
        match &mut self.snapshot {
            EntitySnapshot::Node(entity) => Some(entity),
            _ => None,
        }
    }
}

/// Why a cached variant may be stale. The declaration order is the processing order within
/// a save: a full-tree eviction must land before any patch attempt on the same tree.
#[derive(Debug, PartialOrd, Ord, Hash, Serialize, Deserialize, EnumSetType)]
#[enumset(repr = "u8")]
pub enum ChangeReason {
    Hierarchy,
    StoreMapping,
    Acl,
    Data,
    Localization,
    ElementCounts,
}

impl Display for ChangeReason {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ChangeReason::Hierarchy => write!(f, "Hierarchy"),
            ChangeReason::StoreMapping => write!(f, "StoreMapping"),
            ChangeReason::Acl => write!(f, "Acl"),
            ChangeReason::Data => write!(f, "Data"),
            ChangeReason::Localization => write!(f, "Localization"),
            ChangeReason::ElementCounts => write!(f, "ElementCounts"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReasonSet(pub EnumSet<ChangeReason>);

impl Deref for ReasonSet {
    type Target = EnumSet<ChangeReason>;
    fn deref(&self) -> &EnumSet<ChangeReason> {
        &self.0
    }
}

impl DerefMut for ReasonSet {
    fn deref_mut(&mut self) -> &mut EnumSet<ChangeReason> {
        &mut self.0
    }
}

impl From<EnumSet<ChangeReason>> for ReasonSet {
    fn from(set: EnumSet<ChangeReason>) -> Self {
        ReasonSet(set)
    }
}

impl From<ChangeReason> for ReasonSet {
    fn from(reason: ChangeReason) -> Self {
        ReasonSet(EnumSet::only(reason))
    }
}

impl ReasonSet {
    /// Reasons that still require an action. A shape change makes targeted patches moot.
    pub fn effective(&self) -> ReasonSet {
        if self.0.contains(ChangeReason::Hierarchy) {
            ReasonSet(self.0 - ChangeReason::Data - ChangeReason::Localization)
        } else {
            *self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modified_properties_reports_changed_columns() {
        let initial = HierarchicalEntity {
            id: 5,
            tree: "main".into(),
            parent_id: Some(2),
            tree_path: "2/5".into(),
            name: "Shoes".into(),
            ..Default::default()
        };
        let mut current = initial.clone();
        current.name = "Boots".into();
        current.parent_id = Some(7);

        let modified = initial.modified_properties(&current);
        assert_eq!(
            modified,
            BTreeSet::from([prop::NAME.to_string(), prop::PARENT_ID.to_string()])
        );
    }

    #[test]
    fn effective_drops_patch_reasons_under_hierarchy() {
        let set = ReasonSet(ChangeReason::Data | ChangeReason::Hierarchy | ChangeReason::Acl);
        assert_eq!(
            set.effective(),
            ReasonSet(ChangeReason::Hierarchy | ChangeReason::Acl)
        );

        let set = ReasonSet(ChangeReason::Data | ChangeReason::Localization);
        assert_eq!(set.effective(), set);
    }

    #[test]
    fn reasons_iterate_in_processing_order() {
        let set: EnumSet<ChangeReason> =
            ChangeReason::ElementCounts | ChangeReason::Data | ChangeReason::Hierarchy;
        let order: Vec<_> = set.iter().collect();
        assert_eq!(
            order,
            vec![
                ChangeReason::Hierarchy,
                ChangeReason::Data,
                ChangeReason::ElementCounts
            ]
        );
    }

    #[test]
    fn store_visibility_respects_agnostic_variants() {
        let mut entity = HierarchicalEntity::draft("main", "Sale");
        entity.limited_to_stores = true;
        entity.store_ids = BTreeSet::from([3]);
        assert!(entity.visible_in_store(None));
        assert!(entity.visible_in_store(Some(&[3])));
        assert!(!entity.visible_in_store(Some(&[7])));
    }
}

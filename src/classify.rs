//! Maps a mutated row to the reasons its tree's cached variants may be stale.
//!
//! Dispatch is a lookup keyed by [`EntityKind`]; each kind carries one [`ClassRule`].

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::{
    config::TreeConfig,
    properties::{prop, ChangeReason, EntityEntry, EntityKind, EntryState, ReasonSet},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassRule {
    /// Per-property reasons. Properties in `ignored` never trigger anything; properties absent
    /// from both sets are unknown and classify as `Hierarchy`. Added and deleted rows are
    /// always `Hierarchy`.
    Properties {
        map: HashMap<String, ChangeReason>,
        ignored: HashSet<String>,
    },
    /// Every mutation of this kind maps to one reason.
    Always(ChangeReason),
    /// Localized strings; only the listed keys feed cached payloads.
    LocalizedKeys(BTreeSet<String>),
}

#[derive(Debug, Clone)]
pub struct ChangeClassifier {
    rules: HashMap<EntityKind, ClassRule>,
}

impl ChangeClassifier {
    pub fn new(config: &TreeConfig) -> Self {
        let mut map = HashMap::new();
        for name in [
            prop::PARENT_ID,
            prop::PUBLISHED,
            prop::DELETED,
            prop::DISPLAY_ORDER,
        ] {
            map.insert(name.to_string(), ChangeReason::Hierarchy);
        }
        map.insert(prop::LIMITED_TO_STORES.to_string(), ChangeReason::StoreMapping);
        map.insert(prop::SUBJECT_TO_ACL.to_string(), ChangeReason::Acl);
        for name in [
            prop::NAME,
            prop::ALIAS,
            prop::EXTERNAL_LINK,
            prop::MEDIA_FILE_ID,
            prop::BADGE_TEXT,
            prop::BADGE_STYLE,
        ] {
            map.insert(name.to_string(), ChangeReason::Data);
        }
        let ignored = [prop::TREE_PATH, prop::CREATED_ON_UTC, prop::UPDATED_ON_UTC]
            .into_iter()
            .map(String::from)
            .collect();

        let rules = HashMap::from([
            (EntityKind::TreeNode, ClassRule::Properties { map, ignored }),
            (
                EntityKind::Membership,
                ClassRule::Always(ChangeReason::ElementCounts),
            ),
            (
                EntityKind::StoreMapping,
                ClassRule::Always(ChangeReason::StoreMapping),
            ),
            (EntityKind::AclRecord, ClassRule::Always(ChangeReason::Acl)),
            (
                EntityKind::LocalizedProperty,
                ClassRule::LocalizedKeys(config.localized_keys.clone()),
            ),
        ]);
        ChangeClassifier { rules }
    }

    pub fn with_rule(mut self, kind: EntityKind, rule: ClassRule) -> Self {
        self.rules.insert(kind, rule);
        self
    }

    pub fn classify(
        &self,
        kind: EntityKind,
        state: EntryState,
        modified: &BTreeSet<String>,
    ) -> ReasonSet {
        let mut reasons = ReasonSet::default();
        match self.rules.get(&kind) {
            None => {
                tracing::warn!("No classification rule for {:?}; assuming Hierarchy", kind);
                reasons.insert(ChangeReason::Hierarchy);
            }
            Some(ClassRule::Always(reason)) => {
                reasons.insert(*reason);
            }
            Some(ClassRule::LocalizedKeys(keys)) => {
                if modified.iter().any(|key| keys.contains(key)) {
                    reasons.insert(ChangeReason::Localization);
                }
            }
            Some(ClassRule::Properties { map, ignored }) => {
                if state != EntryState::Modified {
                    reasons.insert(ChangeReason::Hierarchy);
                    return reasons;
                }
                for name in modified.iter().filter(|n| !ignored.contains(*n)) {
                    match map.get(name) {
                        Some(reason) => {
                            reasons.insert(*reason);
                        }
                        None => {
                            tracing::debug!("Unclassified property {}; assuming Hierarchy", name);
                            reasons.insert(ChangeReason::Hierarchy);
                        }
                    }
                }
            }
        }
        reasons
    }

    pub fn classify_entry(&self, entry: &EntityEntry) -> ReasonSet {
        self.classify(entry.kind, entry.state, &entry.modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn classifier() -> ChangeClassifier {
        ChangeClassifier::new(&TreeConfig::default())
    }

    #[test]
    fn node_properties_map_to_reasons() {
        let c = classifier();
        let reasons = c.classify(
            EntityKind::TreeNode,
            EntryState::Modified,
            &props(&["Name", "ParentId"]),
        );
        assert_eq!(
            reasons,
            ReasonSet(ChangeReason::Data | ChangeReason::Hierarchy)
        );
        assert_eq!(
            c.classify(
                EntityKind::TreeNode,
                EntryState::Modified,
                &props(&["LimitedToStores"])
            ),
            ReasonSet::from(ChangeReason::StoreMapping)
        );
    }

    #[test]
    fn unknown_property_is_hierarchy_and_audit_columns_are_ignored() {
        let c = classifier();
        assert_eq!(
            c.classify(
                EntityKind::TreeNode,
                EntryState::Modified,
                &props(&["IconClass"])
            ),
            ReasonSet::from(ChangeReason::Hierarchy)
        );
        assert!(c
            .classify(
                EntityKind::TreeNode,
                EntryState::Modified,
                &props(&["TreePath", "UpdatedOnUtc"])
            )
            .is_empty());
    }

    #[test]
    fn added_nodes_and_related_kinds() {
        let c = classifier();
        let none = BTreeSet::new();
        assert_eq!(
            c.classify(EntityKind::TreeNode, EntryState::Added, &none),
            ReasonSet::from(ChangeReason::Hierarchy)
        );
        assert_eq!(
            c.classify(EntityKind::Membership, EntryState::Deleted, &none),
            ReasonSet::from(ChangeReason::ElementCounts)
        );
        assert_eq!(
            c.classify(EntityKind::AclRecord, EntryState::Added, &none),
            ReasonSet::from(ChangeReason::Acl)
        );
    }

    #[test]
    fn only_tracked_locale_keys_count() {
        let c = classifier();
        assert_eq!(
            c.classify(
                EntityKind::LocalizedProperty,
                EntryState::Modified,
                &props(&["Name"])
            ),
            ReasonSet::from(ChangeReason::Localization)
        );
        assert!(c
            .classify(
                EntityKind::LocalizedProperty,
                EntryState::Added,
                &props(&["MetaKeywords"])
            )
            .is_empty());
    }

    #[test]
    fn missing_rule_falls_back_to_hierarchy() {
        let mut c = classifier();
        c.rules.remove(&EntityKind::Membership);
        assert_eq!(
            c.classify(EntityKind::Membership, EntryState::Added, &BTreeSet::new()),
            ReasonSet::from(ChangeReason::Hierarchy)
        );
    }
}

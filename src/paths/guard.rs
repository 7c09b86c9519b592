//! Pre-emptive cycle detection for parent changes.

use std::{collections::BTreeMap, future::Future};

use crate::{error::ArborError, properties::EntityId, source::HierarchySource};

/// Read-only parent lookup used while walking an ancestor chain.
pub trait AncestorLookup: Sync {
    /// `Ok(None)` when the row does not exist, `Ok(Some(None))` for a root.
    fn parent_of(
        &self,
        id: EntityId,
    ) -> impl Future<Output = Result<Option<Option<EntityId>>, ArborError>> + Send;
}

impl<S: HierarchySource> AncestorLookup for S {
    async fn parent_of(&self, id: EntityId) -> Result<Option<Option<EntityId>>, ArborError> {
        Ok(self.find_by_id(id).await?.map(|row| row.parent_id))
    }
}

/// Pre-fetched `id -> parent_id` map.
impl AncestorLookup for BTreeMap<EntityId, Option<EntityId>> {
    async fn parent_of(&self, id: EntityId) -> Result<Option<Option<EntityId>>, ArborError> {
        Ok(self.get(&id).copied())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CycleGuard {
    max_depth: usize,
}

impl CycleGuard {
    /// `max_depth` should be the entity count of the tree: no well-formed chain is longer.
    pub fn new(max_depth: usize) -> Self {
        CycleGuard {
            max_depth: max_depth.max(1),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub async fn would_cycle<L: AncestorLookup>(
        &self,
        node_id: EntityId,
        candidate_parent_id: EntityId,
        lookup: &L,
    ) -> Result<bool, ArborError> {
        Ok(self
            .find_cycle(node_id, candidate_parent_id, lookup)
            .await?
            .is_some())
    }

    /// Walk from `candidate_parent_id` toward the root. Returns the walked chain if `node_id`
    /// appears in it, or if the walk exceeds the depth bound (a corrupt stored cycle that does
    /// not involve `node_id` is still refused).
    #[tracing::instrument(skip(self, lookup))]
    pub async fn find_cycle<L: AncestorLookup>(
        &self,
        node_id: EntityId,
        candidate_parent_id: EntityId,
        lookup: &L,
    ) -> Result<Option<Vec<EntityId>>, ArborError> {
        let mut chain = Vec::new();
        let mut current = Some(candidate_parent_id);
        while let Some(cur) = current {
            chain.push(cur);
            if cur == node_id {
                return Ok(Some(chain));
            }
            if chain.len() > self.max_depth {
                tracing::warn!(
                    "Ancestor walk from {} exceeded {} steps; treating as a cycle",
                    candidate_parent_id,
                    self.max_depth
                );
                return Ok(Some(chain));
            }
            current = match lookup.parent_of(cur).await? {
                Some(parent) => parent,
                None => {
                    tracing::debug!("Ancestor {} not found, chain ends", cur);
                    None
                }
            };
        }
        Ok(None)
    }
}

use parking_lot::RwLock;
use std::collections::HashSet;
use storygraph_core::{Entity, EntityId};
use storygraph_patch::{apply_patch, PatchRequest, PatchSummary};
use tracing::{debug, info};

/// Owns the canonical entity set for one session.
///
/// `apply` is the single writer path: all mutations flow through the
/// patch protocol. Readers take cheap cloned snapshots; insertion order
/// is preserved so gallery-style consumers render stably.
#[derive(Default)]
pub struct EntityGraph {
    entities: RwLock<Vec<Entity>>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entities(entities: Vec<Entity>) -> Self {
        Self {
            entities: RwLock::new(entities),
        }
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        self.entities.read().iter().find(|e| e.id == id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.read().iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    /// Read snapshot of the full entity set.
    pub fn snapshot(&self) -> Vec<Entity> {
        self.entities.read().clone()
    }

    /// Apply a patch request through the protocol and commit the result.
    pub fn apply(&self, request: &PatchRequest) -> PatchSummary {
        let mut entities = self.entities.write();
        let (next, summary) = apply_patch(&entities, request);
        *entities = next;
        debug!(
            entities = entities.len(),
            deleted = summary.deleted.len(),
            "patch committed"
        );
        summary
    }

    /// Set an entity's image reference outside the patch path. Used by
    /// the session after image synthesis completes.
    pub fn set_image_ref(&self, id: &str, image_ref: impl Into<String>) -> bool {
        let mut entities = self.entities.write();
        match entities.iter_mut().find(|e| e.id == id) {
            Some(entity) => {
                entity.image_ref = Some(image_ref.into());
                entity.update_image = false;
                true
            }
            None => false,
        }
    }

    /// Follow-up reconciliation pass: drop parent/child ids that no
    /// longer resolve to an existing entity. The patch protocol itself
    /// never prunes; callers run this after deletions.
    pub fn prune_dangling_references(&self) -> usize {
        let mut entities = self.entities.write();
        let live: HashSet<EntityId> = entities.iter().map(|e| e.id.clone()).collect();
        let mut pruned = 0usize;
        for entity in entities.iter_mut() {
            let before = entity.parent_ids.len() + entity.child_ids.len();
            entity.parent_ids.retain(|id| live.contains(id));
            entity.child_ids.retain(|id| live.contains(id));
            pruned += before - (entity.parent_ids.len() + entity.child_ids.len());
        }
        if pruned > 0 {
            info!(pruned, "dangling references reconciled");
        }
        pruned
    }

    /// Replace the whole set, used when restoring a session snapshot.
    pub fn restore(&self, entities: Vec<Entity>) {
        *self.entities.write() = entities;
    }
}

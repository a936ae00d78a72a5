use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use storygraph_core::{Entity, EntityId};

/// One ordered search-and-replace step inside a `TextDiff`.
///
/// `find` must literally match the `occurrence`-th instance (1-indexed)
/// of the substring in the field's current value; otherwise the
/// instruction is a local no-op recorded as a diagnostic. An empty
/// `replace` deletes the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffInstruction {
    pub find: String,
    pub replace: String,
    #[serde(default = "default_occurrence")]
    pub occurrence: usize,
}

fn default_occurrence() -> usize {
    1
}

impl DiffInstruction {
    pub fn new(find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            find: find.into(),
            replace: replace.into(),
            occurrence: 1,
        }
    }

    pub fn at_occurrence(mut self, occurrence: usize) -> Self {
        self.occurrence = occurrence;
        self
    }
}

/// A field-level edit. The wire form is externally tagged:
/// `{"rpl": <value>}` for a whole-field overwrite, `{"df": [..]}` for an
/// ordered instruction list. The map shape of `EntityUpdate::fields`
/// guarantees a field never carries both in one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldOp {
    #[serde(rename = "rpl")]
    Replace(Value),
    #[serde(rename = "df")]
    TextDiff(Vec<DiffInstruction>),
}

/// Per-entity field edits plus the image-regeneration flag, which lives
/// beside the field map, not inside it (wire key `img_upd`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldOp>,
    #[serde(default)]
    pub image_regenerate: bool,
}

impl EntityUpdate {
    pub fn replace(field: impl Into<String>, value: Value) -> Self {
        let mut update = Self::default();
        update.fields.insert(field.into(), FieldOp::Replace(value));
        update
    }

    pub fn diff(field: impl Into<String>, instructions: Vec<DiffInstruction>) -> Self {
        let mut update = Self::default();
        update
            .fields
            .insert(field.into(), FieldOp::TextDiff(instructions));
        update
    }

    pub fn with_field(mut self, field: impl Into<String>, op: FieldOp) -> Self {
        self.fields.insert(field.into(), op);
        self
    }

    pub fn with_image_regenerate(mut self) -> Self {
        self.image_regenerate = true;
        self
    }
}

/// A structured description of entity changes: creations, field updates,
/// deletions. Applied in that order; deleting an id that is also updated
/// in the same request is delete-wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchRequest {
    #[serde(rename = "n_nodes", default)]
    pub new_entities: Vec<Entity>,
    #[serde(rename = "u_nodes", default)]
    pub updates: BTreeMap<EntityId, EntityUpdate>,
    #[serde(rename = "d_nodes", default)]
    pub deletions: BTreeSet<EntityId>,
}

impl PatchRequest {
    pub fn is_empty(&self) -> bool {
        self.new_entities.is_empty() && self.updates.is_empty() && self.deletions.is_empty()
    }

    pub fn with_new_entity(mut self, entity: Entity) -> Self {
        self.new_entities.push(entity);
        self
    }

    pub fn with_update(mut self, id: impl Into<EntityId>, update: EntityUpdate) -> Self {
        self.updates.insert(id.into(), update);
        self
    }

    pub fn with_deletion(mut self, id: impl Into<EntityId>) -> Self {
        self.deletions.insert(id.into());
        self
    }
}

/// A diagnostic for one locally-failed instruction or field. Local means
/// the rest of the request still applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDiagnostic {
    pub entity_id: EntityId,
    pub field: Option<String>,
    pub message: String,
}

/// What `apply_patch` actually did, with diagnostics for everything it
/// skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchSummary {
    pub created: Vec<EntityId>,
    pub updated: Vec<EntityId>,
    pub deleted: Vec<EntityId>,
    /// Entities whose update carried the image-regeneration flag.
    pub image_requests: Vec<EntityId>,
    pub diagnostics: Vec<PatchDiagnostic>,
}

impl PatchSummary {
    pub(crate) fn diagnose(
        &mut self,
        entity_id: &str,
        field: Option<&str>,
        message: impl Into<String>,
    ) {
        self.diagnostics.push(PatchDiagnostic {
            entity_id: entity_id.to_string(),
            field: field.map(str::to_string),
            message: message.into(),
        });
    }
}

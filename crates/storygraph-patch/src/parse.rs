use crate::{EntityUpdate, FieldOp, PatchRequest};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use storygraph_core::{strip_code_fence, Entity, Result, StoryGraphError};
use tracing::warn;

/// Wire key for the image-regeneration flag, which sits beside the field
/// ops inside a `u_nodes` entry.
const IMAGE_FLAG_KEY: &str = "img_upd";

/// Parse a model-emitted patch payload (`n_nodes`/`u_nodes`/`d_nodes`)
/// into a typed `PatchRequest`.
///
/// This is the validation boundary: unknown op shapes are rejected here
/// as `MalformedResponse` (raw text attached) before anything reaches the
/// protocol layer.
pub fn parse_patch_payload(raw: &str) -> Result<PatchRequest> {
    let body = strip_code_fence(raw);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| malformed(format!("payload is not JSON: {}", e), raw))?;
    let object = value
        .as_object()
        .ok_or_else(|| malformed("payload is not a JSON object", raw))?;

    for key in object.keys() {
        if !matches!(key.as_str(), "n_nodes" | "u_nodes" | "d_nodes") {
            warn!(key = %key, "ignoring unknown top-level patch key");
        }
    }

    let new_entities: Vec<Entity> = match object.get("n_nodes") {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| malformed(format!("n_nodes: {}", e), raw))?,
        None => Vec::new(),
    };

    let mut updates: BTreeMap<String, EntityUpdate> = BTreeMap::new();
    if let Some(u_nodes) = object.get("u_nodes") {
        let entries = u_nodes
            .as_object()
            .ok_or_else(|| malformed("u_nodes must be an object keyed by entity id", raw))?;
        for (id, fields) in entries {
            updates.insert(id.clone(), parse_entity_update(fields, raw)?);
        }
    }

    let deletions: BTreeSet<String> = match object.get("d_nodes") {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| malformed(format!("d_nodes: {}", e), raw))?,
        None => BTreeSet::new(),
    };

    Ok(PatchRequest {
        new_entities,
        updates,
        deletions,
    })
}

/// Parse a single field op (`{"rpl": ..}` or `{"df": [..]}`). Also used
/// by the feedback document, which is patched as a single field.
pub fn parse_field_op(value: &Value, raw: &str) -> Result<FieldOp> {
    let object = value
        .as_object()
        .ok_or_else(|| malformed("field op must be an object", raw))?;
    if object.len() != 1 {
        return Err(malformed(
            "field op must carry exactly one of 'rpl' or 'df'",
            raw,
        ));
    }
    serde_json::from_value(value.clone())
        .map_err(|e| malformed(format!("unknown field op shape: {}", e), raw))
}

/// Parse a document-level op from a raw model response: an object with a
/// single `rpl` or `df` key.
pub fn parse_document_op(raw: &str) -> Result<FieldOp> {
    let body = strip_code_fence(raw);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| malformed(format!("document op is not JSON: {}", e), raw))?;
    parse_field_op(&value, raw)
}

fn parse_entity_update(value: &Value, raw: &str) -> Result<EntityUpdate> {
    let entries = value
        .as_object()
        .ok_or_else(|| malformed("u_nodes entry must map field names to ops", raw))?;
    let mut update = EntityUpdate::default();
    for (field, op) in entries {
        if field == IMAGE_FLAG_KEY {
            update.image_regenerate = op.as_bool().ok_or_else(|| {
                malformed(format!("'{}' must be a boolean", IMAGE_FLAG_KEY), raw)
            })?;
            continue;
        }
        update.fields.insert(field.clone(), parse_field_op(op, raw)?);
    }
    Ok(update)
}

fn malformed(message: impl Into<String>, raw: &str) -> StoryGraphError {
    StoryGraphError::MalformedResponse {
        message: message.into(),
        raw: raw.to_string(),
    }
}

use crate::{DiffInstruction, FieldOp, PatchRequest, PatchSummary};
use std::collections::HashMap;
use storygraph_core::Entity;
use tracing::debug;

/// Apply a patch request to an entity snapshot, producing the next
/// snapshot and a summary of what was done.
///
/// Pure and synchronous: same snapshot + same request = same output.
/// Order is new entities, then updates, then deletions. Local failures
/// (missing diff occurrence, unknown field) skip only the offending
/// instruction; everything else in the request still applies. Deletions
/// do not prune dangling parent/child references in surviving entities;
/// that is an explicit follow-up pass owned by the consuming layer.
pub fn apply_patch(current: &[Entity], request: &PatchRequest) -> (Vec<Entity>, PatchSummary) {
    let mut next: Vec<Entity> = current.to_vec();
    let mut summary = PatchSummary::default();
    let mut index: HashMap<String, usize> = next
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.clone(), i))
        .collect();

    // New entities. An id collision is an update, not a duplicate create.
    for entity in &request.new_entities {
        match index.get(&entity.id) {
            Some(&pos) => {
                next[pos] = entity.clone();
                summary.updated.push(entity.id.clone());
            }
            None => {
                index.insert(entity.id.clone(), next.len());
                next.push(entity.clone());
                summary.created.push(entity.id.clone());
            }
        }
    }

    // Field updates, each field processed independently.
    for (id, update) in &request.updates {
        if request.deletions.contains(id) {
            summary.diagnose(id, None, "update skipped: entity deleted in same request");
            continue;
        }
        let Some(&pos) = index.get(id) else {
            summary.diagnose(id, None, "update targets unknown entity");
            continue;
        };
        let entity = &mut next[pos];
        let mut touched = false;
        for (field, op) in &update.fields {
            match op {
                FieldOp::Replace(value) => match entity.set_field(field, value) {
                    Ok(()) => touched = true,
                    Err(e) => summary.diagnose(id, Some(field), e.to_string()),
                },
                FieldOp::TextDiff(instructions) => {
                    let Some(original) = entity.text_field(field).map(str::to_string) else {
                        summary.diagnose(id, Some(field), "field is not diffable text");
                        continue;
                    };
                    let (patched, misses) = apply_text_instructions(&original, instructions);
                    for miss in misses {
                        summary.diagnose(id, Some(field), miss);
                    }
                    if patched != original {
                        match entity.set_text_field(field, patched) {
                            Ok(()) => touched = true,
                            Err(e) => summary.diagnose(id, Some(field), e.to_string()),
                        }
                    }
                }
            }
        }
        if touched {
            summary.updated.push(id.clone());
        }
        if update.image_regenerate {
            summary.image_requests.push(id.clone());
        }
    }

    // Deletions last. Dangling links in survivors are left alone.
    for id in &request.deletions {
        match index.get(id).copied() {
            Some(_) => {
                next.retain(|e| &e.id != id);
                index = next
                    .iter()
                    .enumerate()
                    .map(|(i, e)| (e.id.clone(), i))
                    .collect();
                summary.deleted.push(id.clone());
            }
            None => summary.diagnose(id, None, "deletion targets unknown entity"),
        }
    }

    debug!(
        created = summary.created.len(),
        updated = summary.updated.len(),
        deleted = summary.deleted.len(),
        diagnostics = summary.diagnostics.len(),
        "patch applied"
    );
    (next, summary)
}

/// Apply an ordered diff-instruction list to a text value. Instructions
/// whose target occurrence is absent are skipped and reported; the rest
/// still apply, each against the text produced so far.
pub fn apply_text_instructions(
    text: &str,
    instructions: &[DiffInstruction],
) -> (String, Vec<String>) {
    let mut value = text.to_string();
    let mut misses = Vec::new();
    for instruction in instructions {
        let occurrence = instruction.occurrence.max(1);
        match nth_occurrence(&value, &instruction.find, occurrence) {
            Some(start) => {
                let end = start + instruction.find.len();
                value.replace_range(start..end, &instruction.replace);
            }
            None => misses.push(format!(
                "occurrence {} of '{}' not found",
                occurrence, instruction.find
            )),
        }
    }
    (value, misses)
}

/// Byte offset of the `n`-th (1-indexed) occurrence of `needle`.
fn nth_occurrence(haystack: &str, needle: &str, n: usize) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack
        .match_indices(needle)
        .nth(n - 1)
        .map(|(offset, _)| offset)
}

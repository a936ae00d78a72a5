//! Prompt assembly for every call type the orchestrator issues. Pure
//! string building; entity snapshots go in as JSON.

use crate::{PipelineState, PlanningOutput, SearchContext};
use storygraph_core::{Entity, Message, SearchResult};

fn entities_json(entities: &[Entity]) -> String {
    serde_json::to_string_pretty(entities).unwrap_or_else(|_| "[]".to_string())
}

const PATCH_FORMAT: &str = "Respond with a single JSON object using the keys \
`n_nodes` (array of new entities), `u_nodes` (object mapping entity id to field \
edits, each edit `{\"rpl\": value}` or `{\"df\": [{\"find\", \"replace\", \
\"occurrence\"}]}`, with an optional sibling `img_upd: true`), and `d_nodes` \
(array of entity ids to delete).";

pub fn edit_messages(user_prompt: &str, entities: &[Entity]) -> Vec<Message> {
    vec![
        Message::system(format!(
            "You edit a graph-structured narrative world. {}",
            PATCH_FORMAT
        )),
        Message::user(format!(
            "Current entities:\n{}\n\nRequested edit:\n{}",
            entities_json(entities),
            user_prompt
        )),
    ]
}

pub fn planning_messages(user_prompt: &str, state: &PipelineState) -> Vec<Message> {
    let mut context = String::new();
    if !state.failed_rules().is_empty() {
        context.push_str("\nRules that failed validation last loop:\n");
        for failure in state.failed_rules() {
            context.push_str(&format!("- {}: {}\n", failure.rule, failure.reason));
        }
    }
    for error in &state.errors {
        context.push_str(&format!(
            "\nEarlier loop {} failed at {}: {}",
            error.loop_index, error.stage, error.error
        ));
    }
    vec![
        Message::system(
            "You plan a generation pass over a narrative world. Respond with a \
             single JSON object with keys `target_node_ids`, `delete_node_ids`, \
             `objectives`, `success_rules`, and `search_queries` (all arrays of \
             strings)."
                .to_string(),
        ),
        Message::user(format!(
            "Mode: {} (loop {}/{})\n\nCurrent entities:\n{}\n\nUser request:\n{}\n{}",
            state.mode,
            state.current_loop,
            state.max_loops,
            entities_json(&state.current_snapshot),
            user_prompt,
            context
        )),
    ]
}

pub fn generation_messages(
    user_prompt: &str,
    state: &PipelineState,
    planning: &PlanningOutput,
    search: &SearchContext,
) -> Vec<Message> {
    vec![
        Message::system(format!(
            "You generate entity changes for a narrative world. {}",
            PATCH_FORMAT
        )),
        Message::user(format!(
            "Objectives:\n{}\n\nSuccess rules:\n{}\n\nSearch context:\n{}\n\n\
             Current entities:\n{}\n\nUser request:\n{}",
            planning.objectives.join("\n"),
            planning.success_rules.join("\n"),
            search_digest(search),
            entities_json(&state.current_snapshot),
            user_prompt
        )),
    ]
}

pub fn validation_messages(state: &PipelineState, planning: &PlanningOutput) -> Vec<Message> {
    let generated = state
        .generated
        .as_ref()
        .and_then(|p| serde_json::to_string_pretty(p).ok())
        .unwrap_or_else(|| "{}".to_string());
    vec![
        Message::system(
            "You check generated entity changes against success rules. Respond \
             with a single JSON object with keys `validated_rules` (array of \
             strings) and `failed_rules` (array of objects with `rule`, \
             `reason`, and optional `node_id`). Every rule must appear in \
             exactly one list."
                .to_string(),
        ),
        Message::user(format!(
            "Success rules:\n{}\n\nGenerated changes:\n{}",
            planning.success_rules.join("\n"),
            generated
        )),
    ]
}

pub fn image_prompt(entity: &Entity) -> String {
    format!(
        "Illustration of {}: {}. Style: consistent with a {} in a narrative world.",
        entity.name,
        entity.long_description,
        if entity.entity_type.is_empty() {
            "scene"
        } else {
            &entity.entity_type
        }
    )
}

fn search_digest(search: &SearchContext) -> String {
    if search.is_empty() {
        return "(no search results)".to_string();
    }
    let mut digest = String::new();
    for hit in search.broad.iter().chain(search.precise.iter()) {
        digest.push_str(&format_hit(hit));
    }
    digest
}

fn format_hit(hit: &SearchResult) -> String {
    format!("- {} ({}): {}\n", hit.title, hit.url, hit.description)
}

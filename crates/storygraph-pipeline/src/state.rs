use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use storygraph_core::{Entity, EntityId, SearchResult};
use storygraph_patch::PatchRequest;

/// Stage of one pipeline loop. `Completed` and `Failed` are terminal for
/// the loop; the caller decides whether to run another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Planning,
    Searching,
    Generating,
    Validating,
    Completed,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Planning => "planning",
            Stage::Searching => "searching",
            Stage::Generating => "generating",
            Stage::Validating => "validating",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A stage-level failure converted into data. Stage failures never escape
/// the pipeline boundary as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    pub loop_index: u32,
    pub stage: Stage,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Structured planning-stage output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanningOutput {
    #[serde(default)]
    pub target_node_ids: Vec<EntityId>,
    #[serde(default)]
    pub delete_node_ids: Vec<EntityId>,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub success_rules: Vec<String>,
    #[serde(default)]
    pub search_queries: Vec<String>,
}

/// Results gathered by the searching stage. Advisory context only: the
/// pipeline advances even when both lists are empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchContext {
    pub broad: Vec<SearchResult>,
    pub precise: Vec<SearchResult>,
}

impl SearchContext {
    pub fn is_empty(&self) -> bool {
        self.broad.is_empty() && self.precise.is_empty()
    }
}

/// One success rule the generated diff did not satisfy. A recoverable
/// business outcome, not an exception; it drives the next loop's planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFailure {
    pub rule: String,
    pub reason: String,
    #[serde(default)]
    pub node_id: Option<EntityId>,
}

/// Partition of success rules after the validating stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationOutcome {
    #[serde(default)]
    pub validated_rules: Vec<String>,
    #[serde(default)]
    pub failed_rules: Vec<RuleFailure>,
}

/// Per-run knobs passed by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunConfig {
    /// Free-form generation mode tag, forwarded into prompts.
    pub mode: String,
    /// Loop budget for this run.
    pub max_loops: u32,
}

impl Default for PipelineRunConfig {
    fn default() -> Self {
        Self {
            mode: "guided".to_string(),
            max_loops: 3,
        }
    }
}

/// Mutable state of one pipeline run, mutated in place loop by loop.
/// Callers always receive this back, never an escaped stage error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub mode: String,
    pub max_loops: u32,
    /// 1-based loop counter.
    pub current_loop: u32,
    pub stage: Stage,
    pub planning: Option<PlanningOutput>,
    pub search: Option<SearchContext>,
    pub generated: Option<PatchRequest>,
    pub validation: Option<ValidationOutcome>,
    pub errors: Vec<StageError>,
    pub original_snapshot: Vec<Entity>,
    pub current_snapshot: Vec<Entity>,
}

impl PipelineState {
    pub fn new(mode: impl Into<String>, max_loops: u32, snapshot: Vec<Entity>) -> Self {
        Self {
            mode: mode.into(),
            max_loops: max_loops.max(1),
            current_loop: 1,
            stage: Stage::Planning,
            planning: None,
            search: None,
            generated: None,
            validation: None,
            errors: Vec::new(),
            original_snapshot: snapshot.clone(),
            current_snapshot: snapshot,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Eligible for another iteration: not completed, budget left.
    pub fn can_run_next_loop(&self) -> bool {
        self.stage != Stage::Completed && self.current_loop < self.max_loops
    }

    pub fn failed_rules(&self) -> &[RuleFailure] {
        self.validation
            .as_ref()
            .map(|v| v.failed_rules.as_slice())
            .unwrap_or(&[])
    }

    /// Convert a stage failure into data and mark the loop failed.
    pub fn record_error(&mut self, stage: Stage, error: impl Into<String>) {
        self.errors.push(StageError {
            loop_index: self.current_loop,
            stage,
            error: error.into(),
            timestamp: Utc::now(),
        });
        self.stage = Stage::Failed;
    }
}

use crate::dispatch::CallDispatcher;
use crate::prompts;
use crate::state::{
    PipelineRunConfig, PipelineState, PlanningOutput, SearchContext, Stage, ValidationOutcome,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use storygraph_core::{
    strip_code_fence, CallType, ChatOptions, Entity, Result, SearchConfig, SearchProvider,
    StoryGraphError,
};
use storygraph_patch::parse_patch_payload;
use tracing::{debug, info, instrument, warn};

/// Invoked on every stage transition with the current state.
pub type ProgressCallback = Arc<dyn Fn(&PipelineState) + Send + Sync>;

/// The multi-stage generation pipeline: planning, external-search
/// consultation, content generation, rule validation.
///
/// Stages run strictly sequentially within a loop; the pipeline never
/// auto-loops, the caller inspects the returned state and decides. A
/// single-flight guard rejects a second concurrent run on the same
/// pipeline instance rather than leaving interleaving undefined.
pub struct GenerationPipeline {
    dispatcher: Arc<CallDispatcher>,
    search: Arc<dyn SearchProvider>,
    config: SearchConfig,
    in_flight: AtomicBool,
}

impl GenerationPipeline {
    pub fn new(
        dispatcher: Arc<CallDispatcher>,
        search: Arc<dyn SearchProvider>,
        config: SearchConfig,
    ) -> Self {
        Self {
            dispatcher,
            search,
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Start a run at loop 1. Always returns a `PipelineState`; stage
    /// failures are data inside it, never escaped errors. The only
    /// errors returned here are pre-flight (`PipelineBusy`).
    #[instrument(skip(self, prompt, entities, progress), fields(mode = %run.mode))]
    pub async fn run(
        &self,
        prompt: &str,
        run: PipelineRunConfig,
        entities: Vec<Entity>,
        progress: Option<&ProgressCallback>,
    ) -> Result<PipelineState> {
        let _guard = self.acquire()?;
        let mut state = PipelineState::new(run.mode, run.max_loops, entities);
        self.run_loop(prompt, &mut state, progress).await;
        Ok(state)
    }

    /// Re-enter planning with accumulated context (previous validation
    /// failures and stage errors), incrementing the loop counter.
    pub async fn run_next_loop(
        &self,
        prompt: &str,
        state: &mut PipelineState,
        progress: Option<&ProgressCallback>,
    ) -> Result<()> {
        let _guard = self.acquire()?;
        if state.stage == Stage::Completed {
            return Err(StoryGraphError::InvalidOperation(
                "pipeline already completed".to_string(),
            ));
        }
        if state.current_loop >= state.max_loops {
            return Err(StoryGraphError::InvalidOperation(format!(
                "loop budget exhausted ({}/{})",
                state.current_loop, state.max_loops
            )));
        }
        state.current_loop += 1;
        self.run_loop(prompt, state, progress).await;
        Ok(())
    }

    fn acquire(&self) -> Result<FlightGuard<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StoryGraphError::PipelineBusy(
                "another pipeline run is in flight for this session".to_string(),
            ));
        }
        Ok(FlightGuard(&self.in_flight))
    }

    async fn run_loop(
        &self,
        prompt: &str,
        state: &mut PipelineState,
        progress: Option<&ProgressCallback>,
    ) {
        info!(
            current_loop = state.current_loop,
            max_loops = state.max_loops,
            "pipeline loop started"
        );

        state.stage = Stage::Planning;
        notify(progress, state);
        let planning = match self.plan(prompt, state).await {
            Ok(planning) => planning,
            Err(e) => {
                state.record_error(Stage::Planning, e.to_string());
                notify(progress, state);
                return;
            }
        };
        state.planning = Some(planning.clone());

        state.stage = Stage::Searching;
        notify(progress, state);
        let search = self.search_stage(&planning).await;
        state.search = Some(search.clone());

        state.stage = Stage::Generating;
        notify(progress, state);
        match self.generate(prompt, state, &planning, &search).await {
            Ok(patch) => state.generated = Some(patch),
            Err(e) => {
                state.record_error(Stage::Generating, e.to_string());
                notify(progress, state);
                return;
            }
        }

        state.stage = Stage::Validating;
        notify(progress, state);
        match self.validate(state, &planning).await {
            Ok(outcome) => {
                let all_passed = outcome.failed_rules.is_empty();
                state.validation = Some(outcome);
                // Rule failures are recoverable outcomes, not errors: the
                // loop ends failed but eligible for another iteration.
                state.stage = if all_passed {
                    Stage::Completed
                } else {
                    Stage::Failed
                };
            }
            Err(e) => state.record_error(Stage::Validating, e.to_string()),
        }
        info!(
            current_loop = state.current_loop,
            stage = %state.stage,
            failed_rules = state.failed_rules().len(),
            "pipeline loop finished"
        );
        notify(progress, state);
    }

    async fn plan(&self, prompt: &str, state: &PipelineState) -> Result<PlanningOutput> {
        let messages = prompts::planning_messages(prompt, state);
        let (_, planning) = self
            .dispatcher
            .dispatch_parsed(
                CallType::PipelinePlanning,
                messages,
                ChatOptions::json(),
                |raw| parse_stage_output::<PlanningOutput>("planning", raw),
            )
            .await?;
        Ok(planning)
    }

    /// Search is advisory context, not a correctness gate: partial
    /// failures keep whatever returned, total failure advances with
    /// empty results.
    async fn search_stage(&self, planning: &PlanningOutput) -> SearchContext {
        let mut context = SearchContext::default();
        for query in planning.search_queries.iter().take(self.config.max_queries) {
            match self.search.web_search(query, self.config.broad_limit).await {
                Ok(mut hits) => context.broad.append(&mut hits),
                Err(e) => warn!(query = %query, error = %e, "broad search failed"),
            }
            let precise = format!("\"{}\"", query);
            match self
                .search
                .web_search(&precise, self.config.precise_limit)
                .await
            {
                Ok(mut hits) => context.precise.append(&mut hits),
                Err(e) => warn!(query = %precise, error = %e, "precise search failed"),
            }
        }
        if context.is_empty() {
            debug!("no search results; generating with empty context");
        }
        context
    }

    async fn generate(
        &self,
        prompt: &str,
        state: &PipelineState,
        planning: &PlanningOutput,
        search: &SearchContext,
    ) -> Result<storygraph_patch::PatchRequest> {
        let messages = prompts::generation_messages(prompt, state, planning, search);
        let (_, patch) = self
            .dispatcher
            .dispatch_parsed(
                CallType::PipelineGeneration,
                messages,
                ChatOptions::json(),
                |raw| parse_patch_payload(raw),
            )
            .await?;
        Ok(patch)
    }

    async fn validate(
        &self,
        state: &PipelineState,
        planning: &PlanningOutput,
    ) -> Result<ValidationOutcome> {
        let messages = prompts::validation_messages(state, planning);
        let (_, outcome) = self
            .dispatcher
            .dispatch_parsed(
                CallType::PipelineValidation,
                messages,
                ChatOptions::json(),
                |raw| parse_stage_output::<ValidationOutcome>("validation", raw),
            )
            .await?;
        Ok(outcome)
    }
}

fn parse_stage_output<T: serde::de::DeserializeOwned>(stage: &str, raw: &str) -> Result<T> {
    let body = strip_code_fence(raw);
    serde_json::from_str(body).map_err(|e| StoryGraphError::MalformedResponse {
        message: format!("{} output: {}", stage, e),
        raw: raw.to_string(),
    })
}

fn notify(progress: Option<&ProgressCallback>, state: &PipelineState) {
    if let Some(callback) = progress {
        callback(state);
    }
}

struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

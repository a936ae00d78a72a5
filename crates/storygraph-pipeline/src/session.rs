use crate::dispatch::CallDispatcher;
use crate::pipeline::{GenerationPipeline, ProgressCallback};
use crate::prompts;
use crate::snapshot::SessionSnapshot;
use crate::state::{PipelineRunConfig, PipelineState, Stage};
use serde_json::json;
use std::sync::Arc;
use storygraph_core::{
    CallType, ChatCompletionProvider, ChatOptions, ImageSynthesizer, OrchestratorConfig, Result,
    SearchProvider, SnapshotStore,
};
use storygraph_graph::EntityGraph;
use storygraph_ledger::{CallLedger, CallRecord, SubscriptionId};
use storygraph_memory::{FeedbackMemory, TaskKind};
use storygraph_patch::{parse_patch_payload, PatchRequest, PatchSummary};
use tracing::{info, instrument, warn};

/// Explicit session context: constructed once at session start and
/// passed by reference to everything that needs it. No module-level
/// singletons and no "not yet initialized" states.
///
/// Owns the single writer path for each piece of shared state: the
/// entity graph (patch application), the ledger (transition functions),
/// and the feedback document (task-queue worker).
pub struct SessionContext {
    config: OrchestratorConfig,
    ledger: Arc<CallLedger>,
    graph: Arc<EntityGraph>,
    memory: Arc<FeedbackMemory>,
    dispatcher: Arc<CallDispatcher>,
    pipeline: GenerationPipeline,
    images: Arc<dyn ImageSynthesizer>,
    store: Arc<dyn SnapshotStore>,
}

impl SessionContext {
    pub fn new(
        chat: Arc<dyn ChatCompletionProvider>,
        search: Arc<dyn SearchProvider>,
        images: Arc<dyn ImageSynthesizer>,
        store: Arc<dyn SnapshotStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let ledger = Arc::new(CallLedger::new());
        let graph = Arc::new(EntityGraph::new());
        let memory = Arc::new(FeedbackMemory::start(chat.clone(), ledger.clone()));
        let dispatcher = Arc::new(CallDispatcher::new(
            chat,
            ledger.clone(),
            config.retry.clone(),
        ));
        let pipeline =
            GenerationPipeline::new(dispatcher.clone(), search, config.search.clone());
        Self {
            config,
            ledger,
            graph,
            memory,
            dispatcher,
            pipeline,
            images,
            store,
        }
    }

    pub fn ledger(&self) -> &Arc<CallLedger> {
        &self.ledger
    }

    pub fn graph(&self) -> &Arc<EntityGraph> {
        &self.graph
    }

    pub fn memory(&self) -> &Arc<FeedbackMemory> {
        &self.memory
    }

    /// Single-shot edit: one completion call, parsed at the boundary,
    /// applied to the graph, reviewed asynchronously. Returns the applied
    /// patch; failures are recorded in the ledger before they surface.
    #[instrument(skip(self, prompt))]
    pub async fn submit_user_edit(&self, prompt: &str) -> Result<PatchRequest> {
        let messages = prompts::edit_messages(prompt, &self.graph.snapshot());
        let (call_id, patch) = self
            .dispatcher
            .dispatch_parsed(CallType::UserEdit, messages, ChatOptions::json(), |raw| {
                parse_patch_payload(raw)
            })
            .await?;

        let summary = self.apply_and_reconcile(&patch).await;
        info!(
            call_id = %call_id,
            created = summary.created.len(),
            updated = summary.updated.len(),
            deleted = summary.deleted.len(),
            "user edit applied"
        );
        self.memory.enqueue(
            TaskKind::CallAnalysis,
            json!({
                "call_id": call_id.to_string(),
                "prompt": prompt,
                "summary": summary,
            }),
        );
        Ok(patch)
    }

    /// Run the first pipeline loop against the current entity snapshot.
    /// A completed loop has its patch applied before the state returns.
    pub async fn run_pipeline(
        &self,
        prompt: &str,
        run: PipelineRunConfig,
        progress: Option<ProgressCallback>,
    ) -> Result<PipelineState> {
        let mut state = self
            .pipeline
            .run(prompt, run, self.graph.snapshot(), progress.as_ref())
            .await?;
        self.finish_loop(prompt, &mut state).await;
        Ok(state)
    }

    /// Caller-driven next iteration; validation failures from the last
    /// loop feed the new planning stage.
    pub async fn run_next_loop(
        &self,
        prompt: &str,
        state: &mut PipelineState,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        self.pipeline
            .run_next_loop(prompt, state, progress.as_ref())
            .await?;
        self.finish_loop(prompt, state).await;
        Ok(())
    }

    async fn finish_loop(&self, prompt: &str, state: &mut PipelineState) {
        if state.stage != Stage::Completed {
            return;
        }
        let Some(patch) = state.generated.clone() else {
            return;
        };
        let summary = self.apply_and_reconcile(&patch).await;
        state.current_snapshot = self.graph.snapshot();
        self.memory.enqueue(
            TaskKind::CallAnalysis,
            json!({
                "prompt": prompt,
                "mode": state.mode,
                "loop": state.current_loop,
                "summary": summary,
            }),
        );
    }

    /// Apply a patch, run the dangling-link follow-up pass when anything
    /// was deleted, and satisfy image-regeneration flags up to the batch
    /// limit.
    async fn apply_and_reconcile(&self, patch: &PatchRequest) -> PatchSummary {
        let summary = self.graph.apply(patch);
        if !summary.deleted.is_empty() {
            self.graph.prune_dangling_references();
        }
        self.request_images(&summary).await;
        summary
    }

    async fn request_images(&self, summary: &PatchSummary) {
        let limit = self.config.image_batch_limit;
        if summary.image_requests.len() > limit {
            warn!(
                requested = summary.image_requests.len(),
                limit, "image batch limit hit; extra flags skipped"
            );
        }
        for id in summary.image_requests.iter().take(limit) {
            let Some(entity) = self.graph.get(id) else {
                continue;
            };
            match self
                .images
                .request_image(&prompts::image_prompt(&entity), None)
                .await
            {
                Ok(image_ref) => {
                    self.graph.set_image_ref(id, image_ref);
                }
                Err(e) => warn!(entity_id = %id, error = %e, "image request failed"),
            }
        }
    }

    pub fn pending_task_count(&self) -> usize {
        self.memory.pending_tasks()
    }

    pub fn pending_call_count(&self) -> usize {
        self.ledger.pending_count()
    }

    pub fn subscribe_to_ledger<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&[CallRecord]) + Send + Sync + 'static,
    {
        self.ledger.subscribe(listener)
    }

    /// Persist the whole session as one opaque blob.
    pub async fn persist(&self) -> Result<()> {
        let snapshot = SessionSnapshot {
            entities: self.graph.snapshot(),
            calls: self.ledger.snapshot(),
            feedback: self.memory.document(),
        };
        self.store.persist(&snapshot.to_bytes()?).await
    }

    /// Restore a previously persisted session. Returns `false` when the
    /// store is empty.
    pub async fn restore(&self) -> Result<bool> {
        let Some(blob) = self.store.load().await? else {
            return Ok(false);
        };
        let snapshot = SessionSnapshot::from_bytes(&blob)?;
        self.graph.restore(snapshot.entities);
        self.ledger.restore(snapshot.calls);
        self.memory.restore_document(snapshot.feedback);
        info!("session restored from snapshot");
        Ok(true)
    }
}

use crate::FeedbackDocument;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use storygraph_core::{
    accumulate, CallType, ChatCompletionProvider, ChatOptions, Message, Result, TaskId,
};
use storygraph_ledger::CallLedger;
use storygraph_patch::{parse_document_op, FieldOp};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What triggered an analysis task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Review the transcript of a completed or failed call.
    CallAnalysis,
    /// Fold explicit user commentary into the document.
    UserFeedback,
    /// Periodic consolidation of the recent-feedback list.
    Synthesis,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskKind::CallAnalysis => "call_analysis",
            TaskKind::UserFeedback => "user_feedback",
            TaskKind::Synthesis => "synthesis",
        };
        write!(f, "{}", s)
    }
}

/// One queued analysis unit. Payload stays loosely shaped (the transcript
/// or commentary that triggered it); the structured part is the document
/// op parsed out of the model's response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// The feedback memory: a versioned analysis document plus a FIFO task
/// queue processed by a single worker.
///
/// One task in flight at a time, regardless of kind, so the document is
/// never concurrently patched and no diff application races another.
/// Analysis is best-effort: a task whose call fails or whose response
/// does not parse is logged, marked failed in the ledger, and dropped;
/// the queue advances without retry and never blocks the interactive
/// path.
pub struct FeedbackMemory {
    document: Arc<RwLock<FeedbackDocument>>,
    sender: mpsc::UnboundedSender<AnalysisTask>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl FeedbackMemory {
    /// Spawn the worker loop and return the handle used to enqueue tasks.
    pub fn start(provider: Arc<dyn ChatCompletionProvider>, ledger: Arc<CallLedger>) -> Self {
        let document = Arc::new(RwLock::new(FeedbackDocument::default()));
        let pending = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());
        let (sender, mut receiver) = mpsc::unbounded_channel::<AnalysisTask>();

        let worker_document = document.clone();
        let worker_pending = pending.clone();
        let worker_idle = idle.clone();
        tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                let task_id = task.id;
                if let Err(e) =
                    process_task(task, &worker_document, &provider, &ledger).await
                {
                    // Best-effort by design: drop and advance.
                    warn!(task_id = %task_id, error = %e, "analysis task dropped");
                }
                worker_pending.fetch_sub(1, Ordering::SeqCst);
                worker_idle.notify_waiters();
            }
            debug!("feedback worker stopped");
        });

        Self {
            document,
            sender,
            pending,
            idle,
        }
    }

    /// Queue a task for the single worker. FIFO across all kinds.
    pub fn enqueue(&self, kind: TaskKind, payload: Value) -> TaskId {
        let task = AnalysisTask {
            id: Uuid::new_v4(),
            kind,
            payload,
            created_at: Utc::now(),
        };
        let id = task.id;
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(task).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("feedback worker gone; task discarded");
        }
        debug!(task_id = %id, kind = %kind, "analysis task queued");
        id
    }

    pub fn document(&self) -> FeedbackDocument {
        self.document.read().clone()
    }

    /// Tasks queued or in flight.
    pub fn pending_tasks(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until the queue has drained. Test and shutdown aid.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn reset_to_default(&self) {
        *self.document.write() = FeedbackDocument::default();
        info!("feedback document reset to default template");
    }

    /// Replace the document from a restored session snapshot.
    pub fn restore_document(&self, document: FeedbackDocument) {
        *self.document.write() = document;
    }
}

async fn process_task(
    task: AnalysisTask,
    document: &Arc<RwLock<FeedbackDocument>>,
    provider: &Arc<dyn ChatCompletionProvider>,
    ledger: &Arc<CallLedger>,
) -> Result<()> {
    let snapshot = document.read().clone();
    let prompt = analysis_prompt(&snapshot, &task);
    let call_id = ledger.begin(CallType::FeedbackAnalysis, prompt.clone());
    ledger.mark_running(call_id)?;

    let messages = vec![Message::user(prompt)];
    let response = match provider.complete_chat(&messages, &ChatOptions::json()).await {
        Ok(output) => match accumulate(output, None).await {
            Ok(text) => text,
            Err(e) => {
                ledger.fail(call_id, e.to_string())?;
                return Err(e);
            }
        },
        Err(e) => {
            ledger.fail(call_id, e.to_string())?;
            return Err(e);
        }
    };

    // First-write protection: while the document is still the default
    // template, force a wholesale replace no matter what came back.
    let op = if snapshot.is_default() {
        match parse_document_op(&response) {
            Ok(FieldOp::Replace(value)) => FieldOp::Replace(value),
            Ok(FieldOp::TextDiff(_)) => FieldOp::Replace(Value::String(response.clone())),
            Err(e) => {
                ledger.fail(call_id, e.to_string())?;
                return Err(e);
            }
        }
    } else {
        match parse_document_op(&response) {
            Ok(op) => op,
            Err(e) => {
                ledger.fail(call_id, e.to_string())?;
                return Err(e);
            }
        }
    };

    let applied = {
        let mut doc = document.write();
        let result = doc.apply_op(&op);
        if result.is_ok() {
            debug!(task_id = %task.id, version = doc.version, "document updated");
        }
        result
    };
    match applied {
        Ok(misses) => {
            for miss in misses {
                warn!(task_id = %task.id, "document diff instruction skipped: {}", miss);
            }
        }
        Err(e) => {
            ledger.fail(call_id, e.to_string())?;
            return Err(e);
        }
    }

    ledger.complete(call_id, response.clone())?;

    // Route the analysis back onto the originating ledger entry.
    if let Some(source) = task
        .payload
        .get("call_id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
    {
        if let Err(e) = ledger.attach_feedback(source, response) {
            debug!(error = %e, "source call feedback not attached");
        }
    }

    Ok(())
}

fn analysis_prompt(document: &FeedbackDocument, task: &AnalysisTask) -> String {
    let focus = match task.kind {
        TaskKind::CallAnalysis => "Review the call transcript below and update the document.",
        TaskKind::UserFeedback => "Fold the user's commentary below into the document.",
        TaskKind::Synthesis => {
            "Consolidate the recent-feedback list into the general synthesis."
        }
    };
    format!(
        "You maintain a running analysis document for a narrative world editor.\n\
         {}\n\n\
         Current document (version {}):\n{}\n\n\
         Task payload:\n{}\n\n\
         Respond with a single JSON object: {{\"rpl\": \"<full new document>\"}} \
         to replace it wholesale, or {{\"df\": [{{\"find\": \"...\", \"replace\": \"...\", \
         \"occurrence\": 1}}]}} to edit it in place.",
        focus, document.version, document.content, task.payload
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use storygraph_core::{ChatOutput, StoryGraphError};

    /// Scripted provider: pops responses in order; `Err` entries simulate
    /// transport failures.
    struct ScriptedProvider {
        responses: Mutex<Vec<Result<String>>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl ChatCompletionProvider for ScriptedProvider {
        async fn complete_chat(
            &self,
            _messages: &[Message],
            _options: &ChatOptions,
        ) -> Result<ChatOutput> {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                return Err(StoryGraphError::Transport("script exhausted".into()));
            }
            responses.remove(0).map(ChatOutput::Complete)
        }
    }

    fn rpl(text: &str) -> Result<String> {
        Ok(json!({ "rpl": text }).to_string())
    }

    #[tokio::test]
    async fn tasks_apply_in_submission_order() {
        let provider = ScriptedProvider::new(vec![
            rpl("v1"),
            Ok(json!({"df": [{"find": "v1", "replace": "v2"}]}).to_string()),
            Ok(json!({"df": [{"find": "v2", "replace": "v3"}]}).to_string()),
        ]);
        let ledger = Arc::new(CallLedger::new());
        let memory = FeedbackMemory::start(provider, ledger.clone());

        for _ in 0..3 {
            memory.enqueue(TaskKind::CallAnalysis, json!({}));
        }
        memory.wait_until_idle().await;

        let doc = memory.document();
        assert_eq!(doc.content, "v3");
        assert_eq!(doc.version, 3);
        assert_eq!(ledger.pending_count(), 0);
        assert_eq!(ledger.len(), 3);
    }

    #[tokio::test]
    async fn first_write_is_forced_to_replace() {
        // The model answers with a diff against the default template; the
        // worker must coerce it into a wholesale replace.
        let provider = ScriptedProvider::new(vec![Ok(json!({
            "df": [{"find": "(none)", "replace": "sneaky edit"}]
        })
        .to_string())]);
        let ledger = Arc::new(CallLedger::new());
        let memory = FeedbackMemory::start(provider, ledger);

        memory.enqueue(TaskKind::CallAnalysis, json!({}));
        memory.wait_until_idle().await;

        let doc = memory.document();
        assert!(!doc.is_default());
        // Raw response used wholesale, not applied as a diff.
        assert!(doc.content.contains("sneaky edit"));
        assert!(doc.content.contains("df"));
    }

    #[tokio::test]
    async fn failed_call_drops_task_and_advances() {
        let provider = ScriptedProvider::new(vec![
            Err(StoryGraphError::Transport("provider down".into())),
            rpl("recovered"),
        ]);
        let ledger = Arc::new(CallLedger::new());
        let memory = FeedbackMemory::start(provider, ledger.clone());

        memory.enqueue(TaskKind::CallAnalysis, json!({}));
        memory.enqueue(TaskKind::UserFeedback, json!({"note": "keep going"}));
        memory.wait_until_idle().await;

        // First task dropped, second applied; no retry happened.
        assert_eq!(memory.document().content, "recovered");
        let records = ledger.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, storygraph_core::CallStatus::Failed);
        assert_eq!(records[1].status, storygraph_core::CallStatus::Completed);
    }

    #[tokio::test]
    async fn unparseable_response_leaves_document_unchanged() {
        let provider =
            ScriptedProvider::new(vec![Ok("I cannot produce JSON today".to_string())]);
        let ledger = Arc::new(CallLedger::new());
        let memory = FeedbackMemory::start(provider, ledger.clone());

        memory.enqueue(TaskKind::Synthesis, json!({}));
        memory.wait_until_idle().await;

        assert!(memory.document().is_default());
        assert_eq!(
            ledger.snapshot()[0].status,
            storygraph_core::CallStatus::Failed
        );
    }

    #[tokio::test]
    async fn analysis_feedback_attaches_to_source_call() {
        let ledger = Arc::new(CallLedger::new());
        let source = ledger.begin(CallType::UserEdit, "edit the sword");
        ledger.mark_running(source).unwrap();
        ledger.complete(source, "{}").unwrap();

        let provider = ScriptedProvider::new(vec![rpl("the edit was conservative")]);
        let memory = FeedbackMemory::start(provider, ledger.clone());
        memory.enqueue(
            TaskKind::CallAnalysis,
            json!({"call_id": source.to_string()}),
        );
        memory.wait_until_idle().await;

        let feedback = ledger.get(source).unwrap().feedback.unwrap();
        assert!(feedback.contains("conservative"));
    }

    #[tokio::test]
    async fn reset_returns_to_default_template() {
        let provider = ScriptedProvider::new(vec![rpl("written")]);
        let ledger = Arc::new(CallLedger::new());
        let memory = FeedbackMemory::start(provider, ledger);
        memory.enqueue(TaskKind::CallAnalysis, json!({}));
        memory.wait_until_idle().await;
        assert!(!memory.document().is_default());

        memory.reset_to_default();
        assert!(memory.document().is_default());
        assert_eq!(memory.document().version, 0);
    }
}

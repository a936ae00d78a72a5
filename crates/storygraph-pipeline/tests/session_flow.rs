//! End-to-end flows through the session orchestrator with scripted
//! collaborators: completion, search, image synthesis, and storage.

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storygraph_core::{
    CallStatus, ChatCompletionProvider, ChatOptions, ChatOutput, Entity, ImageSynthesizer,
    Message, OrchestratorConfig, Result, RetryConfig, SearchProvider, SearchResult,
    SnapshotStore, StoryGraphError,
};
use storygraph_patch::PatchRequest;
use storygraph_pipeline::{PipelineRunConfig, ProgressCallback, SessionContext, Stage};

enum Scripted {
    Text(&'static str),
    Chunks(Vec<&'static str>),
}

/// Pops scripted responses in call order. An exhausted script is a
/// transport failure, which keeps misbehaving tests loud.
struct ScriptedChat {
    responses: Mutex<VecDeque<Scripted>>,
    delay: Option<Duration>,
}

impl ScriptedChat {
    fn new(responses: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            delay: None,
        })
    }

    fn slow(responses: Vec<Scripted>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            delay: Some(delay),
        })
    }
}

#[async_trait]
impl ChatCompletionProvider for ScriptedChat {
    async fn complete_chat(
        &self,
        _messages: &[Message],
        _options: &ChatOptions,
    ) -> Result<ChatOutput> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .responses
            .lock()
            .pop_front()
            .ok_or_else(|| StoryGraphError::Transport("script exhausted".to_string()))?;
        Ok(match next {
            Scripted::Text(text) => ChatOutput::Complete(text.to_string()),
            Scripted::Chunks(chunks) => ChatOutput::Streamed(Box::pin(stream::iter(
                chunks.into_iter().map(|c| Ok(c.to_string())).collect::<Vec<_>>(),
            ))),
        })
    }
}

struct StubSearch {
    fail: bool,
}

#[async_trait]
impl SearchProvider for StubSearch {
    async fn web_search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        if self.fail {
            return Err(StoryGraphError::Transport("search backend down".into()));
        }
        Ok(vec![SearchResult {
            title: query.to_string(),
            url: "https://example.test/hit".to_string(),
            description: format!("top {} results for {}", limit, query),
        }])
    }
}

struct StubImages {
    requests: AtomicUsize,
}

impl StubImages {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ImageSynthesizer for StubImages {
    async fn request_image(&self, _prompt: &str, _seed: Option<u64>) -> Result<String> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(format!("img://stub-{}", n))
    }
}

#[derive(Default)]
struct MemoryStore {
    blob: Mutex<Option<Vec<u8>>>,
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn persist(&self, blob: &[u8]) -> Result<()> {
        *self.blob.lock() = Some(blob.to_vec());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.blob.lock().clone())
    }
}

const PLAN_OK: &str = r#"{
    "target_node_ids": ["hero"],
    "objectives": ["introduce a rival"],
    "success_rules": ["a rival entity exists"],
    "search_queries": ["rival archetypes"]
}"#;

const GEN_OK: &str = r#"{
    "n_nodes": [{"id": "rival", "name": "Rival", "type": "character",
                 "long_description": "a scheming rival"}],
    "u_nodes": {"hero": {
        "long_description": {"df": [{"find": "brave", "replace": "wary"}]},
        "img_upd": true
    }}
}"#;

const VAL_PASS: &str = r#"{"validated_rules": ["a rival entity exists"], "failed_rules": []}"#;

const VAL_FAIL: &str = r#"{
    "validated_rules": [],
    "failed_rules": [{"rule": "a rival entity exists", "reason": "no rival created"}]
}"#;

const ANALYSIS_OK: &str = r##"{"rpl": "# World Analysis\n\nRival introduced cleanly."}"##;

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryConfig {
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
        ..OrchestratorConfig::default()
    }
}

fn session(chat: Arc<ScriptedChat>, search_fails: bool) -> SessionContext {
    let _ = tracing_subscriber::fmt::try_init();
    SessionContext::new(
        chat,
        Arc::new(StubSearch { fail: search_fails }),
        StubImages::new(),
        Arc::new(MemoryStore::default()),
        fast_config(),
    )
}

fn seed_hero(session: &SessionContext) {
    session.graph().apply(
        &PatchRequest::default().with_new_entity(
            Entity::new("hero", "Hero").with_description("a brave knight"),
        ),
    );
}

#[tokio::test]
async fn pipeline_loop_completes_and_applies_patch() {
    let chat = ScriptedChat::new(vec![
        Scripted::Text(PLAN_OK),
        Scripted::Text(GEN_OK),
        Scripted::Text(VAL_PASS),
        Scripted::Text(ANALYSIS_OK),
    ]);
    let session = session(chat, false);
    seed_hero(&session);

    let stages: Arc<Mutex<Vec<Stage>>> = Arc::new(Mutex::new(Vec::new()));
    let stages_clone = stages.clone();
    let progress: ProgressCallback = Arc::new(move |state| stages_clone.lock().push(state.stage));

    let state = session
        .run_pipeline("give the hero a rival", PipelineRunConfig::default(), Some(progress))
        .await
        .unwrap();

    assert_eq!(state.stage, Stage::Completed);
    assert_eq!(state.current_loop, 1);
    assert!(state.errors.is_empty());
    assert!(state.failed_rules().is_empty());
    assert_eq!(
        *stages.lock(),
        vec![
            Stage::Planning,
            Stage::Searching,
            Stage::Generating,
            Stage::Validating,
            Stage::Completed
        ]
    );

    // Patch applied to the graph and reflected in the state snapshot.
    let hero = session.graph().get("hero").unwrap();
    assert_eq!(hero.long_description, "a wary knight");
    assert!(session.graph().contains("rival"));
    assert_eq!(state.current_snapshot.len(), 2);

    // Image flag satisfied through the synthesizer.
    assert_eq!(hero.image_ref.as_deref(), Some("img://stub-0"));

    // Review task recorded its own call and updated the document.
    session.memory().wait_until_idle().await;
    assert!(session.memory().document().content.contains("Rival introduced"));
    assert_eq!(session.ledger().len(), 4);
    assert_eq!(session.pending_call_count(), 0);
}

#[tokio::test]
async fn validation_failures_loop_until_budget_then_fail() {
    let chat = ScriptedChat::new(vec![
        Scripted::Text(PLAN_OK),
        Scripted::Text(GEN_OK),
        Scripted::Text(VAL_FAIL),
        Scripted::Text(PLAN_OK),
        Scripted::Text(GEN_OK),
        Scripted::Text(VAL_FAIL),
    ]);
    let session = session(chat, false);
    seed_hero(&session);

    let run = PipelineRunConfig {
        mode: "guided".to_string(),
        max_loops: 2,
    };
    let mut state = session
        .run_pipeline("give the hero a rival", run, None)
        .await
        .unwrap();
    assert_eq!(state.stage, Stage::Failed);
    assert_eq!(state.failed_rules().len(), 1);
    assert!(state.can_run_next_loop());

    session
        .run_next_loop("give the hero a rival", &mut state, None)
        .await
        .unwrap();
    assert_eq!(state.stage, Stage::Failed);
    assert_eq!(state.current_loop, state.max_loops);
    assert!(!state.can_run_next_loop());

    // Budget exhausted: a further loop is refused, not attempted.
    let err = session
        .run_next_loop("give the hero a rival", &mut state, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoryGraphError::InvalidOperation(_)));

    // Nothing was ever applied.
    assert_eq!(session.graph().get("hero").unwrap().long_description, "a brave knight");
    assert!(!session.graph().contains("rival"));
}

#[tokio::test]
async fn malformed_planning_fails_the_loop_as_data() {
    let chat = ScriptedChat::new(vec![Scripted::Text("I would rather write prose")]);
    let session = session(chat, false);
    seed_hero(&session);

    let state = session
        .run_pipeline("expand the world", PipelineRunConfig::default(), None)
        .await
        .unwrap();
    assert_eq!(state.stage, Stage::Failed);
    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.errors[0].stage, Stage::Planning);
    assert_eq!(state.errors[0].loop_index, 1);

    // The failed call is reachable from the ledger.
    let records = session.ledger().snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CallStatus::Failed);
}

#[tokio::test]
async fn total_search_failure_still_generates() {
    let chat = ScriptedChat::new(vec![
        Scripted::Text(PLAN_OK),
        Scripted::Text(GEN_OK),
        Scripted::Text(VAL_PASS),
        Scripted::Text(ANALYSIS_OK),
    ]);
    let session = session(chat, true);
    seed_hero(&session);

    let state = session
        .run_pipeline("give the hero a rival", PipelineRunConfig::default(), None)
        .await
        .unwrap();
    assert_eq!(state.stage, Stage::Completed);
    assert!(state.search.as_ref().unwrap().is_empty());
    session.memory().wait_until_idle().await;
}

#[tokio::test]
async fn second_concurrent_run_is_rejected() {
    let chat = ScriptedChat::slow(
        vec![
            Scripted::Text(PLAN_OK),
            Scripted::Text(GEN_OK),
            Scripted::Text(VAL_PASS),
            Scripted::Text(ANALYSIS_OK),
        ],
        Duration::from_millis(150),
    );
    let session = Arc::new(session(chat, false));
    seed_hero(&session);

    let background = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .run_pipeline("give the hero a rival", PipelineRunConfig::default(), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = session
        .run_pipeline("another idea", PipelineRunConfig::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoryGraphError::PipelineBusy(_)));

    let state = background.await.unwrap().unwrap();
    assert_eq!(state.stage, Stage::Completed);
}

#[tokio::test]
async fn user_edit_applies_streamed_diff() {
    // The edit response arrives as streamed chunks; accumulation must
    // finish before parsing.
    let chat = ScriptedChat::new(vec![
        Scripted::Chunks(vec![
            r#"{"u_nodes": {"n1": {"long_description"#,
            r#"": {"df": [{"find": "a simple sword", "#,
            r#""replace": "a gleaming longsword"}]}}}}"#,
        ]),
        Scripted::Text(ANALYSIS_OK),
    ]);
    let session = session(chat, false);
    session.graph().apply(
        &PatchRequest::default()
            .with_new_entity(Entity::new("n1", "Sword").with_description("a simple sword")),
    );

    let patch = session.submit_user_edit("make the sword shine").await.unwrap();
    assert_eq!(patch.updates.len(), 1);
    assert_eq!(
        session.graph().get("n1").unwrap().long_description,
        "a gleaming longsword"
    );

    session.memory().wait_until_idle().await;
    assert_eq!(session.pending_task_count(), 0);
    // Edit call plus its review call, review feedback attached.
    let records = session.ledger().snapshot();
    assert_eq!(records.len(), 2);
    assert!(records[0].feedback.is_some());
}

#[tokio::test]
async fn deletion_edit_reconciles_dangling_links() {
    let chat = ScriptedChat::new(vec![
        Scripted::Text(r#"{"d_nodes": ["c"]}"#),
        Scripted::Text(ANALYSIS_OK),
    ]);
    let session = session(chat, false);
    session.graph().apply(
        &PatchRequest::default()
            .with_new_entity(Entity::new("p", "Parent").with_child("c"))
            .with_new_entity(Entity::new("c", "Child").with_parent("p")),
    );

    session.submit_user_edit("remove the child").await.unwrap();
    assert!(!session.graph().contains("c"));
    // The session's follow-up pass removed the dangling link.
    assert!(session.graph().get("p").unwrap().child_ids.is_empty());
    session.memory().wait_until_idle().await;
}

#[tokio::test]
async fn malformed_edit_is_a_recorded_failure() {
    let chat = ScriptedChat::new(vec![Scripted::Text("no json here")]);
    let session = session(chat, false);
    seed_hero(&session);

    let err = session.submit_user_edit("edit something").await.unwrap_err();
    match err {
        StoryGraphError::MalformedResponse { raw, .. } => assert!(raw.contains("no json")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(session.ledger().snapshot()[0].status, CallStatus::Failed);
    // The graph was never touched.
    assert_eq!(session.graph().get("hero").unwrap().long_description, "a brave knight");
}

#[tokio::test]
async fn session_persists_and_restores_as_one_blob() {
    let store = Arc::new(MemoryStore::default());
    let chat = ScriptedChat::new(vec![
        Scripted::Text(r#"{"n_nodes": [{"id": "tower", "name": "Tower"}]}"#),
        Scripted::Text(ANALYSIS_OK),
    ]);
    let _ = tracing_subscriber::fmt::try_init();
    let first = SessionContext::new(
        chat,
        Arc::new(StubSearch { fail: false }),
        StubImages::new(),
        store.clone(),
        fast_config(),
    );
    first.submit_user_edit("add a tower").await.unwrap();
    first.memory().wait_until_idle().await;
    first.persist().await.unwrap();

    let second = SessionContext::new(
        ScriptedChat::new(Vec::new()),
        Arc::new(StubSearch { fail: false }),
        StubImages::new(),
        store,
        fast_config(),
    );
    assert!(second.restore().await.unwrap());
    assert!(second.graph().contains("tower"));
    assert_eq!(second.ledger().len(), 2);
    assert!(second.memory().document().content.contains("Rival introduced"));

    // An empty store restores nothing.
    let empty = SessionContext::new(
        ScriptedChat::new(Vec::new()),
        Arc::new(StubSearch { fail: false }),
        StubImages::new(),
        Arc::new(MemoryStore::default()),
        fast_config(),
    );
    assert!(!empty.restore().await.unwrap());
}

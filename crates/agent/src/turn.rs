//! The turn generation pipeline — one user message in, one structured
//! result out.
//!
//! Linear state machine with a single error branch. Context building and
//! generation errors are never swallowed: the failure is recorded on the
//! thread (best-effort) and the original error is rethrown untouched, so
//! the outer retry layer can classify it and callers can assert on the
//! real cause.
//!
//! The pipeline assumes the platform runs at most one turn per thread at a
//! time; nothing here guards concurrent turns on the same thread.

use crate::hooks::{NoHooks, TurnHooks};
use crate::prefetch::RetrievalPrefetch;
use crate::stream::TurnStreamEvent;
use crate::summarize::SummarizationTrigger;
use chrono::Utc;
use opsdesk_config::BudgetConfig;
use opsdesk_context::assembler::{AssemblerInput, ContextAssembler, ContextStats};
use opsdesk_context::reorder::{reorder_groups, MessageGroups};
use opsdesk_context::token;
use opsdesk_core::error::{Error, ProviderError};
use opsdesk_core::message::{ThreadId, ThreadMessage, ToolInvocation};
use opsdesk_core::provider::{ModelProvider, ModelRequest, Usage};
use opsdesk_core::retrieval::RetrievalService;
use opsdesk_core::store::ThreadStore;
use opsdesk_core::summarizer::Summarizer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Tool names whose reported usage is rolled up as sub-agent usage.
const SUB_AGENT_TOOLS: [&str; 5] = [
    "web_agent",
    "document_agent",
    "crm_agent",
    "integration_agent",
    "workflow_agent",
];

/// The fixed user-visible text persisted when a turn fails.
const FAILED_TURN_TEXT: &str = "I was unable to complete your request. Please try again.";

/// Arguments for a single turn.
#[derive(Debug, Clone)]
pub struct TurnArgs {
    /// The conversation thread this turn belongs to.
    pub thread_id: ThreadId,

    /// The live user message (supplied to the model as the prompt, never
    /// embedded in the context block).
    pub user_message: String,

    /// Streaming or buffered generation.
    pub streaming: bool,

    /// Optional time budget for the whole turn, context building included.
    pub deadline: Option<Duration>,

    /// Channel for streaming events, when the caller wants them.
    pub events: Option<mpsc::Sender<TurnStreamEvent>>,
}

impl TurnArgs {
    pub fn new(thread_id: ThreadId, user_message: impl Into<String>) -> Self {
        Self {
            thread_id,
            user_message: user_message.into(),
            streaming: false,
            deadline: None,
            events: None,
        }
    }

    pub fn streaming(mut self, events: mpsc::Sender<TurnStreamEvent>) -> Self {
        self.streaming = true;
        self.events = Some(events);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Usage reported by one sub-agent tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentUsage {
    /// Which sub-agent tool.
    pub tool: String,

    /// Its reported token usage.
    pub usage: Usage,
}

/// The structured result of a completed turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub thread_id: ThreadId,

    /// The generated assistant text.
    pub text: String,

    /// Token usage for the model call.
    pub usage: Usage,

    /// Why generation stopped, when the provider reports it.
    pub finish_reason: Option<String>,

    /// Wall-clock duration of the whole turn.
    pub duration_ms: u64,

    /// Time to the first streamed text token (streaming turns only).
    pub time_to_first_token_ms: Option<u64>,

    /// Tool invocations requested by the model.
    pub tool_calls: Vec<ToolInvocation>,

    /// Rolled-up usage reported by sub-agent tools.
    pub sub_agent_usage: Vec<SubAgentUsage>,

    /// The merged context block that was sent, for inspection and replay.
    pub context_window: String,

    /// Statistics about the merged block.
    pub context_stats: ContextStats,

    /// The model that responded.
    pub model: String,

    /// The provider that served the call.
    pub provider: String,
}

/// Everything the model invocation step produced, both modes.
struct GenerationOutcome {
    text: String,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    tool_calls: Vec<ToolInvocation>,
    time_to_first_token: Option<Duration>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

/// The top-level turn orchestrator.
pub struct TurnPipeline {
    provider: Arc<dyn ModelProvider>,
    store: Arc<dyn ThreadStore>,
    retrieval: Option<Arc<dyn RetrievalService>>,
    summarization: Option<SummarizationTrigger>,
    hooks: Arc<dyn TurnHooks>,
    config: BudgetConfig,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    system_info: String,
}

impl TurnPipeline {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        store: Arc<dyn ThreadStore>,
        config: BudgetConfig,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            store,
            retrieval: None,
            summarization: None,
            hooks: Arc::new(NoHooks),
            config,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            system_info: String::new(),
        }
    }

    /// Attach the retrieval service; enables the prefetch cache.
    pub fn with_retrieval(mut self, retrieval: Arc<dyn RetrievalService>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    /// Attach the background summarizer.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarization = Some(SummarizationTrigger::new(summarizer));
        self
    }

    /// Install the per-agent hook strategy.
    pub fn with_hooks(mut self, hooks: Arc<dyn TurnHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Set the platform directives for the system-info section.
    pub fn with_system_info(mut self, system_info: impl Into<String>) -> Self {
        self.system_info = system_info.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Run one turn.
    ///
    /// The deadline, when set, covers the whole turn: context building,
    /// hooks, and the model invocation all share one budget.
    ///
    /// On failure the open stream is marked errored, the `on_error` hook
    /// runs, a terminal failed record is persisted (best-effort), and the
    /// original error is returned untouched.
    pub async fn run(&self, args: TurnArgs) -> Result<TurnResult, Error> {
        let started = Instant::now();
        info!(thread = %args.thread_id, streaming = args.streaming, "Processing turn");

        let outcome = match args.deadline {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.run_inner(&args, started)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Provider(ProviderError::Timeout(format!(
                        "Turn deadline of {}ms exceeded",
                        deadline.as_millis()
                    )))),
                }
            }
            None => self.run_inner(&args, started).await,
        };

        match outcome {
            Ok(result) => Ok(result),
            Err(error) => {
                if let Some(events) = &args.events {
                    let _ = events
                        .send(TurnStreamEvent::Error {
                            message: error.to_string(),
                        })
                        .await;
                }

                self.hooks.on_error(&args, &error).await;
                self.persist_failure(&args, &error).await;
                Err(error)
            }
        }
    }

    async fn run_inner(&self, args: &TurnArgs, started: Instant) -> Result<TurnResult, Error> {
        // ── Hooks: before_context ──────────────────────────────────────
        let hook_ctx = self.hooks.before_context(args).await;

        // ── History read, in (order, step_order) key order ─────────────
        let mut history = self.store.list_messages(&args.thread_id).await?;
        history.sort_by_key(ThreadMessage::sort_key);

        // ── Prefetch: start retrieval before anything needs it ─────────
        let prefetch: Option<Arc<RetrievalPrefetch>> = match (&hook_ctx.prefetch, &self.retrieval)
        {
            (Some(p), _) => Some(Arc::clone(p)),
            (None, Some(retrieval)) => Some(Arc::new(RetrievalPrefetch::start(
                Arc::clone(retrieval),
                &args.user_message,
                &history,
            ))),
            (None, None) => None,
        };

        // ── Summary: read persisted state, maybe schedule compression ──
        let summary = match &hook_ctx.context_summary {
            Some(s) => Some(s.clone()),
            None => {
                let state = match self.store.summary_state(&args.thread_id).await {
                    Ok(state) => state,
                    Err(e) => {
                        warn!(thread = %args.thread_id, error = %e, "Summary state read failed");
                        Default::default()
                    }
                };
                let history_tokens = token::estimate_messages_tokens(&history);
                match &self.summarization {
                    Some(trigger) => {
                        trigger.check(&args.thread_id, &state, history_tokens, &self.config)
                    }
                    None => state.existing_summary,
                }
            }
        };

        // ── Knowledge: hook-supplied, else join the prefetch ───────────
        let knowledge = match &hook_ctx.retrieval_context {
            Some(rc) => Some(rc.clone()),
            None => match &prefetch {
                Some(p) => {
                    let outcome = p.get().await;
                    if outcome.has_content() {
                        p.claim();
                        Some(outcome.snippet_text)
                    } else {
                        None
                    }
                }
                None => None,
            },
        };

        // ── Assemble the merged context block ──────────────────────────
        let assembler = ContextAssembler::new(self.config.clone());
        let merged = assembler.assemble(&AssemblerInput {
            system_info: &self.system_info,
            summary: summary.as_deref(),
            knowledge: knowledge.as_deref(),
            integrations: hook_ctx.integrations_info.as_deref(),
            history: &history,
            now: Some(Utc::now()),
            ..Default::default()
        });
        debug!(
            thread = %args.thread_id,
            context_tokens = merged.stats.total_tokens,
            messages = merged.stats.message_count,
            "Context assembled"
        );

        // ── Hooks: before_generate ─────────────────────────────────────
        let overrides = self.hooks.before_generate(args, &merged, &hook_ctx).await;

        // ── Reorder into the fixed group contract ──────────────────────
        let mut system_context = vec![ThreadMessage::system(&merged.text)];
        if let Some(extra) = overrides.system_context_messages {
            system_context.extend(extra);
        }
        let prompt = overrides
            .prompt_content
            .unwrap_or_else(|| args.user_message.clone());

        let messages = reorder_groups(
            MessageGroups {
                system_context,
                retrieval_results: Vec::new(),
                history: merged.history.clone(),
                current: Some(ThreadMessage::user(prompt)),
                existing_responses: Vec::new(),
                history_tokens_in_context: merged.stats.history_tokens,
            },
            &self.config,
        );

        let request = ModelRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: Vec::new(),
            stream: args.streaming,
            stop: Vec::new(),
        };

        // ── Invoke the model ───────────────────────────────────────────
        let generation = self.invoke(args, request, started).await?;

        // ── Telemetry extraction ───────────────────────────────────────
        let sub_agent_usage = extract_sub_agent_usage(&generation.metadata);

        let result = TurnResult {
            thread_id: args.thread_id.clone(),
            text: generation.text,
            usage: generation.usage.unwrap_or_default(),
            finish_reason: generation.finish_reason,
            duration_ms: started.elapsed().as_millis() as u64,
            time_to_first_token_ms: generation
                .time_to_first_token
                .map(|d| d.as_millis() as u64),
            tool_calls: generation.tool_calls,
            sub_agent_usage,
            context_window: merged.text,
            context_stats: merged.stats,
            model: self.model.clone(),
            provider: self.provider.name().to_string(),
        };

        // ── Hooks: after_generate, then persist completion ─────────────
        self.hooks.after_generate(args, &result, &hook_ctx).await;
        self.persist_completion(args, &history, &result).await?;

        Ok(result)
    }

    /// Buffered XOR streaming model invocation.
    async fn invoke(
        &self,
        args: &TurnArgs,
        request: ModelRequest,
        started: Instant,
    ) -> Result<GenerationOutcome, Error> {
        if !args.streaming {
            let response = self.provider.complete(request).await?;
            return Ok(GenerationOutcome {
                text: response.message.content.clone(),
                usage: response.usage,
                finish_reason: response.finish_reason,
                tool_calls: response.message.tool_calls,
                time_to_first_token: None,
                metadata: response.metadata,
            });
        }

        let mut rx = self.provider.stream(request).await?;
        let mut text = String::new();
        let mut tool_calls: Vec<ToolInvocation> = Vec::new();
        let mut usage: Option<Usage> = None;
        let mut finish_reason: Option<String> = None;
        let mut time_to_first_token: Option<Duration> = None;

        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;

            if let Some(content) = &chunk.content {
                if !content.is_empty() {
                    if time_to_first_token.is_none() {
                        time_to_first_token = Some(started.elapsed());
                    }
                    text.push_str(content);
                    if let Some(events) = &args.events {
                        let _ = events
                            .send(TurnStreamEvent::Chunk {
                                content: content.clone(),
                            })
                            .await;
                    }
                }
            }

            for tc in &chunk.tool_calls {
                if let Some(events) = &args.events {
                    let _ = events
                        .send(TurnStreamEvent::ToolCall {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        })
                        .await;
                }
            }
            tool_calls.extend(chunk.tool_calls);

            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
            if chunk.finish_reason.is_some() {
                finish_reason = chunk.finish_reason;
            }
            if chunk.done {
                break;
            }
        }

        if let Some(events) = &args.events {
            let _ = events
                .send(TurnStreamEvent::Done {
                    thread_id: args.thread_id.to_string(),
                    usage: usage.clone(),
                    finish_reason: finish_reason.clone(),
                })
                .await;
        }

        Ok(GenerationOutcome {
            text,
            usage,
            finish_reason,
            tool_calls,
            time_to_first_token,
            metadata: serde_json::Map::new(),
        })
    }

    /// Append the completed assistant message with its metadata.
    async fn persist_completion(
        &self,
        args: &TurnArgs,
        history: &[ThreadMessage],
        result: &TurnResult,
    ) -> Result<(), Error> {
        let next_order = history.last().map(|m| m.order + 1).unwrap_or(0);
        let message = ThreadMessage::assistant(&result.text)
            .with_order(next_order, 0)
            .with_metadata("status", serde_json::json!("complete"))
            .with_metadata("model", serde_json::json!(result.model))
            .with_metadata("usage", serde_json::to_value(&result.usage)?)
            .with_metadata("duration_ms", serde_json::json!(result.duration_ms));
        self.store
            .append_message(&args.thread_id, message)
            .await?;
        Ok(())
    }

    /// Record a terminal failed message on the thread.
    ///
    /// Best-effort: a failure to record is swallowed so it cannot mask the
    /// original error. The record gets the next `(order, step_order)` key
    /// so later reads keep it in chronological position; if the tail cannot
    /// be read, a max-order sentinel keeps it sorting last.
    async fn persist_failure(&self, args: &TurnArgs, error: &Error) {
        let next_order = match self.store.list_messages(&args.thread_id).await {
            Ok(messages) => messages.iter().map(|m| m.order).max().map_or(0, |o| o + 1),
            Err(_) => i64::MAX,
        };
        let message = ThreadMessage::assistant(FAILED_TURN_TEXT)
            .with_order(next_order, 0)
            .with_metadata("status", serde_json::json!("failed"))
            .with_metadata("error", serde_json::json!(error.to_string()));

        if let Err(e) = self.store.append_message(&args.thread_id, message).await {
            warn!(thread = %args.thread_id, error = %e, "Failed to persist failure record");
        }
    }
}

/// Scan provider step telemetry for known sub-agent tools and roll up
/// their reported token usage.
fn extract_sub_agent_usage(
    metadata: &serde_json::Map<String, serde_json::Value>,
) -> Vec<SubAgentUsage> {
    let Some(steps) = metadata.get("steps").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    steps
        .iter()
        .filter_map(|step| {
            let tool = step.get("tool")?.as_str()?;
            if !SUB_AGENT_TOOLS.contains(&tool) {
                return None;
            }
            let usage: Usage = serde_json::from_value(step.get("usage")?.clone()).ok()?;
            Some(SubAgentUsage {
                tool: tool.to_string(),
                usage,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use opsdesk_core::error::{RetrievalError, StoreError};
    use opsdesk_core::provider::{ModelResponse, StreamChunk};
    use opsdesk_core::retrieval::RetrievalOutcome;
    use opsdesk_core::store::SummaryState;
    use std::sync::Mutex;

    // ── Mocks ──────────────────────────────────────────────────────────

    struct MockProvider {
        response: String,
        metadata: serde_json::Map<String, serde_json::Value>,
    }

    impl MockProvider {
        fn new(response: &str) -> Arc<Self> {
            Arc::new(Self {
                response: response.into(),
                metadata: serde_json::Map::new(),
            })
        }
    }

    #[async_trait]
    impl ModelProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn complete(&self, _request: ModelRequest) -> Result<ModelResponse, ProviderError> {
            Ok(ModelResponse {
                message: ThreadMessage::assistant(&self.response),
                usage: Some(Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    total_tokens: 15,
                    reasoning_tokens: None,
                    cached_input_tokens: None,
                }),
                model: "mock-model".into(),
                finish_reason: Some("stop".into()),
                metadata: self.metadata.clone(),
            })
        }

        async fn stream(
            &self,
            _request: ModelRequest,
        ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
            let (tx, rx) = mpsc::channel(8);
            let response = self.response.clone();
            tokio::spawn(async move {
                for word in response.split_inclusive(' ') {
                    let _ = tx
                        .send(Ok(StreamChunk {
                            content: Some(word.to_string()),
                            tool_calls: vec![],
                            done: false,
                            usage: None,
                            finish_reason: None,
                        }))
                        .await;
                }
                let _ = tx
                    .send(Ok(StreamChunk {
                        content: None,
                        tool_calls: vec![],
                        done: true,
                        usage: Some(Usage {
                            input_tokens: 10,
                            output_tokens: 5,
                            total_tokens: 15,
                            reasoning_tokens: None,
                            cached_input_tokens: None,
                        }),
                        finish_reason: Some("stop".into()),
                    }))
                    .await;
            });
            Ok(rx)
        }
    }

    struct FailingProvider {
        error: ProviderError,
    }

    #[async_trait]
    impl ModelProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        async fn complete(&self, _request: ModelRequest) -> Result<ModelResponse, ProviderError> {
            Err(self.error.clone())
        }

        async fn stream(
            &self,
            _request: ModelRequest,
        ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
            Err(self.error.clone())
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl ModelProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _request: ModelRequest) -> Result<ModelResponse, ProviderError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            unreachable!("deadline should fire first")
        }

        async fn stream(
            &self,
            _request: ModelRequest,
        ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            unreachable!("deadline should fire first")
        }
    }

    #[derive(Default)]
    struct MockStore {
        messages: Mutex<Vec<ThreadMessage>>,
        summary: Mutex<SummaryState>,
    }

    impl MockStore {
        fn with_history(history: Vec<ThreadMessage>) -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(history),
                summary: Mutex::new(SummaryState::default()),
            })
        }

        fn appended(&self) -> Vec<ThreadMessage> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ThreadStore for MockStore {
        async fn list_messages(&self, _thread: &ThreadId) -> Result<Vec<ThreadMessage>, StoreError> {
            Ok(self.messages.lock().unwrap().clone())
        }

        async fn append_message(
            &self,
            _thread: &ThreadId,
            message: ThreadMessage,
        ) -> Result<(), StoreError> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }

        async fn summary_state(&self, _thread: &ThreadId) -> Result<SummaryState, StoreError> {
            Ok(self.summary.lock().unwrap().clone())
        }

        async fn save_summary(&self, _thread: &ThreadId, summary: String) -> Result<(), StoreError> {
            self.summary.lock().unwrap().existing_summary = Some(summary);
            Ok(())
        }
    }

    struct StubRetrieval;

    #[async_trait]
    impl RetrievalService for StubRetrieval {
        async fn search(&self, _query: &str) -> Result<RetrievalOutcome, RetrievalError> {
            Ok(RetrievalOutcome::with_text(
                "[1] (Relevance: 85.0%)\nFact A\n\n---\n\n[2] (Relevance: 40.0%)\nFact B",
            ))
        }
    }

    fn history(n: i64) -> Vec<ThreadMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    ThreadMessage::user(format!("question {i}")).with_order(i, 0)
                } else {
                    ThreadMessage::assistant(format!("answer {i}")).with_order(i, 0)
                }
            })
            .collect()
    }

    fn pipeline(provider: Arc<dyn ModelProvider>, store: Arc<MockStore>) -> TurnPipeline {
        TurnPipeline::new(provider, store, BudgetConfig::chat(), "mock-model")
            .with_system_info("You are the Opsdesk chat agent.")
    }

    // ── Tests ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn buffered_turn_produces_result_and_persists() {
        let store = MockStore::with_history(history(4));
        let p = pipeline(MockProvider::new("Here is your answer."), store.clone());

        let result = p
            .run(TurnArgs::new(ThreadId::new(), "What is our refund policy?"))
            .await
            .unwrap();

        assert_eq!(result.text, "Here is your answer.");
        assert_eq!(result.usage.total_tokens, 15);
        assert_eq!(result.finish_reason.as_deref(), Some("stop"));
        assert_eq!(result.model, "mock-model");
        assert_eq!(result.provider, "mock");
        assert!(result.context_window.contains("system-info"));
        assert!(result.time_to_first_token_ms.is_none());

        let appended = store.appended();
        let last = appended.last().unwrap();
        assert_eq!(last.content, "Here is your answer.");
        assert_eq!(last.metadata["status"], "complete");
        assert_eq!(last.order, 4);
    }

    #[tokio::test]
    async fn context_window_contains_history_but_not_live_message() {
        let store = MockStore::with_history(history(4));
        let p = pipeline(MockProvider::new("ok"), store);

        let result = p
            .run(TurnArgs::new(ThreadId::new(), "a brand new live question"))
            .await
            .unwrap();

        assert!(result.context_window.contains("question 0"));
        assert!(result.context_window.contains("answer 3"));
        assert!(!result.context_window.contains("a brand new live question"));
        assert_eq!(result.context_stats.message_count, 4);
    }

    #[tokio::test]
    async fn retrieval_feeds_knowledge_sections() {
        let store = MockStore::with_history(history(2));
        let p = pipeline(MockProvider::new("ok"), store)
            .with_retrieval(Arc::new(StubRetrieval));

        let result = p
            .run(TurnArgs::new(ThreadId::new(), "refund policy details"))
            .await
            .unwrap();

        assert!(result.context_window.contains("Fact A"));
        assert!(result.context_window.contains("Fact B"));
        assert!(result.context_stats.has_rag);
    }

    #[tokio::test]
    async fn streaming_turn_tracks_first_token_and_emits_events() {
        let store = MockStore::with_history(history(2));
        let p = pipeline(MockProvider::new("streamed words here"), store);

        let (tx, mut rx) = mpsc::channel(32);
        let result = p
            .run(TurnArgs::new(ThreadId::new(), "stream please").streaming(tx))
            .await
            .unwrap();

        assert_eq!(result.text, "streamed words here");
        assert!(result.time_to_first_token_ms.is_some());
        assert_eq!(result.usage.total_tokens, 15);

        let mut saw_chunk = false;
        let mut saw_done = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                TurnStreamEvent::Chunk { .. } => saw_chunk = true,
                TurnStreamEvent::Done { .. } => saw_done = true,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_chunk);
        assert!(saw_done);
    }

    #[tokio::test]
    async fn failure_persists_record_and_rethrows_original() {
        let store = MockStore::with_history(history(2));
        let p = pipeline(
            Arc::new(FailingProvider {
                error: ProviderError::ApiError {
                    status_code: 429,
                    message: "Too many requests".into(),
                },
            }),
            store.clone(),
        );

        let err = p
            .run(TurnArgs::new(ThreadId::new(), "hello"))
            .await
            .unwrap_err();

        // The original error comes back untouched.
        let Error::Provider(ProviderError::ApiError { status_code, .. }) = &err else {
            panic!("expected original provider error, got {err}");
        };
        assert_eq!(*status_code, 429);

        // Classification happens at the outer boundary and says retry.
        let classification =
            crate::classify::classify(&crate::classify::FailureInfo::from_message(err.to_string()).with_status(429));
        assert!(classification.should_retry);
        assert_eq!(classification.reason, crate::classify::ReasonCode::RateLimit);

        // A terminal failed record landed on the thread.
        let appended = store.appended();
        let last = appended.last().unwrap();
        assert_eq!(last.content, FAILED_TURN_TEXT);
        assert_eq!(last.metadata["status"], "failed");
        assert!(last.metadata["error"]
            .as_str()
            .unwrap()
            .contains("Too many requests"));
    }

    #[tokio::test]
    async fn failed_record_sorts_after_existing_history() {
        let store = MockStore::with_history(history(4));
        let p = pipeline(
            Arc::new(FailingProvider {
                error: ProviderError::Network("down".into()),
            }),
            store.clone(),
        );

        let _ = p.run(TurnArgs::new(ThreadId::new(), "hello")).await;

        // Re-read the thread the way the next turn would.
        let mut messages = store.appended();
        messages.sort_by_key(ThreadMessage::sort_key);
        let orders: Vec<i64> = messages.iter().map(|m| m.order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3, 4]);
        let last = messages.last().unwrap();
        assert_eq!(last.content, FAILED_TURN_TEXT);
        assert_eq!(last.order, 4);
    }

    #[tokio::test]
    async fn streaming_failure_emits_error_event() {
        let store = MockStore::with_history(vec![]);
        let p = pipeline(
            Arc::new(FailingProvider {
                error: ProviderError::Network("socket hang up".into()),
            }),
            store,
        );

        let (tx, mut rx) = mpsc::channel(8);
        let err = p
            .run(TurnArgs::new(ThreadId::new(), "hello").streaming(tx))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("socket hang up"));

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, TurnStreamEvent::Error { .. }));
    }

    #[tokio::test]
    async fn deadline_exceeded_yields_retryable_timeout() {
        let store = MockStore::with_history(vec![]);
        let p = pipeline(Arc::new(SlowProvider), store);

        let err = p
            .run(
                TurnArgs::new(ThreadId::new(), "hello")
                    .with_deadline(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();

        assert!(matches!(&err, Error::Provider(ProviderError::Timeout(_))));
        let classification = crate::classify::classify(&crate::classify::FailureInfo::from(
            match &err {
                Error::Provider(p) => p,
                _ => unreachable!(),
            },
        ));
        assert!(classification.should_retry);
        assert_eq!(classification.reason, crate::classify::ReasonCode::Timeout);
    }

    #[tokio::test]
    async fn deadline_covers_context_building_too() {
        struct StallingHooks;

        #[async_trait]
        impl TurnHooks for StallingHooks {
            async fn before_context(&self, _args: &TurnArgs) -> crate::hooks::HookContext {
                tokio::time::sleep(Duration::from_secs(60)).await;
                crate::hooks::HookContext::default()
            }
        }

        // The provider is fast; the stall happens before it is reached.
        let store = MockStore::with_history(vec![]);
        let p = pipeline(MockProvider::new("ok"), store).with_hooks(Arc::new(StallingHooks));

        let err = p
            .run(
                TurnArgs::new(ThreadId::new(), "hello")
                    .with_deadline(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();

        assert!(matches!(&err, Error::Provider(ProviderError::Timeout(_))));
    }

    #[tokio::test]
    async fn hooks_run_and_can_inject_context() {
        struct RecordingHooks {
            error_seen: Mutex<bool>,
        }

        #[async_trait]
        impl TurnHooks for RecordingHooks {
            async fn before_context(&self, _args: &TurnArgs) -> crate::hooks::HookContext {
                crate::hooks::HookContext {
                    integrations_info: Some("connected: salesforce".into()),
                    ..Default::default()
                }
            }

            async fn on_error(&self, _args: &TurnArgs, _error: &Error) {
                *self.error_seen.lock().unwrap() = true;
            }
        }

        let hooks = Arc::new(RecordingHooks {
            error_seen: Mutex::new(false),
        });

        let store = MockStore::with_history(history(2));
        let p = pipeline(MockProvider::new("ok"), store).with_hooks(hooks.clone());
        let result = p.run(TurnArgs::new(ThreadId::new(), "hi")).await.unwrap();
        assert!(result.context_window.contains("connected: salesforce"));
        assert!(result.context_stats.has_integrations);
        assert!(!*hooks.error_seen.lock().unwrap());

        // And on failure, on_error fires.
        let store = MockStore::with_history(vec![]);
        let p = pipeline(
            Arc::new(FailingProvider {
                error: ProviderError::Network("down".into()),
            }),
            store,
        )
        .with_hooks(hooks.clone());
        let _ = p.run(TurnArgs::new(ThreadId::new(), "hi")).await;
        assert!(*hooks.error_seen.lock().unwrap());
    }

    #[test]
    fn sub_agent_usage_rollup_ignores_unknown_tools() {
        let metadata: serde_json::Map<String, serde_json::Value> = serde_json::from_str(
            r#"{
                "steps": [
                    {"tool": "web_agent", "usage": {"input_tokens": 100, "output_tokens": 40, "total_tokens": 140}},
                    {"tool": "calculator", "usage": {"input_tokens": 5, "output_tokens": 1, "total_tokens": 6}},
                    {"tool": "crm_agent", "usage": {"input_tokens": 30, "output_tokens": 10, "total_tokens": 40}}
                ]
            }"#,
        )
        .unwrap();

        let rollup = extract_sub_agent_usage(&metadata);
        assert_eq!(rollup.len(), 2);
        assert_eq!(rollup[0].tool, "web_agent");
        assert_eq!(rollup[0].usage.total_tokens, 140);
        assert_eq!(rollup[1].tool, "crm_agent");
        assert_eq!(rollup[1].usage.total_tokens, 40);
    }

    #[test]
    fn sub_agent_usage_handles_missing_steps() {
        let metadata = serde_json::Map::new();
        assert!(extract_sub_agent_usage(&metadata).is_empty());
    }

    #[tokio::test]
    async fn summarization_schedules_when_history_is_heavy() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingSummarizer {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl Summarizer for CountingSummarizer {
            async fn summarize(
                &self,
                _thread: &ThreadId,
                _existing: Option<String>,
            ) -> Result<String, ProviderError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok("summary".into())
            }
        }

        let summarizer = Arc::new(CountingSummarizer {
            calls: AtomicUsize::new(0),
        });

        // A small window makes modest history cross the 0.65 threshold.
        let config = BudgetConfig {
            model_context_limit: 1_000,
            ..BudgetConfig::chat()
        };
        let heavy: Vec<ThreadMessage> = (0..20)
            .map(|i| ThreadMessage::user("w".repeat(800)).with_order(i, 0))
            .collect();
        let store = MockStore::with_history(heavy);

        let p = TurnPipeline::new(MockProvider::new("ok"), store, config, "mock-model")
            .with_summarizer(summarizer.clone());
        let _ = p.run(TurnArgs::new(ThreadId::new(), "hi")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(summarizer.calls.load(Ordering::SeqCst) >= 1);
    }
}

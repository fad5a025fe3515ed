//! Planner loop (spec 4.6): turns one inbound message into zero or more
//! tool calls and exactly one assistant reply.
//!
//! `run` drives the stage sequence `PERSIST_USER_MESSAGE -> BUILD_CONTEXT
//! -> REQUEST_PLAN -> DECIDE -> (tool_call loop | final) ->
//! EXTRACT_MEMORIES -> MAYBE_COMPACT`. The plan the model returns must be
//! one of exactly two JSON shapes; anything else falls through a fixed
//! chain (plain-chat retry, then an echo) rather than being silently
//! coerced.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};

use crate::bus::{BusError, Event, EventBus, EventKind, Handler};
use crate::errors::ErrorKind;
use crate::llm::{Embedder, FacadeError, LlmClient};
use crate::memory::{MemoryEngine, MemoryError, NewMemory, SearchQuery};
use crate::messages::{HistoryQuery, MessageError, MessageStore, NewMessage};
use crate::tools::{ToolError, ToolRegistry};
use crate::types::{new_id, Memory, MemoryKind, Message, Role, SourceReference, SourceReferenceType, ToolContext};

/// Plan hops per inbound message before the loop gives up and falls back
/// to an echo, guarding against a model stuck calling tools forever.
const MAX_TOOL_HOPS: u32 = 4;

/// How long the planner waits for a `tool_executed` reply before treating
/// the call as failed (spec 4.4: 30 s pending-promise timeout).
const TOOL_CALL_TIMEOUT_SECS: u64 = 30;

/// Errors the planner loop can produce (spec 7).
#[derive(Debug, Error)]
pub enum PlannerError {
    /// The message store failed.
    #[error("message store error: {0}")]
    Messages(#[from] MessageError),
    /// The memory engine failed.
    #[error("memory engine error: {0}")]
    Memory(#[from] MemoryError),
    /// The tool registry failed.
    #[error("tool registry error: {0}")]
    Tools(#[from] ToolError),
    /// The language model facade failed.
    #[error("language model error: {0}")]
    Llm(#[from] FacadeError),
    /// The event bus failed.
    #[error("event bus error: {0}")]
    Bus(#[from] BusError),
    /// The model kept requesting tool calls past the hop budget.
    #[error("exceeded {MAX_TOOL_HOPS} tool call hops for a single turn")]
    TooManyToolHops,
}

impl PlannerError {
    /// Classify this error per spec 7's abstract kinds.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Messages(e) => e.kind(),
            Self::Memory(e) => e.kind(),
            Self::Tools(e) => e.kind(),
            Self::Llm(e) => e.kind(),
            Self::Bus(e) => e.kind(),
            Self::TooManyToolHops => ErrorKind::Internal,
        }
    }
}

/// The two legal shapes a plan response can take (spec 4.6: `DECIDE`).
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// A reply ready to send to the user.
    Final {
        /// The reply text.
        content: String,
    },
    /// A tool the planner wants invoked before it can finish.
    ToolCall {
        /// Tool name, as advertised by the registry.
        tool: String,
        /// Arguments object for the call.
        args: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawPlan {
    Final { content: String },
    ToolCall { tool: String, args: serde_json::Value },
}

/// Parse a model response into a [`Plan`], strictly: any shape other than
/// the two spec 4.6 contracts is rejected rather than coerced.
fn parse_plan(raw: &str) -> Result<Plan, serde_json::Error> {
    match serde_json::from_str::<RawPlan>(raw.trim())? {
        RawPlan::Final { content } => Ok(Plan::Final { content }),
        RawPlan::ToolCall { tool, args } => Ok(Plan::ToolCall { tool, args }),
    }
}

fn compose_prompt(history: &[Message], memories: &[Memory], tools_desc: &str, latest: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are a personal assistant. Reply with exactly one JSON object: either\n");
    prompt.push_str(r#"{"type":"final","content":"..."}"#);
    prompt.push_str(" or ");
    prompt.push_str(r#"{"type":"tool_call","tool":"...","args":{...}}"#);
    prompt.push_str(".\n\nAvailable tools:\n");
    prompt.push_str(tools_desc);
    prompt.push_str("\n\nRelevant memories:\n");
    for memory in memories {
        prompt.push_str(&format!("- [{}] {}: {}\n", memory.kind, memory.title, memory.content));
    }
    prompt.push_str("\nConversation so far:\n");
    for message in history {
        prompt.push_str(&format!("{}: {}\n", message.role, message.content));
    }
    prompt.push_str(&format!("user: {latest}\n"));
    prompt
}

/// Query text for the memory recall search (spec 4.6(b)): a conversation
/// embedding built from the fetched history window rather than just the
/// newest message, so recall reflects the turn's context. Falls back to
/// `latest` alone when there's no history yet (e.g. a brand-new
/// conversation).
fn conversation_query(history: &[Message], latest: &str) -> String {
    if history.is_empty() {
        return latest.to_owned();
    }
    history.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n")
}

/// Filler messages that carry no durable fact or preference, skipped
/// before spending an LLM call on extraction (spec 4.6).
const FILLER_PATTERNS: &[&str] = &["ok", "okay", "thanks", "thank you", "yes", "no", "sure", "got it", "cool", "lol", "hi", "hello", "hey", "bye"];

fn skip_memory_extraction(user_text: &str) -> bool {
    let trimmed = user_text.trim();
    if trimmed.chars().count() < 10 {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    FILLER_PATTERNS.iter().any(|pattern| lowered == *pattern)
}

/// Shape of a `tool_executed` event's payload (spec 4.4).
#[derive(Debug, Deserialize)]
struct ToolExecutedPayload {
    #[serde(rename = "executionId")]
    execution_id: String,
    ok: bool,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// The settled outcome of one tool call, delivered to whichever
/// `decide_loop` iteration is waiting on it.
#[derive(Debug, Clone)]
struct ToolOutcome {
    ok: bool,
    data: Option<serde_json::Value>,
    error: Option<String>,
}

type PendingToolCalls = Arc<Mutex<HashMap<String, oneshot::Sender<ToolOutcome>>>>;

/// Resolves the planner's pending tool-call promises as `tool_executed`
/// events arrive (spec 4.4, spec 9 "correlation map"). Subscribed to the
/// bus once per planner instance.
struct ToolOutcomeRouter {
    pending: PendingToolCalls,
}

#[async_trait]
impl Handler for ToolOutcomeRouter {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let payload: ToolExecutedPayload = serde_json::from_value(event.payload.clone())?;
        if let Some(tx) = self.pending.lock().await.remove(&payload.execution_id) {
            let _ = tx.send(ToolOutcome { ok: payload.ok, data: payload.data, error: payload.error });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "planner-tool-outcome-router"
    }
}

/// Drives one inbound turn through the planner pipeline (spec 4.6).
pub struct Planner {
    messages: Arc<MessageStore>,
    memory: Arc<MemoryEngine>,
    tools: Arc<ToolRegistry>,
    bus: Arc<EventBus>,
    llm: Arc<dyn LlmClient>,
    embedder: Arc<dyn Embedder>,
    history_window: i64,
    recall_limit: usize,
    compaction_trigger: i64,
    pending: PendingToolCalls,
}

impl Planner {
    /// Build a planner wired to the runtime's shared collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        messages: Arc<MessageStore>,
        memory: Arc<MemoryEngine>,
        tools: Arc<ToolRegistry>,
        bus: Arc<EventBus>,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn Embedder>,
        history_window: usize,
        recall_limit: usize,
        compaction_trigger: usize,
    ) -> Self {
        Self {
            messages,
            memory,
            tools,
            bus,
            llm,
            embedder,
            history_window: i64::try_from(history_window).unwrap_or(i64::MAX),
            recall_limit,
            compaction_trigger: i64::try_from(compaction_trigger).unwrap_or(i64::MAX),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handler that resolves this planner's pending tool-call promises.
    /// Subscribe it to `tool_executed` once, before routing any inbound
    /// message (spec 4.4).
    #[must_use]
    pub fn tool_outcome_listener(&self) -> Arc<dyn Handler> {
        Arc::new(ToolOutcomeRouter { pending: Arc::clone(&self.pending) })
    }

    /// Process one inbound message to completion, returning the assistant
    /// reply that was persisted (spec 4.6).
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the user message, building context,
    /// or persisting the final reply fails. Plan-parsing failures and tool
    /// errors are absorbed by the fallback chain and do not surface here.
    pub async fn run(&self, conversation_id: &str, user_id: &str, content: &str) -> Result<Message, PlannerError> {
        let user_message = self
            .messages
            .append(NewMessage {
                conversation_id: conversation_id.to_owned(),
                user_id: user_id.to_owned(),
                role: Role::User,
                content: content.to_owned(),
                metadata: None,
                id: None,
            })
            .await?;
        self.publish_message_created(&user_message).await;

        let ctx = ToolContext { user_id: user_id.to_owned(), conversation_id: conversation_id.to_owned(), ..Default::default() };

        let reply_text = self.decide_loop(conversation_id, user_id, content, &ctx).await?;

        let assistant_message = self
            .messages
            .append(NewMessage {
                conversation_id: conversation_id.to_owned(),
                user_id: user_id.to_owned(),
                role: Role::Assistant,
                content: reply_text,
                metadata: None,
                id: None,
            })
            .await?;
        self.publish_message_created(&assistant_message).await;

        self.extract_memories(conversation_id, user_id, content, &assistant_message.content).await;
        self.maybe_compact(conversation_id, user_id).await;

        Ok(assistant_message)
    }

    async fn decide_loop(
        &self,
        conversation_id: &str,
        user_id: &str,
        latest: &str,
        ctx: &ToolContext,
    ) -> Result<String, PlannerError> {
        let mut extra_context = String::new();

        for _ in 0..MAX_TOOL_HOPS {
            let (history, memories) = self.build_context(conversation_id, user_id, latest).await?;
            let tools_desc = self.describe_tools().await;
            let mut prompt = compose_prompt(&history, &memories, &tools_desc, latest);
            prompt.push_str(&extra_context);

            let raw = match self.llm.generate(&prompt).await {
                Ok(raw) => raw,
                Err(_) => return Ok(format!("Sorry, I couldn't reach the language model. You said: {latest}")),
            };

            match parse_plan(&raw) {
                Ok(Plan::Final { content }) => return Ok(content),
                Ok(Plan::ToolCall { tool, args }) => {
                    let outcome = self.call_tool_via_bus(&tool, args, ctx).await;
                    let summary = match &outcome.data {
                        Some(data) => data.to_string(),
                        None => outcome.error.clone().unwrap_or_default(),
                    };
                    extra_context.push_str(&format!("\ntool_result[{tool}]: {summary}\n"));
                }
                Err(_) => {
                    // Fall back to treating the raw response as plain chat,
                    // rather than silently coercing a malformed plan.
                    if !raw.trim().is_empty() {
                        return Ok(raw);
                    }
                    return Ok(format!("I'm not sure how to help with: {latest}"));
                }
            }
        }

        Err(PlannerError::TooManyToolHops)
    }

    /// Publish `tool_execute` and await the matching `tool_executed` reply
    /// via the pending-promise map, timing out after
    /// `TOOL_CALL_TIMEOUT_SECS` (spec 4.4).
    async fn call_tool_via_bus(&self, tool: &str, args: serde_json::Value, ctx: &ToolContext) -> ToolOutcome {
        let execution_id = new_id("exec");
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(execution_id.clone(), tx);

        if let Err(err) = self.publish_tool_execute(&execution_id, tool, &args, ctx).await {
            self.pending.lock().await.remove(&execution_id);
            return ToolOutcome { ok: false, data: None, error: Some(err.to_string()) };
        }

        match tokio::time::timeout(std::time::Duration::from_secs(TOOL_CALL_TIMEOUT_SECS), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&execution_id);
                ToolOutcome { ok: false, data: None, error: Some("tool execution channel closed before a reply arrived".to_owned()) }
            }
            Err(_) => {
                self.pending.lock().await.remove(&execution_id);
                ToolOutcome { ok: false, data: None, error: Some(format!("tool '{tool}' timed out after {TOOL_CALL_TIMEOUT_SECS}s")) }
            }
        }
    }

    async fn build_context(&self, conversation_id: &str, user_id: &str, latest: &str) -> Result<(Vec<Message>, Vec<Memory>), PlannerError> {
        let history = self
            .messages
            .history(HistoryQuery { conversation_id: conversation_id.to_owned(), limit: self.history_window })
            .await?;

        let query = conversation_query(&history, latest);
        let memories = self
            .memory
            .search(
                SearchQuery { query, user_id: user_id.to_owned(), kinds: vec![], tags: vec![], limit: self.recall_limit },
                self.embedder.as_ref(),
            )
            .await
            .unwrap_or_default();

        Ok((history, memories))
    }

    async fn describe_tools(&self) -> String {
        self.tools
            .list_tools()
            .await
            .into_iter()
            .map(|t| format!("- {}: {}", t.name, t.short_description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn extract_memories(&self, conversation_id: &str, user_id: &str, user_text: &str, assistant_text: &str) {
        if skip_memory_extraction(user_text) {
            return;
        }
        let prompt = format!(
            "Extract at most one durable fact or preference from this exchange as a JSON object \
             {{\"title\":\"...\",\"content\":\"...\",\"tags\":[...]}}, or the literal string \"none\" if there isn't one.\n\
             user: {user_text}\nassistant: {assistant_text}"
        );
        let Ok(raw) = self.llm.generate(&prompt).await else { return };
        if raw.trim() == "none" || raw.trim().is_empty() {
            return;
        }
        let Ok(extracted) = serde_json::from_str::<ExtractedMemory>(raw.trim()) else { return };

        let _ = self
            .memory
            .add(NewMemory {
                user_id: user_id.to_owned(),
                kind: MemoryKind::Fact,
                title: extracted.title,
                content: extracted.content,
                tags: extracted.tags,
                conversation_id: Some(conversation_id.to_owned()),
                source_references: vec![],
                is_compaktified: false,
                compaktified_from: vec![],
            })
            .await;
    }

    async fn maybe_compact(&self, conversation_id: &str, user_id: &str) {
        let Ok(window) = self
            .messages
            .history(HistoryQuery { conversation_id: conversation_id.to_owned(), limit: self.compaction_trigger })
            .await
        else {
            return;
        };
        if (window.len() as i64) < self.compaction_trigger {
            return;
        }

        let transcript: String = window.iter().map(|m| format!("{}: {}\n", m.role, m.content)).collect();
        let prompt = format!("Summarize this conversation window in two sentences:\n{transcript}");
        let Ok(summary) = self.llm.generate(&prompt).await else { return };
        if summary.trim().is_empty() {
            return;
        }

        let source_references: Vec<SourceReference> = window
            .iter()
            .map(|m| SourceReference { ref_type: SourceReferenceType::Message, id: m.id.clone(), timestamp: m.created_at, excerpt: Some(m.content.chars().take(80).collect()) })
            .collect();

        let _ = self
            .memory
            .add(NewMemory {
                user_id: user_id.to_owned(),
                kind: MemoryKind::Summary,
                title: format!("Conversation summary ({})", Utc::now().date_naive()),
                content: summary,
                tags: vec!["compaction".to_owned()],
                conversation_id: Some(conversation_id.to_owned()),
                source_references,
                is_compaktified: true,
                compaktified_from: window.iter().map(|m| m.id.clone()).collect(),
            })
            .await;
    }

    async fn publish_message_created(&self, message: &Message) {
        if let Ok(event) = Event::new(EventKind::MessageCreated, message) {
            let _ = self.bus.publish(event).await;
        }
    }

    async fn publish_tool_execute(&self, execution_id: &str, tool: &str, args: &serde_json::Value, ctx: &ToolContext) -> Result<(), BusError> {
        let event = Event::new(EventKind::ToolExecute, &serde_json::json!({ "executionId": execution_id, "tool": tool, "args": args, "ctx": ctx }))?;
        self.bus.publish(event).await
    }
}

#[derive(Debug, Deserialize)]
struct ExtractedMemory {
    title: String,
    content: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vector::InMemoryVectorIndex;
    use crate::tools::{ToolExecutor, ToolSet, ToolSetCore};
    use crate::types::{HealthStatus, ToolDescriptor};

    struct ScriptedLlm {
        responses: tokio::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate(&self, _prompt: &str) -> Result<String, FacadeError> {
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                Ok("none".to_owned())
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    struct StaticEmbedder;

    #[async_trait]
    impl Embedder for StaticEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, FacadeError> {
            Ok(vec![1.0, 0.0])
        }
    }

    async fn test_planner(responses: Vec<&str>) -> Planner {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = crate::db::open(&dir.path().join("planner.sqlite3")).await.expect("open");
        let messages = Arc::new(MessageStore::new(db.clone()));
        let vector = Arc::new(InMemoryVectorIndex::new(2));
        let embedder: Arc<dyn Embedder> = Arc::new(StaticEmbedder);
        let memory = Arc::new(MemoryEngine::new(db, vector, Arc::clone(&embedder)));
        let tools = Arc::new(ToolRegistry::new());
        let bus = Arc::new(EventBus::new());
        let llm: Arc<dyn LlmClient> =
            Arc::new(ScriptedLlm { responses: tokio::sync::Mutex::new(responses.into_iter().map(String::from).collect()) });

        Planner::new(messages, memory, tools, bus, llm, embedder, 10, 5, 25)
    }

    #[test]
    fn parse_plan_accepts_final_shape() {
        let plan = parse_plan(r#"{"type":"final","content":"hi there"}"#).expect("parse");
        assert_eq!(plan, Plan::Final { content: "hi there".into() });
    }

    #[test]
    fn parse_plan_accepts_tool_call_shape() {
        let plan = parse_plan(r#"{"type":"tool_call","tool":"echo","args":{"x":1}}"#).expect("parse");
        assert_eq!(plan, Plan::ToolCall { tool: "echo".into(), args: serde_json::json!({"x": 1}) });
    }

    #[test]
    fn parse_plan_rejects_unknown_shape() {
        assert!(parse_plan(r#"{"type":"something_else"}"#).is_err());
    }

    #[test]
    fn skip_memory_extraction_rejects_short_messages() {
        assert!(skip_memory_extraction("ok"));
        assert!(skip_memory_extraction("   "));
        assert!(!skip_memory_extraction("remember my flight is at 9am"));
    }

    #[test]
    fn skip_memory_extraction_rejects_filler_patterns() {
        assert!(skip_memory_extraction("thanks"));
        assert!(skip_memory_extraction("  Thank You  "));
        assert!(!skip_memory_extraction("thanks for the detailed summary earlier"));
    }

    #[test]
    fn conversation_query_concatenates_history_when_present() {
        let history = vec![
            Message {
                id: "m1".into(),
                conversation_id: "c1".into(),
                user_id: "u1".into(),
                role: Role::User,
                content: "what's the weather".into(),
                created_at: Utc::now(),
                metadata: None,
            },
            Message {
                id: "m2".into(),
                conversation_id: "c1".into(),
                user_id: "u1".into(),
                role: Role::Assistant,
                content: "sunny today".into(),
                created_at: Utc::now(),
                metadata: None,
            },
        ];
        let query = conversation_query(&history, "and tomorrow?");
        assert!(query.contains("weather"));
        assert!(query.contains("sunny"));
    }

    #[test]
    fn conversation_query_falls_back_to_latest_without_history() {
        assert_eq!(conversation_query(&[], "hello there"), "hello there");
    }

    #[tokio::test]
    async fn run_persists_user_and_assistant_messages() {
        let planner = test_planner(vec![r#"{"type":"final","content":"hello back"}"#, "none"]).await;
        let reply = planner.run("conv-1", "u1", "hello").await.expect("run");
        assert_eq!(reply.content, "hello back");

        let history = planner
            .messages
            .history(HistoryQuery { conversation_id: "conv-1".into(), limit: 10 })
            .await
            .expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn malformed_plan_falls_back_to_plain_chat_text() {
        let planner = test_planner(vec!["not json at all", "none"]).await;
        let reply = planner.run("conv-1", "u1", "hello").await.expect("run");
        assert_eq!(reply.content, "not json at all");
    }

    struct EchoTool;

    #[async_trait]
    impl ToolSetCore for EchoTool {
        fn id(&self) -> &str {
            "test.echo"
        }

        fn name(&self) -> &str {
            "Echo"
        }

        async fn list_tools(&self) -> Vec<ToolDescriptor> {
            vec![ToolDescriptor { name: "echo".into(), description: "echoes its args".into(), short_description: "echo".into(), parameters: serde_json::json!({}), examples: vec![] }]
        }

        async fn call_tool(&self, _name: &str, args: serde_json::Value, _ctx: &ToolContext) -> anyhow::Result<crate::types::ToolResult> {
            Ok(crate::types::ToolResult::success(args))
        }

        async fn check_health(&self) -> HealthStatus {
            HealthStatus::ok(Utc::now())
        }
    }

    #[tokio::test]
    async fn tool_call_plan_round_trips_through_the_event_bus() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = crate::db::open(&dir.path().join("planner-tools.sqlite3")).await.expect("open");
        let messages = Arc::new(MessageStore::new(db.clone()));
        let vector = Arc::new(InMemoryVectorIndex::new(2));
        let embedder: Arc<dyn Embedder> = Arc::new(StaticEmbedder);
        let memory = Arc::new(MemoryEngine::new(db.clone(), vector, Arc::clone(&embedder)));
        let tools = Arc::new(ToolRegistry::new());
        tools.register(ToolSet::System(Box::new(EchoTool))).await.expect("register echo tool");
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(crate::queue::WorkQueue::new(db, Arc::clone(&bus)));
        queue
            .register_worker(
                crate::tools::TOOL_EXECUTION_QUEUE,
                Arc::new(crate::tools::ToolExecutionWorker::new(Arc::clone(&tools), Arc::clone(&bus))),
                2,
                crate::queue::RetryPolicy::default(),
            )
            .await
            .expect("register worker");
        bus.subscribe(EventKind::ToolExecute, Arc::new(ToolExecutor::new(Arc::clone(&queue)))).await;
        bus.subscribe(
            EventKind::JobUpdated,
            Arc::new(crate::tools::ToolExecutionFailurePublisher::new(Arc::clone(&queue), Arc::clone(&bus))),
        )
        .await;
        queue.start_polling(std::time::Duration::from_millis(10)).await;

        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm {
            responses: tokio::sync::Mutex::new(vec![
                r#"{"type":"tool_call","tool":"echo","args":{"x":1}}"#.to_owned(),
                r#"{"type":"final","content":"done"}"#.to_owned(),
                "none".to_owned(),
            ]),
        });

        let planner = Planner::new(messages, memory, tools, Arc::clone(&bus), llm, embedder, 10, 5, 25);
        bus.subscribe(EventKind::ToolExecuted, planner.tool_outcome_listener()).await;

        let reply = planner.run("conv-1", "u1", "echo please").await.expect("run");
        assert_eq!(reply.content, "done");
    }
}

//! Tool registry and tool sets (spec 4.3).
//!
//! A [`ToolSet`] is one of three variants — System, Internal, External —
//! sharing a common [`ToolSetCore`] surface. The registry resolves a call
//! by probing sets in deterministic order (System, then Internal, then
//! External; insertion order within a variant) and dispatching to the
//! first set whose `list_tools` advertises the name (spec 3: first-wins
//! on a name conflict, per spec 9 open question (c)).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::bus::{Event, EventBus, EventKind, Handler};
use crate::errors::ErrorKind;
use crate::queue::{EnqueueOptions, JobHandler, WorkQueue};
use crate::types::{HealthStatus, Job, JobState, ToolContext, ToolDescriptor, ToolResult, ToolSetVariant};

/// Errors the tool registry can produce (spec 7).
#[derive(Debug, Error)]
pub enum ToolError {
    /// No enabled tool set advertises this tool name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    /// The tool, or its owning set, is disabled.
    #[error("tool disabled: {0}")]
    Disabled(String),
    /// A tool set with this id is already registered.
    #[error("tool set already registered: {0}")]
    DuplicateSet(String),
    /// A tool name collides with one already registered by a prior set;
    /// the duplicate is rejected, the first registration wins.
    #[error("tool name already registered by another set: {0}")]
    DuplicateTool(String),
    /// The underlying tool set returned an error.
    #[error("tool set error: {0}")]
    SetFailed(String),
}

impl ToolError {
    /// Classify this error per spec 7's abstract kinds.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownTool(_) => ErrorKind::NotFound,
            Self::Disabled(_) => ErrorKind::Disabled,
            Self::DuplicateSet(_) | Self::DuplicateTool(_) => ErrorKind::Conflict,
            Self::SetFailed(_) => ErrorKind::Transient,
        }
    }
}

/// Common surface every tool set variant implements (spec 4.3).
#[async_trait]
pub trait ToolSetCore: Send + Sync {
    /// Stable id of this set, unique among registered sets.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Tools this set currently advertises.
    async fn list_tools(&self) -> Vec<ToolDescriptor>;

    /// Invoke `name` with `args` under `ctx`.
    async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolResult>;

    /// Probe liveness; cached by the registry with a TTL.
    async fn check_health(&self) -> HealthStatus;
}

/// One of the three tool set variants (spec 4.3, 9).
pub enum ToolSet {
    /// Registered at boot, always running, not lifecycle-managed.
    System(Box<dyn ToolSetCore>),
    /// In-process; the registry may start/stop it.
    Internal(Box<dyn ToolSetCore>),
    /// Remote MCP-style provider; the registry may connect/disconnect it.
    External(Box<dyn ToolSetCore>),
}

impl ToolSet {
    /// The variant this set belongs to.
    #[must_use]
    pub fn variant(&self) -> ToolSetVariant {
        match self {
            Self::System(_) => ToolSetVariant::System,
            Self::Internal(_) => ToolSetVariant::Internal,
            Self::External(_) => ToolSetVariant::External,
        }
    }

    fn core(&self) -> &dyn ToolSetCore {
        match self {
            Self::System(c) | Self::Internal(c) | Self::External(c) => c.as_ref(),
        }
    }
}

struct RegisteredSet {
    set: ToolSet,
    enabled: bool,
    cached_health: tokio::sync::Mutex<Option<(chrono::DateTime<Utc>, HealthStatus)>>,
}

/// Cache TTL for a tool set's health status.
const HEALTH_CACHE_TTL_SECS: i64 = 30;

/// Groups tool sets and dispatches calls to the first matching one
/// (spec 4.3).
#[derive(Default)]
pub struct ToolRegistry {
    sets: RwLock<Vec<RegisteredSet>>,
    tool_enabled: RwLock<HashMap<String, bool>>,
}

impl ToolRegistry {
    /// Build an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tool set. Sets are probed, within a variant, in the
    /// order they were registered.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::DuplicateSet`] if `set.id()` is already
    /// registered, or [`ToolError::DuplicateTool`] if any of its tools
    /// collides with a tool already owned by a previously registered set.
    pub async fn register(&self, set: ToolSet) -> Result<(), ToolError> {
        let mut sets = self.sets.write().await;
        if sets.iter().any(|r| r.set.core().id() == set.core().id()) {
            return Err(ToolError::DuplicateSet(set.core().id().to_owned()));
        }

        let new_names: Vec<String> = set.core().list_tools().await.into_iter().map(|t| t.name).collect();
        for existing in sets.iter() {
            let existing_names: Vec<String> =
                existing.set.core().list_tools().await.into_iter().map(|t| t.name).collect();
            for name in &new_names {
                if existing_names.contains(name) {
                    return Err(ToolError::DuplicateTool(name.clone()));
                }
            }
        }

        sets.push(RegisteredSet { set, enabled: true, cached_health: tokio::sync::Mutex::new(None) });
        Ok(())
    }

    /// Enable or disable a whole tool set by id.
    pub async fn set_enabled(&self, set_id: &str, enabled: bool) {
        let mut sets = self.sets.write().await;
        if let Some(r) = sets.iter_mut().find(|r| r.set.core().id() == set_id) {
            r.enabled = enabled;
        }
    }

    /// Enable or disable a single tool by name, independent of its set.
    pub async fn set_tool_enabled(&self, tool_name: impl Into<String>, enabled: bool) {
        self.tool_enabled.write().await.insert(tool_name.into(), enabled);
    }

    /// List every tool across every enabled set, in dispatch order.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let sets = self.sets.read().await;
        let mut all = Vec::new();
        for idx in dispatch_order(&sets) {
            let r = &sets[idx];
            if !r.enabled {
                continue;
            }
            all.extend(r.set.core().list_tools().await);
        }
        all
    }

    /// Dispatch a tool call to the first enabled set whose `list_tools`
    /// advertises `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::UnknownTool`] if no enabled set advertises
    /// `name`, [`ToolError::Disabled`] if the tool or its set is disabled,
    /// or [`ToolError::SetFailed`] if the underlying set errors.
    pub async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        if self.tool_enabled.read().await.get(name) == Some(&false) {
            return Err(ToolError::Disabled(name.to_owned()));
        }

        let sets = self.sets.read().await;
        for idx in dispatch_order(&sets) {
            let r = &sets[idx];
            if !r.enabled {
                continue;
            }
            let tools = r.set.core().list_tools().await;
            if tools.iter().any(|t| t.name == name) {
                return r
                    .set
                    .core()
                    .call_tool(name, args, ctx)
                    .await
                    .map_err(|e| ToolError::SetFailed(e.to_string()));
            }
        }

        Err(ToolError::UnknownTool(name.to_owned()))
    }

    /// Check health of every registered set, refreshing the cache if its
    /// TTL has expired. Also runs on a low-frequency background sweep via
    /// `run_health_sweep`.
    pub async fn check_health(&self, set_id: &str) -> Option<HealthStatus> {
        let sets = self.sets.read().await;
        let r = sets.iter().find(|r| r.set.core().id() == set_id)?;
        Some(self.health_for(r).await)
    }

    async fn health_for(&self, r: &RegisteredSet) -> HealthStatus {
        let mut cached = r.cached_health.lock().await;
        let now = Utc::now();
        if let Some((checked_at, status)) = cached.as_ref() {
            if (now - *checked_at).num_seconds() < HEALTH_CACHE_TTL_SECS {
                return status.clone();
            }
        }
        let status = r.set.core().check_health().await;
        *cached = Some((now, status.clone()));
        status
    }

    /// Run a health check sweep across every registered set, refreshing
    /// stale cache entries (spec 4.3: "low-frequency background sweep").
    pub async fn run_health_sweep(&self) {
        let sets = self.sets.read().await;
        for r in sets.iter() {
            let _ = self.health_for(r).await;
        }
    }
}

/// Queue a `tool_execute` request lands on before it is actually run, so
/// a failing call is retried per the queue's backoff policy before the
/// planner's pending promise is resolved (spec 4.4, spec 8 "Retry
/// bound").
pub const TOOL_EXECUTION_QUEUE: &str = "tool-execution";

/// Shape of a `tool_execute` event's payload (spec 4.4).
#[derive(Debug, Deserialize)]
struct ToolExecuteRequest {
    #[serde(rename = "executionId")]
    execution_id: String,
    tool: String,
    args: serde_json::Value,
    ctx: ToolContext,
}

/// What actually rides on the `tool-execution` queue: `ctx` is already
/// carried by the job row itself, so the payload only needs what the
/// handler can't get any other way.
#[derive(Debug, Serialize, Deserialize)]
struct QueuedToolCall {
    #[serde(rename = "executionId")]
    execution_id: String,
    tool: String,
    args: serde_json::Value,
}

/// Subscribes to `tool_execute` events and enqueues the call onto
/// [`TOOL_EXECUTION_QUEUE`] rather than dispatching it inline (spec 4.4
/// steps 2-3).
pub struct ToolExecutor {
    queue: Arc<WorkQueue>,
}

impl ToolExecutor {
    /// Build an executor that enqueues onto `queue`.
    #[must_use]
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Handler for ToolExecutor {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let request: ToolExecuteRequest = serde_json::from_value(event.payload.clone())?;
        let call = QueuedToolCall { execution_id: request.execution_id, tool: request.tool, args: request.args };
        self.queue.enqueue(TOOL_EXECUTION_QUEUE, &call, request.ctx, EnqueueOptions::default()).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "tool-executor"
    }
}

/// Runs a queued tool call through the registry. A non-ok result or a
/// dispatch error both `bail!`, so `queue.rs`'s retry/backoff policy
/// applies before the call is given up on (spec 4.4, spec 8 "Retry
/// bound"). On success the terminal `tool_executed` is published here
/// directly, since a successful attempt is already terminal.
pub struct ToolExecutionWorker {
    registry: Arc<ToolRegistry>,
    bus: Arc<EventBus>,
}

impl ToolExecutionWorker {
    /// Build a worker that dispatches through `registry` and replies on
    /// `bus`.
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>, bus: Arc<EventBus>) -> Self {
        Self { registry, bus }
    }
}

#[async_trait]
impl JobHandler for ToolExecutionWorker {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let call: QueuedToolCall = serde_json::from_value(job.payload.clone())?;
        let result = self.registry.call_tool(&call.tool, call.args, &job.ctx).await?;
        if !result.ok {
            anyhow::bail!(result.error.unwrap_or_else(|| format!("tool '{}' failed", call.tool)));
        }
        publish_tool_executed(&self.bus, &call.execution_id, true, result.data, None).await;
        Ok(())
    }
}

/// Shape of a `job_updated` event's payload (spec 4.2).
#[derive(Debug, Deserialize)]
struct JobUpdatedPayload {
    #[serde(rename = "jobId")]
    job_id: String,
    state: JobState,
}

/// Watches `job_updated` for jobs on [`TOOL_EXECUTION_QUEUE`] and
/// publishes the terminal `tool_executed` once a call has exhausted its
/// retries (a success is already published by
/// [`ToolExecutionWorker::handle`] directly).
pub struct ToolExecutionFailurePublisher {
    queue: Arc<WorkQueue>,
    bus: Arc<EventBus>,
}

impl ToolExecutionFailurePublisher {
    /// Build a publisher that reads job state from `queue` and replies
    /// on `bus`.
    #[must_use]
    pub fn new(queue: Arc<WorkQueue>, bus: Arc<EventBus>) -> Self {
        Self { queue, bus }
    }
}

#[async_trait]
impl Handler for ToolExecutionFailurePublisher {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let payload: JobUpdatedPayload = serde_json::from_value(event.payload.clone())?;
        if payload.state != JobState::Failed {
            return Ok(());
        }
        let Ok(job) = self.queue.get_job(&payload.job_id).await else {
            return Ok(());
        };
        if job.queue != TOOL_EXECUTION_QUEUE {
            return Ok(());
        }
        let Ok(call) = serde_json::from_value::<QueuedToolCall>(job.payload.clone()) else {
            return Ok(());
        };
        publish_tool_executed(&self.bus, &call.execution_id, false, None, job.error.clone()).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "tool-execution-failure-publisher"
    }
}

async fn publish_tool_executed(bus: &EventBus, execution_id: &str, ok: bool, data: Option<serde_json::Value>, error: Option<String>) {
    if let Ok(event) =
        Event::new(EventKind::ToolExecuted, &serde_json::json!({ "executionId": execution_id, "ok": ok, "data": data, "error": error }))
    {
        let _ = bus.publish(event).await;
    }
}

/// Indices into `sets`, ordered System -> Internal -> External and by
/// insertion order within a variant (spec 4.3). A stable sort by variant
/// rank alone is sufficient since `sets` already preserves insertion order.
fn dispatch_order(sets: &[RegisteredSet]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..sets.len()).collect();
    order.sort_by_key(|&idx| sets[idx].set.variant().dispatch_rank());
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubSet {
        id: String,
        tools: Vec<&'static str>,
    }

    #[async_trait]
    impl ToolSetCore for StubSet {
        fn id(&self) -> &str {
            &self.id
        }

        fn name(&self) -> &str {
            &self.id
        }

        async fn list_tools(&self) -> Vec<ToolDescriptor> {
            self.tools
                .iter()
                .map(|n| ToolDescriptor {
                    name: (*n).to_owned(),
                    description: "stub".to_owned(),
                    short_description: "stub".to_owned(),
                    parameters: serde_json::json!({}),
                    examples: vec![],
                })
                .collect()
        }

        async fn call_tool(
            &self,
            name: &str,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::success(serde_json::json!({ "handled_by": self.id, "tool": name })))
        }

        async fn check_health(&self) -> HealthStatus {
            HealthStatus::ok(Utc::now())
        }
    }

    #[tokio::test]
    async fn dispatches_to_set_advertising_the_tool() {
        let registry = ToolRegistry::new();
        registry
            .register(ToolSet::Internal(Box::new(StubSet { id: "internal-a".into(), tools: vec!["echo"] })))
            .await
            .expect("register");

        let result = registry
            .call_tool("echo", serde_json::json!({}), &ToolContext::default())
            .await
            .expect("call");
        assert!(result.ok);
    }

    #[tokio::test]
    async fn system_set_wins_over_internal_on_name_conflict_at_registration() {
        let registry = ToolRegistry::new();
        registry
            .register(ToolSet::System(Box::new(StubSet { id: "sys".into(), tools: vec!["echo"] })))
            .await
            .expect("register system");

        let result = registry
            .register(ToolSet::Internal(Box::new(StubSet { id: "internal-a".into(), tools: vec!["echo"] })))
            .await;
        assert!(matches!(result, Err(ToolError::DuplicateTool(_))));
    }

    #[tokio::test]
    async fn disabled_tool_short_circuits_dispatch() {
        let registry = ToolRegistry::new();
        registry
            .register(ToolSet::Internal(Box::new(StubSet { id: "internal-a".into(), tools: vec!["echo"] })))
            .await
            .expect("register");
        registry.set_tool_enabled("echo", false).await;

        let result = registry.call_tool("echo", serde_json::json!({}), &ToolContext::default()).await;
        assert!(matches!(result, Err(ToolError::Disabled(_))));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let result = registry.call_tool("nope", serde_json::json!({}), &ToolContext::default()).await;
        assert!(matches!(result, Err(ToolError::UnknownTool(_))));
    }

    struct RecordingHandler {
        events: Arc<tokio::sync::Mutex<Vec<Event>>>,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn handle(&self, event: &Event) -> anyhow::Result<()> {
            self.events.lock().await.push(event.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    struct FailingSet;

    #[async_trait]
    impl ToolSetCore for FailingSet {
        fn id(&self) -> &str {
            "failing"
        }

        fn name(&self) -> &str {
            "Failing"
        }

        async fn list_tools(&self) -> Vec<ToolDescriptor> {
            vec![ToolDescriptor {
                name: "boom".into(),
                description: "always fails".into(),
                short_description: "boom".into(),
                parameters: serde_json::json!({}),
                examples: vec![],
            }]
        }

        async fn call_tool(&self, _name: &str, _args: serde_json::Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::failure("always fails"))
        }

        async fn check_health(&self) -> HealthStatus {
            HealthStatus::ok(Utc::now())
        }
    }

    async fn test_queue() -> (Arc<WorkQueue>, Arc<EventBus>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = crate::db::open(&dir.path().join("tools-pipeline.sqlite3")).await.expect("open");
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(WorkQueue::new(db, Arc::clone(&bus)));
        (queue, bus)
    }

    #[tokio::test]
    async fn successful_tool_call_round_trips_through_the_queue() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(ToolSet::Internal(Box::new(StubSet { id: "internal-a".into(), tools: vec!["echo"] })))
            .await
            .expect("register");

        let (queue, bus) = test_queue().await;
        queue
            .register_worker(TOOL_EXECUTION_QUEUE, Arc::new(ToolExecutionWorker::new(Arc::clone(&registry), Arc::clone(&bus))), 2, crate::queue::RetryPolicy::default())
            .await
            .expect("register worker");
        bus.subscribe(EventKind::ToolExecute, Arc::new(ToolExecutor::new(Arc::clone(&queue)))).await;

        let events = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        bus.subscribe(EventKind::ToolExecuted, Arc::new(RecordingHandler { events: Arc::clone(&events) })).await;

        let request = Event::new(
            EventKind::ToolExecute,
            &serde_json::json!({ "executionId": "exec-1", "tool": "echo", "args": {}, "ctx": ToolContext::default() }),
        )
        .expect("build event");
        bus.publish(request).await.expect("publish");

        queue.poll_once(TOOL_EXECUTION_QUEUE).await.expect("poll");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let recorded = events.lock().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].payload["executionId"], "exec-1");
        assert_eq!(recorded[0].payload["ok"], true);
    }

    #[tokio::test]
    async fn failing_tool_call_is_retried_then_publishes_terminal_failure() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(ToolSet::Internal(Box::new(FailingSet))).await.expect("register");

        let (queue, bus) = test_queue().await;
        queue
            .register_worker(
                TOOL_EXECUTION_QUEUE,
                Arc::new(ToolExecutionWorker::new(Arc::clone(&registry), Arc::clone(&bus))),
                1,
                crate::queue::RetryPolicy { max_attempts: 3, base_backoff_ms: 1 },
            )
            .await
            .expect("register worker");
        bus.subscribe(EventKind::ToolExecute, Arc::new(ToolExecutor::new(Arc::clone(&queue)))).await;
        bus.subscribe(EventKind::JobUpdated, Arc::new(ToolExecutionFailurePublisher::new(Arc::clone(&queue), Arc::clone(&bus)))).await;

        let events = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        bus.subscribe(EventKind::ToolExecuted, Arc::new(RecordingHandler { events: Arc::clone(&events) })).await;

        let request = Event::new(
            EventKind::ToolExecute,
            &serde_json::json!({ "executionId": "exec-2", "tool": "boom", "args": {}, "ctx": ToolContext::default() }),
        )
        .expect("build event");
        bus.publish(request).await.expect("publish");

        // `enqueue` defaults to 3 max attempts regardless of the worker's
        // retry policy, so exhausting it takes 3 poll cycles.
        for _ in 0..3 {
            queue.poll_once(TOOL_EXECUTION_QUEUE).await.expect("poll");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let recorded = events.lock().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].payload["executionId"], "exec-2");
        assert_eq!(recorded[0].payload["ok"], false);
    }
}

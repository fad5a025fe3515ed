//! Runtime assembly (spec 2): wires the bus, queue, tool registry, memory
//! engine, message store, planner and scheduler into one value, and
//! registers each as a supervised [`Service`](crate::supervisor::Service).

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::bus::{EventBus, EventKind};
use crate::config::RuntimeConfig;
use crate::llm::{Embedder, LlmClient, OllamaClient};
use crate::memory::vector::{HttpVectorIndex, InMemoryVectorIndex, VectorIndex};
use crate::memory::MemoryEngine;
use crate::messages::MessageStore;
use crate::planner::Planner;
use crate::queue::{RetryPolicy, WorkQueue};
use crate::scheduler::Scheduler;
use crate::supervisor::{Service, Supervisor};
use crate::tools::{ToolExecutionFailurePublisher, ToolExecutionWorker, ToolExecutor, ToolRegistry, TOOL_EXECUTION_QUEUE};
use crate::types::HealthStatus;

/// Tool-execution jobs processed concurrently.
const TOOL_EXECUTION_CONCURRENCY: usize = 4;

/// Every shared collaborator a running process needs, wired together per
/// [`RuntimeConfig`] (spec 2).
pub struct Runtime {
    /// Process-wide event fan-out.
    pub bus: Arc<EventBus>,
    /// Persistent named work queues.
    pub queue: Arc<WorkQueue>,
    /// Tool sets and dispatch.
    pub tools: Arc<ToolRegistry>,
    /// Dual-store semantic memory.
    pub memory: Arc<MemoryEngine>,
    /// Append-only conversation log.
    pub messages: Arc<MessageStore>,
    /// Planner loop driving one turn per inbound message.
    pub planner: Arc<Planner>,
    /// Cron-driven scheduled task dispatcher.
    pub scheduler: Arc<Scheduler>,
    /// Service startup and health polling.
    pub supervisor: Arc<Supervisor>,
}

impl Runtime {
    /// Build every collaborator from `config` against an already-migrated
    /// `db`, without starting any background loop.
    #[must_use]
    pub fn build(config: &RuntimeConfig, db: SqlitePool) -> Self {
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(WorkQueue::new(db.clone(), Arc::clone(&bus)));
        let tools = Arc::new(ToolRegistry::new());
        let scheduler = Arc::new(Scheduler::new(db.clone(), Arc::clone(&bus)));

        let vector: Arc<dyn VectorIndex> = match &config.store.vector_endpoint {
            Some(endpoint) => Arc::new(HttpVectorIndex::new(endpoint.clone(), config.store.vector_collection.clone())),
            None => Arc::new(InMemoryVectorIndex::new(config.store.embedding_dimension)),
        };
        let embedder: Arc<dyn Embedder> = Arc::new(OllamaClient::new(config.llm.embedding_endpoint.clone(), config.llm.embedding_model.clone()));
        let llm: Arc<dyn LlmClient> = Arc::new(OllamaClient::new(config.llm.endpoint.clone(), config.llm.model.clone()));

        let memory = Arc::new(MemoryEngine::new(db.clone(), vector, Arc::clone(&embedder)));
        let messages = Arc::new(MessageStore::new(db));

        let planner = Arc::new(Planner::new(
            Arc::clone(&messages),
            Arc::clone(&memory),
            Arc::clone(&tools),
            Arc::clone(&bus),
            llm,
            embedder,
            config.memory.history_window,
            config.memory.recall_limit,
            config.memory.compaction_trigger,
        ));

        let supervisor = Arc::new(Supervisor::new());

        Self { bus, queue, tools, memory, messages, planner, scheduler, supervisor }
    }

    /// Register the queue, scheduler and tool-health sweep as supervised
    /// services, reclaim stuck jobs, and start every background loop
    /// (spec 4.8: fail-fast startup).
    ///
    /// # Errors
    ///
    /// Returns an error if service registration or startup fails.
    pub async fn start(&self, config: &RuntimeConfig) -> anyhow::Result<()> {
        self.bus.subscribe(EventKind::ToolExecute, Arc::new(ToolExecutor::new(Arc::clone(&self.queue)))).await;
        self.bus
            .subscribe(EventKind::JobUpdated, Arc::new(ToolExecutionFailurePublisher::new(Arc::clone(&self.queue), Arc::clone(&self.bus))))
            .await;
        self.bus.subscribe(EventKind::ToolExecuted, self.planner.tool_outcome_listener()).await;

        self.supervisor.register(Arc::new(QueueService { queue: Arc::clone(&self.queue) })).await?;
        self.supervisor.register(Arc::new(ToolsService { tools: Arc::clone(&self.tools) })).await?;

        self.supervisor.start_all().await?;

        self.queue
            .register_worker(
                TOOL_EXECUTION_QUEUE,
                Arc::new(ToolExecutionWorker::new(Arc::clone(&self.tools), Arc::clone(&self.bus))),
                TOOL_EXECUTION_CONCURRENCY,
                RetryPolicy::default(),
            )
            .await?;

        self.queue.reclaim_on_startup().await?;
        self.queue.start_polling(std::time::Duration::from_millis(config.tuning.queue_backoff_ms)).await;
        self.scheduler.start(std::time::Duration::from_secs(config.tuning.scheduler_tick_secs)).await;
        self.supervisor
            .start_health_polling(
                std::time::Duration::from_secs(config.tuning.health_poll_secs),
                std::time::Duration::from_secs(config.tuning.health_timeout_secs),
            )
            .await;

        Ok(())
    }
}

struct QueueService {
    queue: Arc<WorkQueue>,
}

#[async_trait]
impl Service for QueueService {
    fn name(&self) -> &str {
        "queue"
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        match self.queue.list_jobs().await {
            Ok(_) => HealthStatus::ok(chrono::Utc::now()),
            Err(err) => HealthStatus::failed(chrono::Utc::now(), err.to_string()),
        }
    }

    async fn call(&self, method: &str, args: serde_json::Value) -> Result<serde_json::Value, String> {
        match method {
            "listJobs" => {
                let jobs = self.queue.list_jobs().await.map_err(|e| e.to_string())?;
                serde_json::to_value(jobs).map_err(|e| e.to_string())
            }
            "healthcheck" => serde_json::to_value(self.health().await).map_err(|e| e.to_string()),
            other => {
                let _ = args;
                Err(format!("unknown method: {other}"))
            }
        }
    }
}

struct ToolsService {
    tools: Arc<ToolRegistry>,
}

#[async_trait]
impl Service for ToolsService {
    fn name(&self) -> &str {
        "tools"
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        self.tools.run_health_sweep().await;
        HealthStatus::ok(chrono::Utc::now())
    }

    async fn call(&self, method: &str, args: serde_json::Value) -> Result<serde_json::Value, String> {
        match method {
            "listTools" => {
                let tools = self.tools.list_tools().await;
                serde_json::to_value(tools).map_err(|e| e.to_string())
            }
            "healthcheck" => serde_json::to_value(self.health().await).map_err(|e| e.to_string()),
            other => {
                let _ = args;
                Err(format!("unknown method: {other}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_wires_every_collaborator() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = crate::db::open(&dir.path().join("runtime.sqlite3")).await.expect("open");
        let config = RuntimeConfig::default();
        let runtime = Runtime::build(&config, db);

        assert_eq!(runtime.bus.failure_count(), 0);
        assert!(runtime.queue.list_jobs().await.expect("list jobs").is_empty());
    }
}

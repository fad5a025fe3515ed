//! Persistent named work queues (spec 4.2).
//!
//! Each queue has exactly one registered worker, a concurrency cap
//! enforced with a `tokio::sync::Semaphore`, and a retry policy with
//! exponential backoff and jitter. State is durable in SQLite so queues
//! survive a process restart; anything left `running` at startup is
//! reclaimed to `queued` with `attempts+1` (spec 9, open question (a) —
//! the handler is assumed non-idempotent unless the caller documents
//! otherwise).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;

use crate::bus::{Event, EventBus, EventKind};
use crate::errors::ErrorKind;
use crate::types::{new_id, Job, JobState, Priority, ToolContext};

/// Grace period after startup before a reclaimed `running` job is
/// considered eligible for pickup again, giving any still-exiting worker
/// time to flush its own state.
const RECLAIM_GRACE_SECS: i64 = 5;

/// Errors the work queue can produce (spec 7).
#[derive(Debug, Error)]
pub enum QueueError {
    /// No queue is registered under this name.
    #[error("no such queue: {0}")]
    NoSuchQueue(String),
    /// A worker is already registered for this queue.
    #[error("worker already registered for queue: {0}")]
    WorkerAlreadyRegistered(String),
    /// No job exists with this id.
    #[error("job not found: {0}")]
    JobNotFound(String),
    /// The job payload could not be serialized.
    #[error("failed to serialize job payload: {0}")]
    Serialize(serde_json::Error),
    /// A database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueueError {
    /// Classify this error per spec 7's abstract kinds.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSuchQueue(_) | Self::JobNotFound(_) => ErrorKind::NotFound,
            Self::WorkerAlreadyRegistered(_) => ErrorKind::Conflict,
            Self::Serialize(_) => ErrorKind::Validation,
            Self::Database(_) => ErrorKind::Transient,
        }
    }
}

/// Options for `enqueue` (spec 4.2).
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Dispatch priority; defaults to `Priority::NORMAL`.
    pub priority: Option<Priority>,
    /// Delay before the job becomes eligible to run, milliseconds.
    pub delay_ms: Option<u64>,
    /// Attempts allowed before the job is marked failed; defaults to the
    /// queue's configured default.
    pub max_attempts: Option<u32>,
}

/// A queue's retry policy (spec 4.2).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts allowed before a job is marked failed.
    pub max_attempts: u32,
    /// Base backoff before the first retry, milliseconds; doubles per
    /// subsequent attempt and is jittered +/-20%.
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_backoff_ms: 500 }
    }
}

/// A worker function invoked once per job (spec 4.2: `registerWorker`).
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process `job`. An `Err` triggers the retry/backoff path.
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

struct QueueConfig {
    concurrency: usize,
    retry: RetryPolicy,
    handler: Arc<dyn JobHandler>,
    semaphore: Arc<Semaphore>,
}

/// Persistent, priority-ordered, retrying work queue set (spec 4.2).
pub struct WorkQueue {
    db: SqlitePool,
    bus: Arc<EventBus>,
    queues: RwLock<HashMap<String, QueueConfig>>,
    pollers: RwLock<Vec<JoinHandle<()>>>,
}

impl WorkQueue {
    /// Build a work queue backed by `db`, publishing `job_updated` events
    /// on `bus`.
    #[must_use]
    pub fn new(db: SqlitePool, bus: Arc<EventBus>) -> Self {
        Self { db, bus, queues: RwLock::new(HashMap::new()), pollers: RwLock::new(Vec::new()) }
    }

    /// Reclaim any job left `running` from a prior process (spec 4.2).
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn reclaim_on_startup(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'queued', attempts = attempts + 1, updated_at = ?, run_after = ?
             WHERE state = 'running'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind((Utc::now() + chrono::Duration::seconds(RECLAIM_GRACE_SECS)).to_rfc3339())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Register the single worker for `queue_name`. May be called once per
    /// queue name.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::WorkerAlreadyRegistered`] on a second call
    /// for the same queue.
    pub async fn register_worker(
        &self,
        queue_name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        retry: RetryPolicy,
    ) -> Result<(), QueueError> {
        let queue_name = queue_name.into();
        let mut queues = self.queues.write().await;
        if queues.contains_key(&queue_name) {
            return Err(QueueError::WorkerAlreadyRegistered(queue_name));
        }
        queues.insert(
            queue_name,
            QueueConfig {
                concurrency,
                retry,
                handler,
                semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            },
        );
        Ok(())
    }

    /// Enqueue a job on `queue_name`. The queue need not have a worker
    /// registered yet — jobs wait until one is.
    ///
    /// # Errors
    ///
    /// Returns an error if `payload` cannot be serialized or the insert
    /// fails.
    pub async fn enqueue<T: Serialize + Sync>(
        &self,
        queue_name: &str,
        payload: &T,
        ctx: ToolContext,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let id = new_id("job");
        let now = Utc::now();
        let run_after = now
            + chrono::Duration::milliseconds(i64::try_from(opts.delay_ms.unwrap_or(0)).unwrap_or(i64::MAX));
        let priority = opts.priority.unwrap_or_default();
        let max_attempts = opts.max_attempts.unwrap_or(3);

        let payload_json = serde_json::to_string(payload).map_err(QueueError::Serialize)?;
        let ctx_json = serde_json::to_string(&ctx).map_err(QueueError::Serialize)?;

        sqlx::query(
            "INSERT INTO jobs (id, queue, payload_json, ctx_json, attempts, max_attempts, priority, state, created_at, updated_at, run_after, error)
             VALUES (?, ?, ?, ?, 0, ?, ?, 'queued', ?, ?, ?, NULL)",
        )
        .bind(&id)
        .bind(queue_name)
        .bind(payload_json)
        .bind(ctx_json)
        .bind(i64::from(max_attempts))
        .bind(i64::from(priority.0))
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(run_after.to_rfc3339())
        .execute(&self.db)
        .await?;

        Ok(id)
    }

    /// Fetch a job by id.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::JobNotFound`] if no row matches.
    pub async fn get_job(&self, id: &str) -> Result<Job, QueueError> {
        let row = sqlx::query(
            "SELECT id, queue, payload_json, ctx_json, attempts, max_attempts, priority, state, created_at, updated_at, error
             FROM jobs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| QueueError::JobNotFound(id.to_owned()))?;

        row_to_job(&row)
    }

    /// List all jobs, most recently created first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn list_jobs(&self) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query(
            "SELECT id, queue, payload_json, ctx_json, attempts, max_attempts, priority, state, created_at, updated_at, error
             FROM jobs ORDER BY created_at DESC",
        )
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    /// Start one poll loop per registered queue. Each loop claims due jobs
    /// up to its semaphore's remaining permits and runs them concurrently.
    pub async fn start_polling(self: &Arc<Self>, poll_interval: std::time::Duration) {
        let names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        let mut handles = self.pollers.write().await;
        for name in names {
            let queue = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll_interval);
                loop {
                    ticker.tick().await;
                    if let Err(err) = queue.poll_once(&name).await {
                        tracing::warn!(queue = %name, error = %err, "queue poll failed");
                    }
                }
            }));
        }
    }

    pub(crate) async fn poll_once(&self, queue_name: &str) -> Result<(), QueueError> {
        let permits = {
            let queues = self.queues.read().await;
            let Some(config) = queues.get(queue_name) else {
                return Ok(());
            };
            config.semaphore.available_permits()
        };
        if permits == 0 {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        let rows = sqlx::query(
            "SELECT id, queue, payload_json, ctx_json, attempts, max_attempts, priority, state, created_at, updated_at, error
             FROM jobs
             WHERE queue = ? AND state = 'queued' AND run_after <= ?
             ORDER BY priority DESC, created_at ASC
             LIMIT ?",
        )
        .bind(queue_name)
        .bind(&now)
        .bind(i64::try_from(permits).unwrap_or(i64::MAX))
        .fetch_all(&self.db)
        .await?;

        for row in &rows {
            let job = row_to_job(row)?;
            self.claim_and_run(job).await?;
        }

        Ok(())
    }

    async fn claim_and_run(&self, job: Job) -> Result<(), QueueError> {
        let claimed = sqlx::query("UPDATE jobs SET state = 'running', updated_at = ? WHERE id = ? AND state = 'queued'")
            .bind(Utc::now().to_rfc3339())
            .bind(&job.id)
            .execute(&self.db)
            .await?;
        if claimed.rows_affected() == 0 {
            return Ok(());
        }

        let (handler, semaphore, retry) = {
            let queues = self.queues.read().await;
            let Some(config) = queues.get(&job.queue) else {
                return Err(QueueError::NoSuchQueue(job.queue.clone()));
            };
            (Arc::clone(&config.handler), Arc::clone(&config.semaphore), config.retry)
        };

        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .expect("semaphore is never closed");

        let db = self.db.clone();
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = handler.handle(&job).await;
            if let Err(err) = apply_outcome(&db, &bus, &job, retry, outcome).await {
                tracing::error!(job = %job.id, error = %err, "failed to record job outcome");
            }
        });

        Ok(())
    }
}

async fn apply_outcome(
    db: &SqlitePool,
    bus: &EventBus,
    job: &Job,
    retry: RetryPolicy,
    outcome: anyhow::Result<()>,
) -> Result<(), QueueError> {
    let now = Utc::now();
    match outcome {
        Ok(()) => {
            sqlx::query("UPDATE jobs SET state = 'completed', updated_at = ?, error = NULL WHERE id = ?")
                .bind(now.to_rfc3339())
                .bind(&job.id)
                .execute(db)
                .await?;
            publish_job_updated(bus, &job.id, JobState::Completed).await;
        }
        Err(err) => {
            let attempts = job.attempts + 1;
            if attempts < job.max_attempts {
                let backoff = backoff_with_jitter(retry.base_backoff_ms, attempts);
                let run_after = now + chrono::Duration::milliseconds(backoff);
                sqlx::query(
                    "UPDATE jobs SET state = 'queued', attempts = ?, updated_at = ?, run_after = ?, error = ? WHERE id = ?",
                )
                .bind(i64::from(attempts))
                .bind(now.to_rfc3339())
                .bind(run_after.to_rfc3339())
                .bind(err.to_string())
                .bind(&job.id)
                .execute(db)
                .await?;
            } else {
                sqlx::query(
                    "UPDATE jobs SET state = 'failed', attempts = ?, updated_at = ?, error = ? WHERE id = ?",
                )
                .bind(i64::from(attempts))
                .bind(now.to_rfc3339())
                .bind(err.to_string())
                .bind(&job.id)
                .execute(db)
                .await?;
                publish_job_updated(bus, &job.id, JobState::Failed).await;
            }
        }
    }
    Ok(())
}

async fn publish_job_updated(bus: &EventBus, job_id: &str, state: JobState) {
    let Ok(event) = Event::new(EventKind::JobUpdated, &serde_json::json!({ "jobId": job_id, "state": state }))
    else {
        return;
    };
    let _ = bus.publish(event).await;
}

/// Exponential backoff doubling per attempt, jittered +/-20% (spec 4.2).
fn backoff_with_jitter(base_ms: u64, attempt: u32) -> i64 {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(20));
    let jitter_span = exp / 5;
    let jitter: i64 = if jitter_span == 0 {
        0
    } else {
        rand::thread_rng().gen_range(-(jitter_span as i64)..=(jitter_span as i64))
    };
    i64::try_from(exp).unwrap_or(i64::MAX).saturating_add(jitter).max(0)
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job, QueueError> {
    let state_str: String = row.try_get("state")?;
    let state: JobState = state_str.parse().map_err(|_| {
        QueueError::Database(sqlx::Error::Decode(format!("invalid job state: {state_str}").into()))
    })?;

    let payload_json: String = row.try_get("payload_json")?;
    let ctx_json: String = row.try_get("ctx_json")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Job {
        id: row.try_get("id")?,
        queue: row.try_get("queue")?,
        payload: serde_json::from_str(&payload_json)
            .map_err(|e| QueueError::Database(sqlx::Error::Decode(Box::new(e))))?,
        ctx: serde_json::from_str(&ctx_json)
            .map_err(|e| QueueError::Database(sqlx::Error::Decode(Box::new(e))))?,
        attempts: u32::try_from(row.try_get::<i64, _>("attempts")?).unwrap_or(0),
        max_attempts: u32::try_from(row.try_get::<i64, _>("max_attempts")?).unwrap_or(0),
        priority: Priority(i8::try_from(row.try_get::<i64, _>("priority")?).unwrap_or(0)),
        state,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| QueueError::Database(sqlx::Error::Decode(Box::new(e))))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| QueueError::Database(sqlx::Error::Decode(Box::new(e))))?
            .with_timezone(&Utc),
        error: row.try_get("error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    async fn test_db() -> SqlitePool {
        let dir = tempfile::tempdir().expect("tempdir");
        crate::db::open(&dir.path().join("queue.sqlite3")).await.expect("open")
    }

    struct AlwaysOk(Arc<AtomicUsize>);

    #[async_trait]
    impl JobHandler for AlwaysOk {
        async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
            self.0.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    struct AlwaysFail;

    #[async_trait]
    impl JobHandler for AlwaysFail {
        async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn enqueue_and_get_job_roundtrip() {
        let db = test_db().await;
        let bus = Arc::new(EventBus::new());
        let queue = WorkQueue::new(db, bus);

        let id = queue
            .enqueue("echo", &serde_json::json!({"text": "hi"}), ToolContext::default(), EnqueueOptions::default())
            .await
            .expect("enqueue");

        let job = queue.get_job(&id).await.expect("get");
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.queue, "echo");
    }

    #[tokio::test]
    async fn successful_job_completes_and_emits_event() {
        let db = test_db().await;
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(WorkQueue::new(db, bus));
        let hits = Arc::new(AtomicUsize::new(0));

        queue
            .register_worker("echo", Arc::new(AlwaysOk(Arc::clone(&hits))), 2, RetryPolicy::default())
            .await
            .expect("register");

        let id = queue
            .enqueue("echo", &serde_json::json!({}), ToolContext::default(), EnqueueOptions::default())
            .await
            .expect("enqueue");

        queue.poll_once("echo").await.expect("poll");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let job = queue.get_job(&id).await.expect("get");
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_job_exhausts_retries_then_fails() {
        let db = test_db().await;
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(WorkQueue::new(db, bus));

        queue
            .register_worker(
                "flaky",
                Arc::new(AlwaysFail),
                1,
                RetryPolicy { max_attempts: 2, base_backoff_ms: 1 },
            )
            .await
            .expect("register");

        let id = queue
            .enqueue(
                "flaky",
                &serde_json::json!({}),
                ToolContext::default(),
                EnqueueOptions { max_attempts: Some(2), ..Default::default() },
            )
            .await
            .expect("enqueue");

        for _ in 0..2 {
            queue.poll_once("flaky").await.expect("poll");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let job = queue.get_job(&id).await.expect("get");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn registering_worker_twice_is_rejected() {
        let db = test_db().await;
        let bus = Arc::new(EventBus::new());
        let queue = WorkQueue::new(db, bus);
        let hits = Arc::new(AtomicUsize::new(0));

        queue
            .register_worker("echo", Arc::new(AlwaysOk(Arc::clone(&hits))), 1, RetryPolicy::default())
            .await
            .expect("first register");

        let result = queue
            .register_worker("echo", Arc::new(AlwaysOk(hits)), 1, RetryPolicy::default())
            .await;
        assert!(matches!(result, Err(QueueError::WorkerAlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn reclaim_on_startup_requeues_running_jobs() {
        let db = test_db().await;
        sqlx::query(
            "INSERT INTO jobs (id, queue, payload_json, ctx_json, attempts, max_attempts, priority, state, created_at, updated_at, run_after)
             VALUES ('job-stuck', 'echo', '{}', '{}', 0, 3, 0, 'running', datetime('now'), datetime('now'), datetime('now'))",
        )
        .execute(&db)
        .await
        .expect("seed");

        let bus = Arc::new(EventBus::new());
        let queue = WorkQueue::new(db, bus);
        let reclaimed = queue.reclaim_on_startup().await.expect("reclaim");
        assert_eq!(reclaimed, 1);

        let job = queue.get_job("job-stuck").await.expect("get");
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 1);
    }
}

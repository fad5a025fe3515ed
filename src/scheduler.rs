//! Cron scheduler (spec 4.7): fires tool calls or bus events on a
//! recurring schedule.
//!
//! The `cron` crate parses the standard 5-field expression (seconds
//! optional per spec 6). A periodic tick loads due, enabled tasks,
//! dispatches each, then recomputes `nextRun` from `Utc::now()` so a
//! missed tick never double-fires the catch-up window.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::bus::{Event, EventBus, EventKind};
use crate::errors::ErrorKind;
use crate::types::{new_id, ScheduledTask, TaskPayload, TaskType, ToolContext};

/// Errors the scheduler can produce (spec 7).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No scheduled task exists with this id.
    #[error("scheduled task not found: {0}")]
    NotFound(String),
    /// `schedule` is not a valid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidSchedule(String),
    /// The event bus failed while dispatching a task.
    #[error("bus error: {0}")]
    Bus(#[from] crate::bus::BusError),
    /// A database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// JSON (de)serialization of a stored field failed.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Classify this error per spec 7's abstract kinds.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidSchedule(_) => ErrorKind::Validation,
            Self::Bus(e) => e.kind(),
            Self::Database(_) => ErrorKind::Transient,
            Self::Serialize(_) => ErrorKind::Permanent,
        }
    }
}

/// Fields for creating a scheduled task (spec 3, 4.7: `create`).
#[derive(Debug, Clone)]
pub struct NewScheduledTask {
    /// What firing does.
    pub task_type: TaskType,
    /// Cron expression.
    pub schedule: String,
    /// Type-dependent payload.
    pub payload: TaskPayload,
    /// Owning user.
    pub user_id: String,
    /// Conversation context for dispatched work, if any.
    pub conversation_id: Option<String>,
}

fn next_run_after(schedule: &str, after: chrono::DateTime<Utc>) -> Result<Option<chrono::DateTime<Utc>>, SchedulerError> {
    let parsed = Schedule::from_str(schedule).map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;
    Ok(parsed.after(&after).next())
}

/// Cron-driven dispatcher of [`ScheduledTask`]s (spec 4.7).
pub struct Scheduler {
    db: SqlitePool,
    bus: Arc<EventBus>,
    ticker_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build a scheduler backed by `db`, dispatching both `tool_call` and
    /// `event` tasks through `bus`.
    #[must_use]
    pub fn new(db: SqlitePool, bus: Arc<EventBus>) -> Self {
        Self { db, bus, ticker_handle: tokio::sync::Mutex::new(None) }
    }

    /// Create a new scheduled task, computing its first `nextRun`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidSchedule`] if `schedule` does not
    /// parse, or a database error if the insert fails.
    pub async fn create(&self, new: NewScheduledTask) -> Result<ScheduledTask, SchedulerError> {
        let now = Utc::now();
        let next_run = next_run_after(&new.schedule, now)?;
        let id = new_id("task");

        sqlx::query(
            "INSERT INTO scheduled_tasks (id, task_type, schedule, payload_json, user_id, conversation_id, enabled, created_at, updated_at, last_run, next_run)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, NULL, ?)",
        )
        .bind(&id)
        .bind(new.task_type.as_str())
        .bind(&new.schedule)
        .bind(serde_json::to_string(&new.payload)?)
        .bind(&new.user_id)
        .bind(&new.conversation_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(next_run.map(|t| t.to_rfc3339()))
        .execute(&self.db)
        .await?;

        Ok(ScheduledTask {
            id,
            task_type: new.task_type,
            schedule: new.schedule,
            payload: new.payload,
            user_id: new.user_id,
            conversation_id: new.conversation_id,
            enabled: true,
            created_at: now,
            updated_at: now,
            last_run: None,
            next_run,
        })
    }

    /// Enable or disable a task without deleting it (spec 4.7: `setEnabled`).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] if `id` doesn't exist.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), SchedulerError> {
        let result = sqlx::query("UPDATE scheduled_tasks SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::NotFound(id.to_owned()));
        }
        self.publish_task_updated(id).await;
        Ok(())
    }

    /// Delete a scheduled task.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] if `id` doesn't exist.
    pub async fn delete(&self, id: &str) -> Result<(), SchedulerError> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?").bind(id).execute(&self.db).await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::NotFound(id.to_owned()));
        }
        Ok(())
    }

    /// List every scheduled task.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn list(&self) -> Result<Vec<ScheduledTask>, SchedulerError> {
        let rows = sqlx::query(
            "SELECT id, task_type, schedule, payload_json, user_id, conversation_id, enabled, created_at, updated_at, last_run, next_run
             FROM scheduled_tasks ORDER BY created_at ASC",
        )
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    /// Start the periodic tick loop.
    pub async fn start(self: &Arc<Self>, tick_interval: std::time::Duration) {
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                ticker.tick().await;
                if let Err(err) = scheduler.tick().await {
                    tracing::warn!(error = %err, "scheduler tick failed");
                }
            }
        });
        *self.ticker_handle.lock().await = Some(handle);
    }

    /// Run one tick: dispatch every enabled task whose `nextRun` has
    /// passed, then recompute its schedule (spec 4.7).
    ///
    /// # Errors
    ///
    /// Returns an error if the due-task query fails.
    pub async fn tick(&self) -> Result<u64, SchedulerError> {
        let now = Utc::now();
        let rows = sqlx::query(
            "SELECT id, task_type, schedule, payload_json, user_id, conversation_id, enabled, created_at, updated_at, last_run, next_run
             FROM scheduled_tasks WHERE enabled = 1 AND next_run IS NOT NULL AND next_run <= ?",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.db)
        .await?;

        let mut dispatched = 0u64;
        for row in &rows {
            let task = row_to_task(row)?;
            if let Err(err) = self.dispatch(&task).await {
                tracing::warn!(task = %task.id, error = %err, "scheduled task dispatch failed");
            }
            self.record_firing(&task, now).await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn dispatch(&self, task: &ScheduledTask) -> Result<(), SchedulerError> {
        match task.task_type {
            TaskType::ToolCall => {
                let ctx = ToolContext { user_id: task.user_id.clone(), conversation_id: task.conversation_id.clone().unwrap_or_default(), ..Default::default() };
                let event = Event::new(
                    EventKind::ToolExecute,
                    &serde_json::json!({
                        "executionId": new_id("exec"),
                        "tool": task.payload.tool_name,
                        "args": task.payload.args,
                        "ctx": ctx,
                    }),
                )?;
                self.bus.publish(event).await?;
            }
            TaskType::Event => {
                if let Some(topic) = &task.payload.event_topic {
                    if let Ok(kind) = serde_json::from_value::<EventKind>(serde_json::Value::String(topic.clone())) {
                        let event = Event::new(kind, &task.payload.event_payload)?;
                        self.bus.publish(event).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn record_firing(&self, task: &ScheduledTask, now: chrono::DateTime<Utc>) -> Result<(), SchedulerError> {
        let next_run = next_run_after(&task.schedule, now)?;
        sqlx::query("UPDATE scheduled_tasks SET last_run = ?, next_run = ?, updated_at = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind(next_run.map(|t| t.to_rfc3339()))
            .bind(now.to_rfc3339())
            .bind(&task.id)
            .execute(&self.db)
            .await?;
        self.publish_task_updated(&task.id).await;
        Ok(())
    }

    async fn publish_task_updated(&self, task_id: &str) {
        if let Ok(event) = Event::new(EventKind::SchedulerTaskUpdated, &serde_json::json!({ "taskId": task_id })) {
            let _ = self.bus.publish(event).await;
        }
    }
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<ScheduledTask, SchedulerError> {
    let type_str: String = row.try_get("task_type")?;
    let task_type: TaskType = type_str
        .parse()
        .map_err(|_| SchedulerError::Database(sqlx::Error::Decode(format!("invalid task type: {type_str}").into())))?;
    let payload_json: String = row.try_get("payload_json")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let last_run: Option<String> = row.try_get("last_run")?;
    let next_run: Option<String> = row.try_get("next_run")?;

    Ok(ScheduledTask {
        id: row.try_get("id")?,
        task_type,
        schedule: row.try_get("schedule")?,
        payload: serde_json::from_str(&payload_json)?,
        user_id: row.try_get("user_id")?,
        conversation_id: row.try_get("conversation_id")?,
        enabled: row.try_get("enabled")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| SchedulerError::Database(sqlx::Error::Decode(Box::new(e))))?
            .with_timezone(&Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| SchedulerError::Database(sqlx::Error::Decode(Box::new(e))))?
            .with_timezone(&Utc),
        last_run: last_run
            .map(|s| chrono::DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| SchedulerError::Database(sqlx::Error::Decode(Box::new(e))))?,
        next_run: next_run
            .map(|s| chrono::DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| SchedulerError::Database(sqlx::Error::Decode(Box::new(e))))?,
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    async fn test_scheduler() -> (Scheduler, Arc<EventBus>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = crate::db::open(&dir.path().join("scheduler.sqlite3")).await.expect("open");
        let bus = Arc::new(EventBus::new());
        (Scheduler::new(db, Arc::clone(&bus)), bus)
    }

    #[tokio::test]
    async fn create_computes_next_run() {
        let (scheduler, _bus) = test_scheduler().await;
        let task = scheduler
            .create(NewScheduledTask {
                task_type: TaskType::Event,
                schedule: "* * * * * *".into(),
                payload: TaskPayload { event_topic: Some("log".into()), ..Default::default() },
                user_id: "u1".into(),
                conversation_id: None,
            })
            .await
            .expect("create");
        assert!(task.next_run.is_some());
    }

    #[tokio::test]
    async fn create_rejects_invalid_cron() {
        let (scheduler, _bus) = test_scheduler().await;
        let result = scheduler
            .create(NewScheduledTask {
                task_type: TaskType::Event,
                schedule: "not a cron expression".into(),
                payload: TaskPayload::default(),
                user_id: "u1".into(),
                conversation_id: None,
            })
            .await;
        assert!(matches!(result, Err(SchedulerError::InvalidSchedule(_))));
    }

    #[tokio::test]
    async fn set_enabled_rejects_unknown_id() {
        let (scheduler, _bus) = test_scheduler().await;
        let result = scheduler.set_enabled("task-missing", false).await;
        assert!(matches!(result, Err(SchedulerError::NotFound(_))));
    }

    #[tokio::test]
    async fn tick_dispatches_due_tool_call_tasks() {
        let (scheduler, bus) = test_scheduler().await;

        struct RecordingHandler {
            events: Arc<tokio::sync::Mutex<Vec<Event>>>,
        }

        #[async_trait]
        impl crate::bus::Handler for RecordingHandler {
            async fn handle(&self, event: &Event) -> anyhow::Result<()> {
                self.events.lock().await.push(event.clone());
                Ok(())
            }

            fn name(&self) -> &str {
                "recording-handler"
            }
        }

        let events = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        bus.subscribe(EventKind::ToolExecute, Arc::new(RecordingHandler { events: Arc::clone(&events) })).await;

        let task = scheduler
            .create(NewScheduledTask {
                task_type: TaskType::ToolCall,
                schedule: "* * * * * *".into(),
                payload: TaskPayload { tool_name: Some("echo".into()), args: Some(serde_json::json!({})), ..Default::default() },
                user_id: "u1".into(),
                conversation_id: None,
            })
            .await
            .expect("create");

        sqlx::query("UPDATE scheduled_tasks SET next_run = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&task.id)
            .execute(&scheduler.db)
            .await
            .expect("force due");

        let dispatched = scheduler.tick().await.expect("tick");
        assert_eq!(dispatched, 1);

        let recorded = events.lock().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].payload["tool"], "echo");
    }
}

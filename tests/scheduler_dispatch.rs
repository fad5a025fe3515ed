//! Exercises the scheduler dispatching a due `ToolCall` task onto the
//! event bus, the same `tool_execute` path the planner uses.

use std::sync::Arc;

use async_trait::async_trait;
use fabricd::bus::{Event, EventBus, EventKind, Handler};
use fabricd::scheduler::{NewScheduledTask, Scheduler};
use fabricd::types::{TaskPayload, TaskType};
use tokio::sync::Mutex;

struct RecordingHandler {
    events: Arc<Mutex<Vec<Event>>>,
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording-handler"
    }
}

#[tokio::test]
async fn due_tool_call_task_publishes_a_tool_execute_event() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = fabricd::db::open(&dir.path().join("scheduler.sqlite3")).await.expect("open db");

    let bus = Arc::new(EventBus::new());
    let scheduler = Scheduler::new(db.clone(), Arc::clone(&bus));

    let events = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(EventKind::ToolExecute, Arc::new(RecordingHandler { events: Arc::clone(&events) })).await;

    let task = scheduler
        .create(NewScheduledTask {
            task_type: TaskType::ToolCall,
            schedule: "*/1 * * * * *".to_owned(),
            payload: TaskPayload { tool_name: Some("ping".to_owned()), args: Some(serde_json::json!({})), ..Default::default() },
            user_id: "user-1".to_owned(),
            conversation_id: None,
        })
        .await
        .expect("create scheduled task");

    // Force the task due now rather than waiting on the cron cadence.
    sqlx::query("UPDATE scheduled_tasks SET next_run = ? WHERE id = ?")
        .bind((chrono::Utc::now() - chrono::Duration::seconds(5)).to_rfc3339())
        .bind(&task.id)
        .execute(&db)
        .await
        .expect("force due");

    let fired = scheduler.tick().await.expect("tick");
    assert_eq!(fired, 1);

    let recorded = events.lock().await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].payload["tool"], "ping");
    assert_eq!(recorded[0].payload["ctx"]["user_id"], "user-1");

    let tasks = scheduler.list().await.expect("list tasks");
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].last_run.is_some());
    assert!(tasks[0].next_run.expect("next run recomputed") > chrono::Utc::now());
}

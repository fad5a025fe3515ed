//! Exercises the event bus and work queue together: a completed job
//! should publish `JobUpdated` exactly once per transition, observable by
//! a subscriber with no knowledge of the queue's internals.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fabricd::bus::{Event, EventBus, EventKind, Handler};
use fabricd::queue::{EnqueueOptions, JobHandler, RetryPolicy, WorkQueue};
use fabricd::types::{Job, ToolContext};

struct CountingHandler(Arc<AtomicUsize>);

#[async_trait]
impl Handler for CountingHandler {
    async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "counting-handler"
    }
}

struct AlwaysOk;

#[async_trait]
impl JobHandler for AlwaysOk {
    async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn completed_job_publishes_job_updated_on_the_bus() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = fabricd::db::open(&dir.path().join("queue.sqlite3")).await.expect("open db");

    let bus = Arc::new(EventBus::new());
    let seen = Arc::new(AtomicUsize::new(0));
    bus.subscribe(EventKind::JobUpdated, Arc::new(CountingHandler(Arc::clone(&seen)))).await;

    let queue = Arc::new(WorkQueue::new(db, Arc::clone(&bus)));
    queue.register_worker("echo", Arc::new(AlwaysOk), 1, RetryPolicy::default()).await.expect("register worker");

    let id = queue
        .enqueue("echo", &serde_json::json!({"text": "hi"}), ToolContext::default(), EnqueueOptions::default())
        .await
        .expect("enqueue");

    queue.start_polling(std::time::Duration::from_millis(10)).await;

    let mut job = queue.get_job(&id).await.expect("get job");
    for _ in 0..20 {
        if job.state == fabricd::types::JobState::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        job = queue.get_job(&id).await.expect("get job");
    }

    assert_eq!(job.state, fabricd::types::JobState::Completed);
    assert!(seen.load(Ordering::SeqCst) >= 1);
}

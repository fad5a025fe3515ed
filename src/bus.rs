//! In-process event bus (spec 4.1).
//!
//! A closed set of event kinds fans out to many handlers. Publish awaits
//! each subscribed handler in turn but isolates its failure: one handler
//! erroring never stops the rest from running, and never propagates back
//! to the publisher. A log handler publishing a `log_*` event from within
//! its own call stack is rejected (spec 9, "cycle break for logs"); the
//! guard is task-local rather than process-wide, so two unrelated log
//! publishes from different tasks never contend with each other.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::errors::ErrorKind;

tokio::task_local! {
    /// Set for the duration of dispatching a `log_*` event on the
    /// current task's call stack; checked before starting another, so a
    /// handler invoked from within that dispatch can't re-publish a log
    /// event (spec 9).
    static LOG_CYCLE_GUARD: Cell<bool>;
}

/// The closed set of event kinds the bus carries (spec 4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A message row was appended.
    MessageCreated,
    /// A job transitioned to a terminal state.
    JobUpdated,
    /// A memory row was created or changed.
    MemoryUpdated,
    /// An inbound message arrived from an adapter.
    SourceMessage,
    /// A scheduled task's bookkeeping changed.
    SchedulerTaskUpdated,
    /// A GUI-originated action.
    GuiAction,
    /// A response destined for the GUI.
    GuiResponse,
    /// A poke destined for the avatar channel.
    AvatarPoke,
    /// The planner is requesting a tool execution.
    ToolExecute,
    /// A tool execution reached a terminal outcome.
    ToolExecuted,
    /// A log record (never republished by a log handler).
    Log,
}

impl EventKind {
    /// Whether this kind is in the `log_*` family (spec 9: cycle break).
    #[must_use]
    pub fn is_log(self) -> bool {
        matches!(self, Self::Log)
    }
}

/// An event carried on the bus: a kind plus an opaque JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Which closed kind this event belongs to.
    pub kind: EventKind,
    /// Event-specific payload.
    pub payload: serde_json::Value,
}

impl Event {
    /// Build an event, serializing `payload` to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if `payload` cannot be serialized.
    pub fn new<T: Serialize>(kind: EventKind, payload: &T) -> Result<Self, BusError> {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload).map_err(BusError::Serialize)?,
        })
    }
}

/// Errors the bus can produce (spec 7).
#[derive(Debug, Error)]
pub enum BusError {
    /// Publishing a log-kind event from within a log handler (spec 9).
    #[error("log handlers must not publish log-kind events")]
    LogCycle,
    /// The event payload could not be serialized.
    #[error("failed to serialize event payload: {0}")]
    Serialize(serde_json::Error),
}

impl BusError {
    /// Classify this error per spec 7's abstract kinds.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LogCycle => ErrorKind::Validation,
            Self::Serialize(_) => ErrorKind::Internal,
        }
    }
}

/// A fault-isolated event handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one event. Errors are logged and counted, never propagated.
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;

    /// Name used in logs and failure-count diagnostics.
    fn name(&self) -> &str;
}

struct Subscription {
    id: u64,
    handler: Arc<dyn Handler>,
}

/// Process-wide multi-producer multi-consumer event fan-out (spec 4.1).
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Subscription>>>,
    next_id: AtomicU64,
    failure_count: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

/// Handle returned by `subscribe`, used to `unsubscribe` later.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionId {
    kind: EventKind,
    id: u64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Build an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self { handlers: RwLock::new(HashMap::new()), next_id: AtomicU64::new(0), failure_count: AtomicU64::new(0) }
    }

    /// Register `handler` for `kind`. Returns an id usable with `unsubscribe`.
    pub async fn subscribe(&self, kind: EventKind, handler: Arc<dyn Handler>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut handlers = self.handlers.write().await;
        handlers.entry(kind).or_default().push(Subscription { id, handler });
        SubscriptionId { kind, id }
    }

    /// Deregister a handler. In-flight invocations of it complete normally.
    pub async fn unsubscribe(&self, subscription: SubscriptionId) {
        let mut handlers = self.handlers.write().await;
        if let Some(list) = handlers.get_mut(&subscription.kind) {
            list.retain(|s| s.id != subscription.id);
        }
    }

    /// Publish `event` to every handler subscribed to its kind, in
    /// registration order, awaiting each sequentially (spec 4.1: per-kind
    /// FIFO per publisher). A handler's error is logged and counted; it
    /// never stops the remaining handlers or propagates to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::LogCycle`] if a log-kind event is published
    /// from within a log handler's own call stack on this task.
    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        if !event.kind.is_log() {
            self.fan_out(&event).await;
            return Ok(());
        }

        let already_dispatching = LOG_CYCLE_GUARD.try_with(Cell::get).unwrap_or(false);
        if already_dispatching {
            return Err(BusError::LogCycle);
        }

        LOG_CYCLE_GUARD.scope(Cell::new(true), self.fan_out(&event)).await;
        Ok(())
    }

    async fn fan_out(&self, event: &Event) {
        let snapshot: Vec<Arc<dyn Handler>> = {
            let handlers = self.handlers.read().await;
            handlers
                .get(&event.kind)
                .map(|list| list.iter().map(|s| Arc::clone(&s.handler)).collect())
                .unwrap_or_default()
        };

        for handler in snapshot {
            if let Err(err) = handler.handle(event).await {
                self.failure_count.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(handler = handler.name(), error = %err, kind = ?event.kind, "event handler failed");
            }
        }
    }

    /// Total number of handler failures observed so far, for tests and
    /// diagnostics.
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHandler {
        name: String,
        fail: bool,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn handle(&self, event: &Event) -> anyhow::Result<()> {
            self.seen.lock().expect("lock").push(self.name.clone());
            if self.fail {
                anyhow::bail!("{} failed on {:?}", self.name, event.kind);
            }
            Ok(())
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[tokio::test]
    async fn fan_out_isolates_handler_failure() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            EventKind::MessageCreated,
            Arc::new(RecordingHandler { name: "h1".into(), fail: true, seen: Arc::clone(&seen) }),
        )
        .await;
        bus.subscribe(
            EventKind::MessageCreated,
            Arc::new(RecordingHandler { name: "h2".into(), fail: false, seen: Arc::clone(&seen) }),
        )
        .await;

        let event = Event::new(EventKind::MessageCreated, &serde_json::json!({"id": "msg-1"}))
            .expect("build event");
        bus.publish(event).await.expect("publish");

        assert_eq!(*seen.lock().expect("lock"), vec!["h1", "h2"]);
        assert_eq!(bus.failure_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = bus
            .subscribe(
                EventKind::JobUpdated,
                Arc::new(RecordingHandler { name: "h1".into(), fail: false, seen: Arc::clone(&seen) }),
            )
            .await;

        bus.unsubscribe(sub).await;
        let event = Event::new(EventKind::JobUpdated, &serde_json::json!({})).expect("build");
        bus.publish(event).await.expect("publish");

        assert!(seen.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn unrelated_kind_does_not_deliver() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventKind::MessageCreated,
            Arc::new(RecordingHandler { name: "h1".into(), fail: false, seen: Arc::clone(&seen) }),
        )
        .await;

        let event = Event::new(EventKind::MemoryUpdated, &serde_json::json!({})).expect("build");
        bus.publish(event).await.expect("publish");

        assert!(seen.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn concurrent_unrelated_log_publishes_both_succeed() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventKind::Log,
            Arc::new(RecordingHandler { name: "h1".into(), fail: false, seen: Arc::clone(&seen) }),
        )
        .await;

        let a = Arc::clone(&bus);
        let b = Arc::clone(&bus);
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move {
                let event = Event::new(EventKind::Log, &serde_json::json!({"line": 1})).expect("build");
                a.publish(event).await
            }),
            tokio::spawn(async move {
                let event = Event::new(EventKind::Log, &serde_json::json!({"line": 2})).expect("build");
                b.publish(event).await
            }),
        );

        r1.expect("task 1 join").expect("task 1 publish");
        r2.expect("task 2 join").expect("task 2 publish");
        assert_eq!(seen.lock().expect("lock").len(), 2);
    }

    struct RepublishingHandler {
        bus: Arc<EventBus>,
    }

    #[async_trait]
    impl Handler for RepublishingHandler {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            let inner = Event::new(EventKind::Log, &serde_json::json!({"nested": true})).expect("build");
            match self.bus.publish(inner).await {
                Err(BusError::LogCycle) => Ok(()),
                Err(other) => Err(other.into()),
                Ok(()) => anyhow::bail!("expected the nested publish to be rejected as a log cycle"),
            }
        }

        fn name(&self) -> &str {
            "republishing-handler"
        }
    }

    #[tokio::test]
    async fn log_handler_republishing_a_log_event_is_rejected() {
        let bus = Arc::new(EventBus::new());
        bus.subscribe(EventKind::Log, Arc::new(RepublishingHandler { bus: Arc::clone(&bus) })).await;

        let event = Event::new(EventKind::Log, &serde_json::json!({"outer": true})).expect("build");
        bus.publish(event).await.expect("outer publish");

        assert_eq!(bus.failure_count(), 0);
    }
}

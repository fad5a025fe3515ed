//! Top-level error kinds (spec 7).
//!
//! Each module defines its own `thiserror` enum for the errors it can
//! produce; [`RuntimeError`] composes them for callers, such as the
//! binary entrypoint, that need one error type at the edge.

use thiserror::Error;

/// Abstract error kind, independent of which module raised it (spec 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input to an entry point.
    Validation,
    /// Id lookup miss.
    NotFound,
    /// Duplicate id or name.
    Conflict,
    /// IO failure eligible for retry in worker contexts.
    Transient,
    /// Not retried: schema violation, dimension mismatch, malformed plan.
    Permanent,
    /// A wait exceeded its deadline.
    Timeout,
    /// The target tool or tool set is disabled.
    Disabled,
    /// Unexpected; always logged with its source.
    Internal,
}

impl ErrorKind {
    /// The HTTP-adjacent status class a facade would surface for this kind.
    #[must_use]
    pub fn status_class(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Timeout => 504,
            Self::Disabled => 409,
            Self::Transient | Self::Permanent | Self::Internal => 500,
        }
    }
}

/// Composed runtime error (spec 7).
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Error surfaced from the event bus.
    #[error("bus: {0}")]
    Bus(#[from] crate::bus::BusError),
    /// Error surfaced from the work queue.
    #[error("queue: {0}")]
    Queue(#[from] crate::queue::QueueError),
    /// Error surfaced from the tool registry.
    #[error("tools: {0}")]
    Tools(#[from] crate::tools::ToolError),
    /// Error surfaced from the memory engine.
    #[error("memory: {0}")]
    Memory(#[from] crate::memory::MemoryError),
    /// Error surfaced from the message store.
    #[error("messages: {0}")]
    Messages(#[from] crate::messages::MessageError),
    /// Error surfaced from the planner.
    #[error("planner: {0}")]
    Planner(#[from] crate::planner::PlannerError),
    /// Error surfaced from the scheduler.
    #[error("scheduler: {0}")]
    Scheduler(#[from] crate::scheduler::SchedulerError),
    /// Error surfaced from the supervisor.
    #[error("supervisor: {0}")]
    Supervisor(#[from] crate::supervisor::SupervisorError),
    /// Database-layer failure that did not fit a more specific kind.
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
}

impl RuntimeError {
    /// Classify this error per spec 7's abstract kinds.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Bus(_) => ErrorKind::Internal,
            Self::Queue(e) => e.kind(),
            Self::Tools(e) => e.kind(),
            Self::Memory(e) => e.kind(),
            Self::Messages(e) => e.kind(),
            Self::Planner(e) => e.kind(),
            Self::Scheduler(e) => e.kind(),
            Self::Supervisor(e) => e.kind(),
            Self::Database(_) => ErrorKind::Transient,
        }
    }
}

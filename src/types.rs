//! Shared data model (spec 3).
//!
//! Entities use opaque string ids with a kind prefix (`msg-`, `mem-`,
//! `task-`, `job-`, `exec-`), generated at creation and never reassigned.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mint a prefixed opaque id, e.g. `msg-3c9e...`.
#[must_use]
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Where an inbound message originated (spec 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Opaque id of the originating channel instance.
    pub id: String,
    /// The channel kind.
    pub kind: SourceKind,
    /// Human-readable label, if the adapter has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Free-form adapter metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Channel a message arrived on (spec 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// The local GUI / avatar command channel.
    Gui,
    /// A scheduler-fired tick.
    Scheduler,
    /// WhatsApp.
    Whatsapp,
    /// Email.
    Email,
    /// Telegram.
    Telegram,
    /// The system itself (internal events, not a user channel).
    System,
    /// Anything not covered above.
    Other,
}

impl SourceKind {
    /// Lowercase wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gui => "gui",
            Self::Scheduler => "scheduler",
            Self::Whatsapp => "whatsapp",
            Self::Email => "email",
            Self::Telegram => "telegram",
            Self::System => "system",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gui" => Ok(Self::Gui),
            "scheduler" => Ok(Self::Scheduler),
            "whatsapp" => Ok(Self::Whatsapp),
            "email" => Ok(Self::Email),
            "telegram" => Ok(Self::Telegram),
            "system" => Ok(Self::System),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown source kind: {other}")),
        }
    }
}

/// Role of a message within a conversation (spec 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sent by the end user.
    User,
    /// Produced by the planner.
    Assistant,
    /// A system-authored message, e.g. a fallback notice.
    System,
    /// The summarised output of a tool call.
    Tool,
}

impl Role {
    /// Lowercase wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// An append-only conversation entry (spec 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Opaque id, prefix `msg-`.
    pub id: String,
    /// Conversation this message belongs to.
    pub conversation_id: String,
    /// Owning user.
    pub user_id: String,
    /// Who produced the content.
    pub role: Role,
    /// Message body.
    pub content: String,
    /// Creation timestamp; ordering key within a conversation.
    pub created_at: DateTime<Utc>,
    /// Free-form adapter/tool metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Kind of a stored memory (spec 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// A durable fact about the user.
    Fact,
    /// A stated preference.
    Preference,
    /// A compacted summary of a message window.
    Summary,
    /// A single notable event.
    Episode,
}

impl MemoryKind {
    /// Lowercase wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Preference => "preference",
            Self::Summary => "summary",
            Self::Episode => "episode",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fact" => Ok(Self::Fact),
            "preference" => Ok(Self::Preference),
            "summary" => Ok(Self::Summary),
            "episode" => Ok(Self::Episode),
            other => Err(format!("unknown memory kind: {other}")),
        }
    }
}

/// What a memory's source reference points at (spec 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceReferenceType {
    /// A message row.
    Message,
    /// Another memory row.
    Memory,
    /// Something outside the row store.
    External,
}

/// A back-reference from a memory to whatever it was derived from (spec 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReference {
    /// What kind of thing is referenced.
    #[serde(rename = "type")]
    pub ref_type: SourceReferenceType,
    /// Id of the referenced entity.
    pub id: String,
    /// When the referenced entity was created.
    pub timestamp: DateTime<Utc>,
    /// Short excerpt for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

/// A typed, indexed, semantically searchable unit of knowledge (spec 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Opaque id, prefix `mem-`.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Kind of memory.
    pub kind: MemoryKind,
    /// Short title.
    pub title: String,
    /// Body text; `title + "\n" + content` is what gets embedded.
    pub content: String,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Conversation this memory was derived from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Back-references to the messages/memories this was built from.
    pub source_references: Vec<SourceReference>,
    /// Whether this memory is the compacted output of a message window.
    pub is_compaktified: bool,
    /// Ids of the memories this one was compacted from, if any.
    pub compaktified_from: Vec<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
    /// The embedding vector for `title + "\n" + content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Kind of a scheduled task (spec 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Dispatch a tool call on firing.
    ToolCall,
    /// Publish an event on firing.
    Event,
}

impl TaskType {
    /// Lowercase wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolCall => "tool_call",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_call" => Ok(Self::ToolCall),
            "event" => Ok(Self::Event),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

/// Payload carried by a scheduled task, shape depends on `TaskType` (spec 3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Event kind to publish when `type=event`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_topic: Option<String>,
    /// Tool to call when `type=tool_call`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Arguments for the tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    /// Payload to publish when `type=event`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_payload: Option<serde_json::Value>,
}

/// A cron-scheduled unit of recurring work (spec 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Opaque id, prefix `task-`.
    pub id: String,
    /// What firing does.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Cron expression (spec 6: standard 5-field, optional seconds).
    pub schedule: String,
    /// Type-dependent payload.
    pub payload: TaskPayload,
    /// Owning user.
    pub user_id: String,
    /// Conversation context for dispatched work, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Whether the scheduler considers this task due.
    pub enabled: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Last firing timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    /// Next scheduled firing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
}

/// Variant of a tool set (spec 3, 4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSetVariant {
    /// Registered at boot, always running, not lifecycle-managed.
    System,
    /// In-process; the registry may start/stop it.
    Internal,
    /// Remote MCP-style provider; the registry may connect/disconnect it.
    External,
}

impl ToolSetVariant {
    /// Dispatch priority: lower sorts first (spec 4.3: System, Internal, External).
    #[must_use]
    pub fn dispatch_rank(self) -> u8 {
        match self {
            Self::System => 0,
            Self::Internal => 1,
            Self::External => 2,
        }
    }
}

/// Description of a single callable tool (spec 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Globally unique tool name.
    pub name: String,
    /// Full description, used in LLM prompts.
    pub description: String,
    /// Short description, must be at most 50 characters.
    pub short_description: String,
    /// JSON Schema for the arguments object.
    pub parameters: serde_json::Value,
    /// Example invocations, for prompting.
    #[serde(default)]
    pub examples: Vec<serde_json::Value>,
}

/// Health snapshot of a tool set or service (spec 3, 4.3, 4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the last check passed.
    pub healthy: bool,
    /// When the check last ran.
    pub last_check: DateTime<Utc>,
    /// Error detail, if unhealthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthStatus {
    /// Build a healthy status as of `now`.
    #[must_use]
    pub fn ok(now: DateTime<Utc>) -> Self {
        Self {
            healthy: true,
            last_check: now,
            error: None,
        }
    }

    /// Build an unhealthy status as of `now`.
    #[must_use]
    pub fn failed(now: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            last_check: now,
            error: Some(error.into()),
        }
    }
}

/// Priority of a job within its queue (spec 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub i8);

impl Priority {
    /// Lowest priority.
    pub const LOW: Priority = Priority(-1);
    /// Default priority.
    pub const NORMAL: Priority = Priority(0);
    /// Highest priority.
    pub const HIGH: Priority = Priority(1);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// State of a job within its queue's lifecycle (spec 4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for a worker slot.
    Queued,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully after exhausting retries.
    Failed,
}

impl JobState {
    /// Lowercase wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Context passed unchanged through the tool pipeline (spec 3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolContext {
    /// Owning user.
    pub user_id: String,
    /// Conversation this call is part of.
    pub conversation_id: String,
    /// Where the originating event came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceDescriptor>,
    /// Correlates this call with a trace across services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Free-form additional context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// A durable unit of work on a named queue (spec 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque id, prefix `job-`.
    pub id: String,
    /// Name of the queue this job lives on.
    pub queue: String,
    /// Worker-specific payload.
    pub payload: serde_json::Value,
    /// Tool-pipeline context carried alongside the payload.
    pub ctx: ToolContext,
    /// Number of attempts made so far.
    pub attempts: u32,
    /// Attempts allowed before the job is marked failed.
    pub max_attempts: u32,
    /// Dispatch priority.
    pub priority: Priority,
    /// Current lifecycle state.
    pub state: JobState,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Error from the most recent failed attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a tool invocation (spec 3, 4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the call succeeded.
    pub ok: bool,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    /// Build a successful result.
    #[must_use]
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Build a failed result.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

//! Configuration loading (ambient stack, SPEC_FULL 10).
//!
//! Precedence is env > file > defaults, following the same load shape as
//! the kernel config of the donor codebase: read an optional TOML file,
//! then let `RUNTIME_*` environment variables override individual fields.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default path to the SQLite database file.
const DEFAULT_DB_PATH: &str = "./data/runtime.sqlite3";
/// Default in-process vector index is used when no endpoint is configured.
const DEFAULT_VECTOR_COLLECTION: &str = "memories";
/// Default embedding dimension when the embedding facade doesn't report one.
const DEFAULT_EMBEDDING_DIMENSION: usize = 768;
/// Default number of recent messages pulled into planner context.
const DEFAULT_HISTORY_WINDOW: usize = 10;
/// Default number of memories pulled into planner context.
const DEFAULT_RECALL_LIMIT: usize = 10;
/// Default message count that triggers a compaction check.
const DEFAULT_COMPACTION_TRIGGER: usize = 25;
/// Default scheduler tick interval.
const DEFAULT_SCHEDULER_TICK_SECS: u64 = 10;
/// Default per-queue worker concurrency.
const DEFAULT_QUEUE_CONCURRENCY: usize = 4;
/// Default base backoff for queue retries.
const DEFAULT_QUEUE_BACKOFF_MS: u64 = 500;
/// Default supervisor health poll interval.
const DEFAULT_HEALTH_POLL_SECS: u64 = 5;
/// Default supervisor health poll timeout.
const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 2;
/// Default orphan-vector sweep interval.
const DEFAULT_ORPHAN_SWEEP_SECS: u64 = 3600;

/// Row-store and vector-store configuration (spec 6, environment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Base URL of the vector-store HTTP endpoint. `None` uses the
    /// in-process fallback index.
    #[serde(default)]
    pub vector_endpoint: Option<String>,
    /// Vector-store collection name.
    #[serde(default = "default_vector_collection")]
    pub vector_collection: String,
    /// Embedding dimension the collection is configured for.
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

fn default_vector_collection() -> String {
    DEFAULT_VECTOR_COLLECTION.to_owned()
}

fn default_embedding_dimension() -> usize {
    DEFAULT_EMBEDDING_DIMENSION
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            vector_endpoint: None,
            vector_collection: default_vector_collection(),
            embedding_dimension: default_embedding_dimension(),
        }
    }
}

/// Language-model and embedding-model facade configuration (collaborator,
/// spec 1 Non-goals — only the endpoint shape is owned here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the language-model HTTP facade.
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    /// Model name to request.
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Base URL of the embedding HTTP facade.
    #[serde(default = "default_embedding_endpoint")]
    pub embedding_endpoint: String,
    /// Embedding model name to request.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

fn default_llm_endpoint() -> String {
    "http://localhost:11434".to_owned()
}

fn default_llm_model() -> String {
    "llama3".to_owned()
}

fn default_embedding_endpoint() -> String {
    "http://localhost:11434".to_owned()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_owned()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
            embedding_endpoint: default_embedding_endpoint(),
            embedding_model: default_embedding_model(),
        }
    }
}

/// Memory and context tuning constants (spec 4.6, 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryTuningConfig {
    /// Number of recent messages to include in planner context.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Number of memories to include in planner context.
    #[serde(default = "default_recall_limit")]
    pub recall_limit: usize,
    /// Message count in a conversation window that triggers compaction.
    #[serde(default = "default_compaction_trigger")]
    pub compaction_trigger: usize,
    /// Interval between orphan-vector repair sweeps.
    #[serde(default = "default_orphan_sweep_secs")]
    pub orphan_sweep_secs: u64,
}

fn default_history_window() -> usize {
    DEFAULT_HISTORY_WINDOW
}

fn default_recall_limit() -> usize {
    DEFAULT_RECALL_LIMIT
}

fn default_compaction_trigger() -> usize {
    DEFAULT_COMPACTION_TRIGGER
}

fn default_orphan_sweep_secs() -> u64 {
    DEFAULT_ORPHAN_SWEEP_SECS
}

impl Default for MemoryTuningConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            recall_limit: default_recall_limit(),
            compaction_trigger: default_compaction_trigger(),
            orphan_sweep_secs: default_orphan_sweep_secs(),
        }
    }
}

/// Work-queue and scheduler tuning constants (spec 4.2, 4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeTuningConfig {
    /// Scheduler due-task poll interval, seconds.
    #[serde(default = "default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,
    /// Default per-queue worker concurrency.
    #[serde(default = "default_queue_concurrency")]
    pub queue_concurrency: usize,
    /// Base backoff before the first retry, milliseconds.
    #[serde(default = "default_queue_backoff_ms")]
    pub queue_backoff_ms: u64,
    /// Supervisor health poll interval, seconds.
    #[serde(default = "default_health_poll_secs")]
    pub health_poll_secs: u64,
    /// Supervisor health poll timeout, seconds.
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
}

fn default_scheduler_tick_secs() -> u64 {
    DEFAULT_SCHEDULER_TICK_SECS
}

fn default_queue_concurrency() -> usize {
    DEFAULT_QUEUE_CONCURRENCY
}

fn default_queue_backoff_ms() -> u64 {
    DEFAULT_QUEUE_BACKOFF_MS
}

fn default_health_poll_secs() -> u64 {
    DEFAULT_HEALTH_POLL_SECS
}

fn default_health_timeout_secs() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_SECS
}

impl Default for RuntimeTuningConfig {
    fn default() -> Self {
        Self {
            scheduler_tick_secs: default_scheduler_tick_secs(),
            queue_concurrency: default_queue_concurrency(),
            queue_backoff_ms: default_queue_backoff_ms(),
            health_poll_secs: default_health_poll_secs(),
            health_timeout_secs: default_health_timeout_secs(),
        }
    }
}

/// Full runtime configuration (ambient stack, SPEC_FULL 10).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Row-store and vector-store configuration.
    #[serde(default)]
    pub store: StoreConfig,
    /// Language-model and embedding-model facade configuration.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Memory and context tuning constants.
    #[serde(default)]
    pub memory: MemoryTuningConfig,
    /// Queue and scheduler tuning constants.
    #[serde(default)]
    pub tuning: RuntimeTuningConfig,
    /// Directory for rolling log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"info"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Path to a JSON file listing external MCP tool sets to connect on boot.
    #[serde(default)]
    pub toolbox_config_path: Option<PathBuf>,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl RuntimeConfig {
    /// Load configuration with precedence env > file > defaults.
    ///
    /// The file path is `$RUNTIME_CONFIG_PATH` if set, else `./config.toml`
    /// if it exists; a missing file is not an error, it just means all
    /// values come from defaults and env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a present config file cannot be parsed, or if
    /// a `RUNTIME_*` env override cannot be parsed into its target type.
    pub fn load() -> Result<Self> {
        let mut config = Self::from_file()?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn from_file() -> Result<Self> {
        let path = env::var("RUNTIME_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./config.toml"));

        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = env::var("RUNTIME_DB_PATH") {
            self.store.db_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("RUNTIME_VECTOR_ENDPOINT") {
            self.store.vector_endpoint = Some(v);
        }
        if let Ok(v) = env::var("RUNTIME_VECTOR_COLLECTION") {
            self.store.vector_collection = v;
        }
        if let Ok(v) = env::var("RUNTIME_EMBEDDING_DIMENSION") {
            self.store.embedding_dimension =
                v.parse().context("RUNTIME_EMBEDDING_DIMENSION must be an integer")?;
        }
        if let Ok(v) = env::var("RUNTIME_LLM_ENDPOINT") {
            self.llm.endpoint = v;
        }
        if let Ok(v) = env::var("RUNTIME_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = env::var("RUNTIME_EMBEDDING_ENDPOINT") {
            self.llm.embedding_endpoint = v;
        }
        if let Ok(v) = env::var("RUNTIME_EMBEDDING_MODEL") {
            self.llm.embedding_model = v;
        }
        if let Ok(v) = env::var("RUNTIME_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("RUNTIME_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = env::var("RUNTIME_TOOLBOX_CONFIG_PATH") {
            self.toolbox_config_path = Some(PathBuf::from(v));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_fallbacks() {
        let config = RuntimeConfig::default();
        assert_eq!(config.memory.history_window, DEFAULT_HISTORY_WINDOW);
        assert_eq!(config.tuning.scheduler_tick_secs, DEFAULT_SCHEDULER_TICK_SECS);
        assert!(config.store.vector_endpoint.is_none());
    }

    #[test]
    fn parses_toml_fragment() {
        let toml_src = r#"
            [store]
            db_path = "/tmp/x.sqlite3"
            vector_endpoint = "http://localhost:6333"
        "#;
        let config: RuntimeConfig = toml::from_str(toml_src).expect("parse");
        assert_eq!(config.store.db_path, PathBuf::from("/tmp/x.sqlite3"));
        assert_eq!(
            config.store.vector_endpoint.as_deref(),
            Some("http://localhost:6333")
        );
        assert_eq!(config.memory.history_window, DEFAULT_HISTORY_WINDOW);
    }
}

//! Memory engine: dual-store (row + vector) semantic memory (spec 4.5).
//!
//! Writes funnel through a single-writer background task — the same
//! shape as the donor codebase's `memory::writer` actor — so the
//! row-store transaction and its paired vector-store call are never
//! interleaved across concurrent callers. `add`/`update`/`delete` each
//! send one message and await its reply.

pub mod vector;

use std::sync::Arc;

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::errors::ErrorKind;
use crate::llm::{Embedder, FacadeError};
use crate::types::{new_id, Memory, MemoryKind, SourceReference};
use vector::{VectorError, VectorFilter, VectorIndex, VectorPayload};

/// Errors the memory engine can produce (spec 7).
#[derive(Debug, Error)]
pub enum MemoryError {
    /// No memory exists with this id.
    #[error("memory not found: {0}")]
    NotFound(String),
    /// The embedder or vector store failed.
    #[error("vector operation failed: {0}")]
    Vector(#[from] VectorError),
    /// The embedding facade failed.
    #[error("embedding facade failed: {0}")]
    Embedding(#[from] FacadeError),
    /// A database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// JSON (de)serialization of a stored field failed.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The writer task is no longer accepting requests.
    #[error("memory writer is shut down")]
    WriterShutDown,
}

impl MemoryError {
    /// Classify this error per spec 7's abstract kinds.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Vector(e) => e.kind(),
            Self::Embedding(e) => e.kind(),
            Self::Database(_) => ErrorKind::Transient,
            Self::Serialize(_) => ErrorKind::Permanent,
            Self::WriterShutDown => ErrorKind::Internal,
        }
    }
}

/// Fields for creating a memory (spec 4.5: `add(write)`).
#[derive(Debug, Clone)]
pub struct NewMemory {
    /// Owning user.
    pub user_id: String,
    /// Kind of memory.
    pub kind: MemoryKind,
    /// Short title.
    pub title: String,
    /// Body text.
    pub content: String,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Conversation this memory was derived from, if any.
    pub conversation_id: Option<String>,
    /// Back-references to what this memory was built from.
    pub source_references: Vec<SourceReference>,
    /// Whether this is the output of compaction.
    pub is_compaktified: bool,
    /// Ids of the memories this one was compacted from.
    pub compaktified_from: Vec<String>,
}

/// Partial update to an existing memory (spec 4.5: `update(id, patch)`).
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    /// New title, if changing.
    pub title: Option<String>,
    /// New content, if changing.
    pub content: Option<String>,
    /// New tags, if changing.
    pub tags: Option<Vec<String>>,
}

/// Filters for `list` (spec 4.5).
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Restrict to this user.
    pub user_id: String,
    /// Restrict to these kinds, empty means all.
    pub kinds: Vec<MemoryKind>,
    /// Restrict to memories with any of these tags, empty means all.
    pub tags: Vec<String>,
    /// Restrict to this conversation.
    pub conversation_id: Option<String>,
    /// Restrict by compaction status.
    pub is_compaktified: Option<bool>,
    /// Max rows to return.
    pub limit: i64,
    /// Rows to skip.
    pub offset: i64,
}

/// Parameters for `search` (spec 4.5).
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Free-text query to embed.
    pub query: String,
    /// Restrict to this user.
    pub user_id: String,
    /// Restrict to these kinds; only the first is used as a vector filter
    /// (spec 4.5), the rest narrow the row fetch.
    pub kinds: Vec<MemoryKind>,
    /// Restrict to memories with any of these tags.
    pub tags: Vec<String>,
    /// Max results.
    pub limit: usize,
}

enum WriteOp {
    Insert { write: NewMemory, reply: oneshot::Sender<Result<Memory, MemoryError>> },
    Update { id: String, patch: MemoryPatch, reply: oneshot::Sender<Result<Memory, MemoryError>> },
    Delete { id: String, reply: oneshot::Sender<Result<(), MemoryError>> },
}

/// Dual-store memory engine (spec 4.5).
pub struct MemoryEngine {
    db: SqlitePool,
    vector: Arc<dyn VectorIndex>,
    writer_tx: mpsc::Sender<WriteOp>,
    _writer_handle: JoinHandle<()>,
}

impl MemoryEngine {
    /// Build the engine and spawn its single-writer background task.
    #[must_use]
    pub fn new(db: SqlitePool, vector: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let writer_db = db.clone();
        let writer_vector = Arc::clone(&vector);
        let handle = tokio::spawn(run_writer(writer_db, writer_vector, embedder, rx));
        Self { db, vector, writer_tx: tx, _writer_handle: handle }
    }

    /// Create a memory: row insert + vector upsert, coherent via the
    /// single-writer task (spec 4.5: `add`).
    ///
    /// # Errors
    ///
    /// Returns an error if the writer is shut down or the underlying
    /// operation fails.
    pub async fn add(&self, write: NewMemory) -> Result<Memory, MemoryError> {
        let (reply, rx) = oneshot::channel();
        self.writer_tx
            .send(WriteOp::Insert { write, reply })
            .await
            .map_err(|_| MemoryError::WriterShutDown)?;
        rx.await.map_err(|_| MemoryError::WriterShutDown)?
    }

    /// Patch a memory; recomputes the embedding only if `title` or
    /// `content` changed (spec 4.5: `update`).
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::NotFound`] if `id` doesn't exist, or an
    /// error from the underlying operation.
    pub async fn update(&self, id: &str, patch: MemoryPatch) -> Result<Memory, MemoryError> {
        let (reply, rx) = oneshot::channel();
        self.writer_tx
            .send(WriteOp::Update { id: id.to_owned(), patch, reply })
            .await
            .map_err(|_| MemoryError::WriterShutDown)?;
        rx.await.map_err(|_| MemoryError::WriterShutDown)?
    }

    /// Delete a memory: vector point first, then row (spec 4.5: `delete`).
    ///
    /// # Errors
    ///
    /// Returns an error if the vector delete fails (row is left intact)
    /// or the row delete fails after the vector point is already gone.
    pub async fn delete(&self, id: &str) -> Result<(), MemoryError> {
        let (reply, rx) = oneshot::channel();
        self.writer_tx
            .send(WriteOp::Delete { id: id.to_owned(), reply })
            .await
            .map_err(|_| MemoryError::WriterShutDown)?;
        rx.await.map_err(|_| MemoryError::WriterShutDown)?
    }

    /// Fetch a memory by id.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::NotFound`] if no row matches.
    pub async fn find_by_id(&self, id: &str) -> Result<Memory, MemoryError> {
        let row = sqlx::query(MEMORY_COLUMNS_SELECT_BY_ID)
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| MemoryError::NotFound(id.to_owned()))?;
        row_to_memory(&row)
    }

    /// List memories by row-store filters, newest first (spec 4.5: `list`).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn list(&self, q: ListQuery) -> Result<Vec<Memory>, MemoryError> {
        let mut sql = String::from(
            "SELECT id, user_id, kind, title, content, tags_json, conversation_id, source_references_json, is_compaktified, compaktified_from_json, created_at, updated_at
             FROM memories WHERE user_id = ?",
        );
        if !q.kinds.is_empty() {
            let placeholders = q.kinds.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            sql.push_str(&format!(" AND kind IN ({placeholders})"));
        }
        if let Some(conv) = &q.conversation_id {
            let _ = conv;
            sql.push_str(" AND conversation_id = ?");
        }
        if let Some(flag) = q.is_compaktified {
            let _ = flag;
            sql.push_str(" AND is_compaktified = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql).bind(&q.user_id);
        for kind in &q.kinds {
            query = query.bind(kind.as_str());
        }
        if let Some(conv) = &q.conversation_id {
            query = query.bind(conv);
        }
        if let Some(flag) = q.is_compaktified {
            query = query.bind(flag);
        }
        query = query.bind(q.limit).bind(q.offset);

        let rows = query.fetch_all(&self.db).await?;
        let memories: Result<Vec<Memory>, MemoryError> = rows.iter().map(row_to_memory).collect();
        let memories = memories?;

        if q.tags.is_empty() {
            Ok(memories)
        } else {
            Ok(memories.into_iter().filter(|m| m.tags.iter().any(|t| q.tags.contains(t))).collect())
        }
    }

    /// Embed `query` and run a filtered vector top-k, falling back to
    /// `list` if the search fails or returns empty (spec 4.5: `search`).
    ///
    /// # Errors
    ///
    /// Returns an error only if both the vector search and the row-store
    /// fallback fail.
    pub async fn search(&self, q: SearchQuery, embedder: &dyn Embedder) -> Result<Vec<Memory>, MemoryError> {
        let embedding = match embedder.embed(&q.query).await {
            Ok(e) => e,
            Err(_) => return self.search_fallback(&q).await,
        };
        match self.search_similar(&embedding, &q).await {
            Ok(hits) if !hits.is_empty() => Ok(hits),
            _ => self.search_fallback(&q).await,
        }
    }

    /// As `search`, but takes a precomputed embedding (spec 4.5:
    /// `searchSimilar`).
    ///
    /// # Errors
    ///
    /// Returns an error if the vector search or row fetch fails.
    pub async fn search_similar(&self, embedding: &[f32], q: &SearchQuery) -> Result<Vec<Memory>, MemoryError> {
        let filter = VectorFilter {
            user_id: Some(q.user_id.clone()),
            kind: q.kinds.first().map(|k| k.as_str().to_owned()),
            tags: q.tags.clone(),
        };
        let hits = self.vector.search(embedding, filter, q.limit).await?;

        let mut ordered = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Ok(memory) = self.find_by_id(&hit.id).await {
                ordered.push(memory);
            }
        }
        Ok(ordered)
    }

    async fn search_fallback(&self, q: &SearchQuery) -> Result<Vec<Memory>, MemoryError> {
        self.list(ListQuery {
            user_id: q.user_id.clone(),
            kinds: q.kinds.clone(),
            tags: q.tags.clone(),
            conversation_id: None,
            is_compaktified: None,
            limit: i64::try_from(q.limit).unwrap_or(i64::MAX),
            offset: 0,
        })
        .await
    }

    /// Delete any vector point whose row no longer exists (spec 4.5:
    /// periodic orphan-vector repair sweep).
    ///
    /// # Errors
    ///
    /// Returns an error if listing vector ids or the row lookup fails.
    pub async fn repair_orphan_vectors(&self) -> Result<u64, MemoryError> {
        let ids = self.vector.list_ids().await?;
        let mut removed = 0u64;
        for id in ids {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM memories WHERE id = ?").bind(&id).fetch_optional(&self.db).await?;
            if exists.is_none() {
                self.vector.delete(&id).await?;
                removed += 1;
                tracing::warn!(memory_id = %id, "removed orphan vector point with no backing row");
            }
        }
        Ok(removed)
    }
}

const MEMORY_COLUMNS_SELECT_BY_ID: &str = "SELECT id, user_id, kind, title, content, tags_json, conversation_id, source_references_json, is_compaktified, compaktified_from_json, created_at, updated_at FROM memories WHERE id = ?";

async fn run_writer(db: SqlitePool, vector: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>, mut rx: mpsc::Receiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Insert { write, reply } => {
                let result = handle_insert(&db, vector.as_ref(), embedder.as_ref(), write).await;
                let _ = reply.send(result);
            }
            WriteOp::Update { id, patch, reply } => {
                let result = handle_update(&db, vector.as_ref(), embedder.as_ref(), &id, patch).await;
                let _ = reply.send(result);
            }
            WriteOp::Delete { id, reply } => {
                let result = handle_delete(&db, vector.as_ref(), &id).await;
                let _ = reply.send(result);
            }
        }
    }
}

async fn handle_insert(
    db: &SqlitePool,
    vector: &dyn VectorIndex,
    embedder: &dyn Embedder,
    write: NewMemory,
) -> Result<Memory, MemoryError> {
    let id = new_id("mem");
    let now = Utc::now();
    let embedding_text = format!("{}\n{}", write.title, write.content);
    let embedding = embedder.embed(&embedding_text).await?;

    let mut tx = db.begin().await?;
    sqlx::query(
        "INSERT INTO memories (id, user_id, kind, title, content, tags_json, conversation_id, source_references_json, is_compaktified, compaktified_from_json, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&write.user_id)
    .bind(write.kind.as_str())
    .bind(&write.title)
    .bind(&write.content)
    .bind(serde_json::to_string(&write.tags)?)
    .bind(&write.conversation_id)
    .bind(serde_json::to_string(&write.source_references)?)
    .bind(write.is_compaktified)
    .bind(serde_json::to_string(&write.compaktified_from)?)
    .bind(now.to_rfc3339())
    .bind(now.to_rfc3339())
    .execute(&mut *tx)
    .await?;

    let payload = VectorPayload { user_id: write.user_id.clone(), kind: write.kind.as_str().to_owned(), tags: write.tags.clone() };
    if let Err(err) = vector.upsert(&id, embedding.clone(), payload).await {
        tx.rollback().await.ok();
        return Err(err.into());
    }

    sqlx::query("INSERT INTO embeddings (memory_id, model, vector_point_id, dimension) VALUES (?, 'default', ?, ?)")
        .bind(&id)
        .bind(&id)
        .bind(i64::try_from(embedding.len()).unwrap_or(0))
        .execute(&mut *tx)
        .await?;

    if let Err(err) = tx.commit().await {
        // Compensate: the vector point must not outlive its row (spec 4.5).
        let _ = vector.delete(&id).await;
        return Err(err.into());
    }

    Ok(Memory {
        id,
        user_id: write.user_id,
        kind: write.kind,
        title: write.title,
        content: write.content,
        tags: write.tags,
        conversation_id: write.conversation_id,
        source_references: write.source_references,
        is_compaktified: write.is_compaktified,
        compaktified_from: write.compaktified_from,
        created_at: now,
        updated_at: now,
        embedding: Some(embedding),
    })
}

async fn handle_update(
    db: &SqlitePool,
    vector: &dyn VectorIndex,
    embedder: &dyn Embedder,
    id: &str,
    patch: MemoryPatch,
) -> Result<Memory, MemoryError> {
    let row = sqlx::query(MEMORY_COLUMNS_SELECT_BY_ID)
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| MemoryError::NotFound(id.to_owned()))?;
    let mut memory = row_to_memory(&row)?;

    let content_changed = patch.title.is_some() || patch.content.is_some();
    if let Some(title) = patch.title {
        memory.title = title;
    }
    if let Some(content) = patch.content {
        memory.content = content;
    }
    if let Some(tags) = patch.tags {
        memory.tags = tags;
    }
    memory.updated_at = Utc::now();

    let new_embedding = if content_changed {
        Some(embedder.embed(&format!("{}\n{}", memory.title, memory.content)).await?)
    } else {
        None
    };

    let mut tx = db.begin().await?;
    sqlx::query(
        "UPDATE memories SET title = ?, content = ?, tags_json = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&memory.title)
    .bind(&memory.content)
    .bind(serde_json::to_string(&memory.tags)?)
    .bind(memory.updated_at.to_rfc3339())
    .bind(id)
    .execute(&mut *tx)
    .await?;

    if let Some(embedding) = &new_embedding {
        let payload = VectorPayload { user_id: memory.user_id.clone(), kind: memory.kind.as_str().to_owned(), tags: memory.tags.clone() };
        if let Err(err) = vector.upsert(id, embedding.clone(), payload).await {
            tx.rollback().await.ok();
            return Err(err.into());
        }
    }

    if let Err(err) = tx.commit().await {
        if new_embedding.is_some() {
            let _ = vector.delete(id).await;
        }
        return Err(err.into());
    }

    memory.embedding = new_embedding;
    Ok(memory)
}

async fn handle_delete(db: &SqlitePool, vector: &dyn VectorIndex, id: &str) -> Result<(), MemoryError> {
    vector.delete(id).await?;

    let result = match sqlx::query("DELETE FROM memories WHERE id = ?").bind(id).execute(db).await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(memory_id = %id, error = %err, "failed to delete memory row");
            return Err(err.into());
        }
    };
    if result.rows_affected() == 0 {
        tracing::warn!(memory_id = %id, "vector point deleted but no matching row existed");
    }
    sqlx::query("DELETE FROM embeddings WHERE memory_id = ?").bind(id).execute(db).await.ok();

    Ok(())
}

fn row_to_memory(row: &sqlx::sqlite::SqliteRow) -> Result<Memory, MemoryError> {
    let kind_str: String = row.try_get("kind")?;
    let kind: MemoryKind = kind_str
        .parse()
        .map_err(|_| MemoryError::Database(sqlx::Error::Decode(format!("invalid memory kind: {kind_str}").into())))?;

    let tags_json: String = row.try_get("tags_json")?;
    let source_refs_json: String = row.try_get("source_references_json")?;
    let compaktified_from_json: String = row.try_get("compaktified_from_json")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Memory {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        tags: serde_json::from_str(&tags_json)?,
        conversation_id: row.try_get("conversation_id")?,
        source_references: serde_json::from_str(&source_refs_json)?,
        is_compaktified: row.try_get("is_compaktified")?,
        compaktified_from: serde_json::from_str(&compaktified_from_json)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| MemoryError::Database(sqlx::Error::Decode(Box::new(e))))?
            .with_timezone(&Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| MemoryError::Database(sqlx::Error::Decode(Box::new(e))))?
            .with_timezone(&Utc),
        embedding: None,
    })
}

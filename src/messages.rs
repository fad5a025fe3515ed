//! Message store: the append-only conversation log (spec 3, 6).
//!
//! Messages are never mutated or reordered after insertion; `created_at`
//! is the ordering key within a conversation, enforced strictly
//! ascending by construction (each insert stamps "now").

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::errors::ErrorKind;
use crate::types::{new_id, Message, Role};

/// Errors the message store can produce (spec 7).
#[derive(Debug, Error)]
pub enum MessageError {
    /// No conversation exists with this id.
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    /// A message with this id already exists.
    #[error("message already exists: {0}")]
    DuplicateId(String),
    /// A database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// JSON (de)serialization of a stored field failed.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl MessageError {
    /// Classify this error per spec 7's abstract kinds.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConversationNotFound(_) => ErrorKind::NotFound,
            Self::DuplicateId(_) => ErrorKind::Conflict,
            Self::Database(_) => ErrorKind::Transient,
            Self::Serialize(_) => ErrorKind::Permanent,
        }
    }
}

/// Fields for appending a message (spec 3: `append`).
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Conversation this message belongs to; created if it doesn't exist.
    pub conversation_id: String,
    /// Owning user.
    pub user_id: String,
    /// Who produced the content.
    pub role: Role,
    /// Message body.
    pub content: String,
    /// Free-form adapter/tool metadata.
    pub metadata: Option<serde_json::Value>,
    /// Caller-supplied id, for adapters replaying a message they've already
    /// minted an id for (e.g. retrying a delivery). `append` rejects a
    /// duplicate with [`MessageError::DuplicateId`] rather than silently
    /// inserting a second copy. Left `None`, `append` mints a fresh id
    /// itself, as it always did.
    pub id: Option<String>,
}

/// A window of recent messages for a conversation (spec 4.6: `BUILD_CONTEXT`).
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Conversation to read.
    pub conversation_id: String,
    /// Max messages to return, newest-first before being reversed into
    /// chronological order.
    pub limit: i64,
}

/// Append-only store of conversations and their messages (spec 3, 6).
pub struct MessageStore {
    db: SqlitePool,
}

impl MessageStore {
    /// Wrap an already-migrated pool.
    #[must_use]
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Append a message, creating its conversation on first use (spec 3).
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails, or [`MessageError::DuplicateId`]
    /// if `new.id` is `Some` and already names an existing message.
    pub async fn append(&self, new: NewMessage) -> Result<Message, MessageError> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        if let Some(id) = &new.id {
            let existing: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM messages WHERE id = ?").bind(id).fetch_optional(&mut *tx).await?;
            if existing.is_some() {
                return Err(MessageError::DuplicateId(id.clone()));
            }
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM conversations WHERE id = ?")
            .bind(&new.conversation_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            sqlx::query(
                "INSERT INTO conversations (id, user_id, title, created_at, updated_at, metadata_json) VALUES (?, ?, NULL, ?, ?, NULL)",
            )
            .bind(&new.conversation_id)
            .bind(&new.user_id)
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
                .bind(now.to_rfc3339())
                .bind(&new.conversation_id)
                .execute(&mut *tx)
                .await?;
        }

        let id = new.id.clone().unwrap_or_else(|| new_id("msg"));
        let metadata_json = match &new.metadata {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, user_id, role, content, created_at, metadata_json) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.conversation_id)
        .bind(&new.user_id)
        .bind(new.role.as_str())
        .bind(&new.content)
        .bind(now.to_rfc3339())
        .bind(&metadata_json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Message {
            id,
            conversation_id: new.conversation_id,
            user_id: new.user_id,
            role: new.role,
            content: new.content,
            created_at: now,
            metadata: new.metadata,
        })
    }

    /// Read the most recent `limit` messages of a conversation, returned
    /// in chronological (ascending) order (spec 4.6: `BUILD_CONTEXT`).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn history(&self, q: HistoryQuery) -> Result<Vec<Message>, MessageError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, user_id, role, content, created_at, metadata_json
             FROM messages WHERE conversation_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(&q.conversation_id)
        .bind(q.limit)
        .fetch_all(&self.db)
        .await?;

        let mut messages: Vec<Message> = rows.iter().map(row_to_message).collect::<Result<_, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Fetch a single message by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is malformed.
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Message>, MessageError> {
        let row = sqlx::query(
            "SELECT id, conversation_id, user_id, role, content, created_at, metadata_json FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(row_to_message).transpose()
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, MessageError> {
    let role_str: String = row.try_get("role")?;
    let role: Role = role_str
        .parse()
        .map_err(|_| MessageError::Database(sqlx::Error::Decode(format!("invalid role: {role_str}").into())))?;
    let created_at: String = row.try_get("created_at")?;
    let metadata_json: Option<String> = row.try_get("metadata_json")?;

    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        user_id: row.try_get("user_id")?,
        role,
        content: row.try_get("content")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| MessageError::Database(sqlx::Error::Decode(Box::new(e))))?
            .with_timezone(&Utc),
        metadata: metadata_json.map(|j| serde_json::from_str(&j)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> MessageStore {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = crate::db::open(&dir.path().join("messages.sqlite3")).await.expect("open");
        MessageStore::new(db)
    }

    #[tokio::test]
    async fn append_creates_conversation_on_first_message() {
        let store = test_store().await;
        let message = store
            .append(NewMessage {
                conversation_id: "conv-1".into(),
                user_id: "u1".into(),
                role: Role::User,
                content: "hello".into(),
                metadata: None,
                id: None,
            })
            .await
            .expect("append");
        assert_eq!(message.conversation_id, "conv-1");
    }

    #[tokio::test]
    async fn append_with_caller_supplied_id_keeps_it() {
        let store = test_store().await;
        let message = store
            .append(NewMessage {
                conversation_id: "conv-1".into(),
                user_id: "u1".into(),
                role: Role::User,
                content: "hello".into(),
                metadata: None,
                id: Some("msg-fixed".into()),
            })
            .await
            .expect("append");
        assert_eq!(message.id, "msg-fixed");
    }

    #[tokio::test]
    async fn append_rejects_a_duplicate_caller_supplied_id() {
        let store = test_store().await;
        store
            .append(NewMessage {
                conversation_id: "conv-1".into(),
                user_id: "u1".into(),
                role: Role::User,
                content: "hello".into(),
                metadata: None,
                id: Some("msg-fixed".into()),
            })
            .await
            .expect("first append");

        let err = store
            .append(NewMessage {
                conversation_id: "conv-1".into(),
                user_id: "u1".into(),
                role: Role::User,
                content: "hello again".into(),
                metadata: None,
                id: Some("msg-fixed".into()),
            })
            .await
            .expect_err("duplicate id should be rejected");
        assert!(matches!(err, MessageError::DuplicateId(id) if id == "msg-fixed"));

        let history = store
            .history(HistoryQuery { conversation_id: "conv-1".into(), limit: 10 })
            .await
            .expect("history");
        assert_eq!(history.len(), 1, "rejected duplicate must not be inserted");
    }

    #[tokio::test]
    async fn history_returns_chronological_order() {
        let store = test_store().await;
        for content in ["first", "second", "third"] {
            store
                .append(NewMessage {
                    conversation_id: "conv-1".into(),
                    user_id: "u1".into(),
                    role: Role::User,
                    content: content.into(),
                    metadata: None,
                    id: None,
                })
                .await
                .expect("append");
        }

        let history = store
            .history(HistoryQuery { conversation_id: "conv-1".into(), limit: 10 })
            .await
            .expect("history");
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn history_respects_limit_keeping_most_recent() {
        let store = test_store().await;
        for content in ["a", "b", "c"] {
            store
                .append(NewMessage {
                    conversation_id: "conv-1".into(),
                    user_id: "u1".into(),
                    role: Role::User,
                    content: content.into(),
                    metadata: None,
                    id: None,
                })
                .await
                .expect("append");
        }

        let history = store
            .history(HistoryQuery { conversation_id: "conv-1".into(), limit: 2 })
            .await
            .expect("history");
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["b", "c"]);
    }
}

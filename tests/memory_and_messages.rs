//! Exercises the message store and memory engine together against a real
//! migrated database, the way the planner drives them in a turn.

use std::sync::Arc;

use async_trait::async_trait;
use fabricd::llm::{Embedder, FacadeError};
use fabricd::memory::vector::InMemoryVectorIndex;
use fabricd::memory::{ListQuery, MemoryEngine, NewMemory, SearchQuery};
use fabricd::messages::{HistoryQuery, MessageStore, NewMessage};
use fabricd::types::{MemoryKind, Role};

struct ConstantEmbedder(Vec<f32>);

#[async_trait]
impl Embedder for ConstantEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, FacadeError> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn messages_and_memories_survive_a_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = fabricd::db::open(&dir.path().join("memory.sqlite3")).await.expect("open db");

    let messages = MessageStore::new(db.clone());
    let user = messages
        .append(NewMessage { conversation_id: "conv-1".to_owned(), user_id: "user-1".to_owned(), role: Role::User, content: "my favorite color is teal".to_owned(), metadata: None, id: None })
        .await
        .expect("append user message");

    let history = messages.history(HistoryQuery { conversation_id: "conv-1".to_owned(), limit: 10 }).await.expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, user.id);

    let vector = Arc::new(InMemoryVectorIndex::new(3));
    let embedder = Arc::new(ConstantEmbedder(vec![1.0, 0.0, 0.0]));
    let memory = MemoryEngine::new(db, vector, Arc::clone(&embedder) as Arc<dyn Embedder>);

    let stored = memory
        .add(NewMemory {
            user_id: "user-1".to_owned(),
            kind: MemoryKind::Preference,
            title: "favorite color".to_owned(),
            content: "teal".to_owned(),
            tags: vec!["preferences".to_owned()],
            conversation_id: Some("conv-1".to_owned()),
            source_references: vec![],
            is_compaktified: false,
            compaktified_from: vec![],
        })
        .await
        .expect("add memory");

    let found = memory
        .search(SearchQuery { query: "what color do I like".to_owned(), user_id: "user-1".to_owned(), kinds: vec![], tags: vec![], limit: 5 }, embedder.as_ref())
        .await
        .expect("search");
    assert!(found.iter().any(|m| m.id == stored.id));

    let listed = memory
        .list(ListQuery { user_id: "user-1".to_owned(), limit: 10, ..ListQuery::default() })
        .await
        .expect("list");
    assert_eq!(listed.len(), 1);

    memory.delete(&stored.id).await.expect("delete memory");
    assert!(memory.find_by_id(&stored.id).await.is_err());
}

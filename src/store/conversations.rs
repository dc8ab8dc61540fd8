//! Conversations and their append-only messages

use super::{format_ts, parse_ts, Store};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use utoipa::ToSchema;
use uuid::Uuid;

/// A chat conversation owned by one user within one tenant
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub archived: bool,
}

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub reasoning: Option<Value>,
    pub sources: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Derive a conversation title from the first user message
pub fn derive_title(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or("").trim();
    first_line.chars().take(80).collect()
}

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation> {
    let id: String = row.get("id");
    let created_at: String = row.get("created_at");
    let last_message_at: String = row.get("last_message_at");
    Ok(Conversation {
        id: Uuid::parse_str(&id).map_err(|e| CoreError::Database(sqlx::Error::Decode(e.into())))?,
        tenant: row.get("tenant"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        created_at: parse_ts(&created_at),
        last_message_at: parse_ts(&last_message_at),
        archived: row.get::<i64, _>("archived") != 0,
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
    let id: String = row.get("id");
    let conversation_id: String = row.get("conversation_id");
    let role: String = row.get("role");
    let reasoning: Option<String> = row.get("reasoning");
    let sources: Option<String> = row.get("sources");
    let created_at: String = row.get("created_at");

    Ok(Message {
        id: Uuid::parse_str(&id).map_err(|e| CoreError::Database(sqlx::Error::Decode(e.into())))?,
        conversation_id: Uuid::parse_str(&conversation_id)
            .map_err(|e| CoreError::Database(sqlx::Error::Decode(e.into())))?,
        role: MessageRole::parse(&role)
            .ok_or_else(|| CoreError::Validation(format!("unknown role {}", role)))?,
        content: row.get("content"),
        reasoning: reasoning.and_then(|s| serde_json::from_str(&s).ok()),
        sources: sources.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_ts(&created_at),
    })
}

impl Store {
    /// Create a conversation; an empty title is filled in from the first
    /// user message later
    pub async fn create_conversation(
        &self,
        tenant: &str,
        user_id: &str,
        title: Option<String>,
    ) -> Result<Conversation> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let title = title.unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO conversations
                (id, tenant, user_id, title, created_at, last_message_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
        )
        .bind(id.to_string())
        .bind(tenant)
        .bind(user_id)
        .bind(&title)
        .bind(format_ts(now))
        .execute(self.pool())
        .await?;

        Ok(Conversation {
            id,
            tenant: tenant.to_string(),
            user_id: user_id.to_string(),
            title,
            created_at: now,
            last_message_at: now,
            archived: false,
        })
    }

    /// A user's conversations, most recently active first
    pub async fn list_conversations(
        &self,
        tenant: &str,
        user_id: &str,
    ) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE tenant = ?1 AND user_id = ?2
             ORDER BY last_message_at DESC",
        )
        .bind(tenant)
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_conversation).collect()
    }

    /// Fetch one conversation scoped to tenant and user
    pub async fn get_conversation(
        &self,
        tenant: &str,
        user_id: &str,
        id: Uuid,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT * FROM conversations WHERE id = ?1 AND tenant = ?2 AND user_id = ?3",
        )
        .bind(id.to_string())
        .bind(tenant)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(row_to_conversation).transpose()
    }

    /// Append a message, bump `last_message_at`, and auto-title the
    /// conversation on its first user message
    pub async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        reasoning: Option<&Value>,
        sources: Option<&Value>,
    ) -> Result<Message> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, role, content, reasoning, sources, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(id.to_string())
        .bind(conversation_id.to_string())
        .bind(role.as_str())
        .bind(content)
        .bind(reasoning.map(|v| v.to_string()))
        .bind(sources.map(|v| v.to_string()))
        .bind(format_ts(now))
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE conversations SET last_message_at = ?1 WHERE id = ?2")
            .bind(format_ts(now))
            .bind(conversation_id.to_string())
            .execute(&mut *tx)
            .await?;

        if role == MessageRole::User {
            sqlx::query(
                "UPDATE conversations SET title = ?1 WHERE id = ?2 AND title = ''",
            )
            .bind(derive_title(content))
            .bind(conversation_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(Message {
            id,
            conversation_id,
            role,
            content: content.to_string(),
            reasoning: reasoning.cloned(),
            sources: sources.cloned(),
            created_at: now,
        })
    }

    /// Messages oldest first; the append order is the total order
    pub async fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    /// Archive or unarchive; returns false when absent
    pub async fn set_conversation_archived(
        &self,
        tenant: &str,
        user_id: &str,
        id: Uuid,
        archived: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE conversations SET archived = ?1
             WHERE id = ?2 AND tenant = ?3 AND user_id = ?4",
        )
        .bind(archived as i64)
        .bind(id.to_string())
        .bind(tenant)
        .bind(user_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Conversation count for the status endpoint
    pub async fn conversation_count(&self, tenant: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM conversations WHERE tenant = ?1")
            .bind(tenant)
            .fetch_one(self.pool())
            .await?;
        Ok(row.get("n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    #[tokio::test]
    async fn test_auto_title_from_first_user_message() {
        let store = test_store().await;
        let conv = store.create_conversation("7", "u1", None).await.unwrap();

        store
            .append_message(
                conv.id,
                MessageRole::User,
                "What is our travel policy?\nSecond line ignored.",
                None,
                None,
            )
            .await
            .unwrap();

        let fetched = store
            .get_conversation("7", "u1", conv.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.title, "What is our travel policy?");

        // a later message does not overwrite the title
        store
            .append_message(conv.id, MessageRole::User, "Different question", None, None)
            .await
            .unwrap();
        let fetched = store
            .get_conversation("7", "u1", conv.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.title, "What is our travel policy?");
    }

    #[tokio::test]
    async fn test_title_truncated_to_80_chars() {
        let long = "x".repeat(200);
        assert_eq!(derive_title(&long).chars().count(), 80);
    }

    #[tokio::test]
    async fn test_explicit_title_is_kept() {
        let store = test_store().await;
        let conv = store
            .create_conversation("7", "u1", Some("Budget review".to_string()))
            .await
            .unwrap();
        store
            .append_message(conv.id, MessageRole::User, "hello", None, None)
            .await
            .unwrap();

        let fetched = store
            .get_conversation("7", "u1", conv.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.title, "Budget review");
    }

    #[tokio::test]
    async fn test_messages_ordered_and_listing_by_activity() {
        let store = test_store().await;
        let first = store.create_conversation("7", "u1", None).await.unwrap();
        let second = store.create_conversation("7", "u1", None).await.unwrap();

        store
            .append_message(first.id, MessageRole::User, "q1", None, None)
            .await
            .unwrap();
        store
            .append_message(first.id, MessageRole::Assistant, "a1", None, None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store
            .append_message(second.id, MessageRole::User, "q2", None, None)
            .await
            .unwrap();

        let messages = store.messages(first.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);

        let listed = store.list_conversations("7", "u1").await.unwrap();
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }

    #[tokio::test]
    async fn test_archive_round_trip() {
        let store = test_store().await;
        let conv = store.create_conversation("7", "u1", None).await.unwrap();

        assert!(store
            .set_conversation_archived("7", "u1", conv.id, true)
            .await
            .unwrap());
        let fetched = store
            .get_conversation("7", "u1", conv.id)
            .await
            .unwrap()
            .unwrap();
        assert!(fetched.archived);

        // scoped: another user cannot archive it
        assert!(!store
            .set_conversation_archived("7", "u2", conv.id, false)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sources_and_reasoning_round_trip() {
        let store = test_store().await;
        let conv = store.create_conversation("7", "u1", None).await.unwrap();

        let sources = serde_json::json!({"documents": [{"doc_id": "x", "score": 0.9}]});
        let reasoning = serde_json::json!([{"step": "planner", "detail": "documents"}]);
        store
            .append_message(
                conv.id,
                MessageRole::Assistant,
                "answer",
                Some(&reasoning),
                Some(&sources),
            )
            .await
            .unwrap();

        let messages = store.messages(conv.id).await.unwrap();
        assert_eq!(messages[0].sources.as_ref().unwrap()["documents"][0]["score"], 0.9);
        assert_eq!(messages[0].reasoning.as_ref().unwrap()[0]["step"], "planner");
    }
}

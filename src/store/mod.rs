//! Relational persistence for documents, chunks, classifications,
//! conversations, jobs, usage counters, and employee embeddings
//!
//! One [`Store`] wraps the SQLite pool; the entity-specific operations live
//! in the submodules as `impl Store` blocks. Every row carries exactly one
//! tenant and no query crosses tenants.

pub mod chunks;
pub mod classifications;
pub mod conversations;
pub mod documents;
pub mod employees;
pub mod jobs;
pub mod usage;

use crate::config::DatabaseConfig;
use crate::error::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::classifier::OrgContext;

/// Handle to the relational store; cheap to clone
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    /// Per-tenant organizational vocabulary, invalidated on classification
    /// writes; a missing entry is never an error
    org_context_cache: Arc<RwLock<HashMap<String, OrgContext>>>,
}

impl Store {
    /// Connect and create the schema if needed
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = normalize_sqlite_url(&config.url);

        // an in-memory database exists per connection, so the pool must not
        // open a second one
        let options = if url.contains(":memory:") {
            SqlitePoolOptions::new().max_connections(1)
        } else {
            SqlitePoolOptions::new()
        };

        let pool = options.connect(&url).await?;
        let store = Self {
            pool,
            org_context_cache: Arc::new(RwLock::new(HashMap::new())),
        };
        store.initialize().await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                filename TEXT NOT NULL,
                file_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                storage_key TEXT NOT NULL,
                uploader TEXT NOT NULL,
                uploaded_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                metadata TEXT NOT NULL DEFAULT '{}',
                is_deleted INTEGER NOT NULL DEFAULT 0,
                deleted_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_tenant
             ON documents(tenant, is_deleted, uploaded_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                embedding_key TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                UNIQUE(document_id, chunk_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS classifications (
                document_id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                team TEXT,
                project TEXT,
                doc_type TEXT NOT NULL,
                time_period TEXT,
                confidentiality TEXT NOT NULL,
                people TEXT NOT NULL DEFAULT '[]',
                tags TEXT NOT NULL DEFAULT '[]',
                summary TEXT NOT NULL DEFAULT '',
                confidence TEXT NOT NULL DEFAULT '{}',
                classified_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_classifications_team
             ON classifications(tenant, team)",
            "CREATE INDEX IF NOT EXISTS idx_classifications_project
             ON classifications(tenant, project)",
            "CREATE INDEX IF NOT EXISTS idx_classifications_type
             ON classifications(tenant, doc_type)",
            "CREATE INDEX IF NOT EXISTS idx_classifications_period
             ON classifications(tenant, time_period)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                last_message_at TEXT NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_owner
             ON conversations(tenant, user_id, last_message_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                reasoning TEXT,
                sources TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                job_type TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'queued',
                progress INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                error TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                next_run_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_queue
             ON jobs(status, next_run_at, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_counters (
                tenant TEXT NOT NULL,
                day TEXT NOT NULL,
                tokens INTEGER NOT NULL DEFAULT 0,
                api_calls INTEGER NOT NULL DEFAULT 0,
                estimated_cost REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant, day)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS employee_embeddings (
                user_id TEXT NOT NULL,
                tenant TEXT NOT NULL,
                vector_id TEXT NOT NULL,
                profile_snapshot TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                PRIMARY KEY (user_id, tenant)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("relational store schema ready");
        Ok(())
    }
}

/// Render a timestamp the way every table stores it; fixed-width so string
/// comparison agrees with time order
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn normalize_sqlite_url(url: &str) -> String {
    if url.contains(":memory:") || url.contains("mode=") {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&mode=rwc", url)
    } else {
        format!("{}?mode=rwc", url)
    }
}

#[cfg(test)]
pub(crate) async fn test_store() -> Store {
    Store::connect(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
    })
    .await
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_initializes_idempotently() {
        let store = test_store().await;
        // second run must not fail on existing tables
        store.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_backed_store_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("corpora.db").display());
        let config = DatabaseConfig { url };

        {
            let store = Store::connect(&config).await.unwrap();
            store
                .insert_job("7", "process_document", &serde_json::json!({}))
                .await
                .unwrap();
        }

        // a fresh connection sees the durable row
        let store = Store::connect(&config).await.unwrap();
        assert_eq!(store.queued_job_count().await.unwrap(), 1);
    }

    #[test]
    fn test_normalize_sqlite_url() {
        assert_eq!(normalize_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_sqlite_url("sqlite:data/corpora.db"),
            "sqlite:data/corpora.db?mode=rwc"
        );
        assert_eq!(
            normalize_sqlite_url("sqlite:x.db?cache=shared"),
            "sqlite:x.db?cache=shared&mode=rwc"
        );
    }

    #[test]
    fn test_timestamp_format_sorts_lexicographically() {
        let early = format_ts("2024-01-01T00:00:00Z".parse().unwrap());
        let late = format_ts("2024-06-15T12:30:00Z".parse().unwrap());
        assert!(early < late);
        assert_eq!(parse_ts(&early).timestamp(), 1704067200);
    }
}

//! Document rows: upload registration, status transitions, soft deletion

use super::{format_ts, parse_ts, Store};
use crate::error::{CoreError, Result};
use crate::extract::FileType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use std::collections::HashMap;
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle of an ingested document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A stored document
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Document {
    pub id: Uuid,
    pub tenant: String,
    pub filename: String,
    pub file_type: FileType,
    pub size_bytes: i64,
    pub storage_key: String,
    pub uploader: String,
    pub uploaded_at: DateTime<Utc>,
    pub status: DocumentStatus,
    pub metadata: Value,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fields required to register an upload
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub tenant: String,
    pub filename: String,
    pub file_type: FileType,
    pub size_bytes: i64,
    pub storage_key: String,
    pub uploader: String,
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let id: String = row.get("id");
    let file_type: String = row.get("file_type");
    let status: String = row.get("status");
    let metadata: String = row.get("metadata");
    let uploaded_at: String = row.get("uploaded_at");
    let deleted_at: Option<String> = row.get("deleted_at");

    Ok(Document {
        id: Uuid::parse_str(&id).map_err(|e| CoreError::Database(sqlx::Error::Decode(e.into())))?,
        tenant: row.get("tenant"),
        filename: row.get("filename"),
        file_type: FileType::parse(&file_type)
            .ok_or_else(|| CoreError::Validation(format!("unknown file type {}", file_type)))?,
        size_bytes: row.get("size_bytes"),
        storage_key: row.get("storage_key"),
        uploader: row.get("uploader"),
        uploaded_at: parse_ts(&uploaded_at),
        status: DocumentStatus::parse(&status)
            .ok_or_else(|| CoreError::Validation(format!("unknown status {}", status)))?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        is_deleted: row.get::<i64, _>("is_deleted") != 0,
        deleted_at: deleted_at.as_deref().map(parse_ts),
    })
}

impl Store {
    /// Register an uploaded document in `pending`
    pub async fn insert_document(&self, new: NewDocument) -> Result<Document> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO documents
                (id, tenant, filename, file_type, size_bytes, storage_key,
                 uploader, uploaded_at, status, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', '{}')
            "#,
        )
        .bind(id.to_string())
        .bind(&new.tenant)
        .bind(&new.filename)
        .bind(new.file_type.as_str())
        .bind(new.size_bytes)
        .bind(&new.storage_key)
        .bind(&new.uploader)
        .bind(format_ts(now))
        .execute(self.pool())
        .await?;

        debug!(document = %id, tenant = %new.tenant, "registered document");
        Ok(Document {
            id,
            tenant: new.tenant,
            filename: new.filename,
            file_type: new.file_type,
            size_bytes: new.size_bytes,
            storage_key: new.storage_key,
            uploader: new.uploader,
            uploaded_at: now,
            status: DocumentStatus::Pending,
            metadata: Value::Object(Default::default()),
            is_deleted: false,
            deleted_at: None,
        })
    }

    /// Fetch one live document scoped to a tenant
    pub async fn get_document(&self, tenant: &str, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT * FROM documents WHERE id = ?1 AND tenant = ?2 AND is_deleted = 0",
        )
        .bind(id.to_string())
        .bind(tenant)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(row_to_document).transpose()
    }

    /// Fetch a document regardless of tenant; worker-side only
    pub async fn get_document_any_tenant(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    /// List a tenant's live documents, newest first
    pub async fn list_documents(&self, tenant: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE tenant = ?1 AND is_deleted = 0
             ORDER BY uploaded_at DESC",
        )
        .bind(tenant)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_document).collect()
    }

    /// Transition a document's processing status
    pub async fn set_document_status(&self, id: Uuid, status: DocumentStatus) -> Result<()> {
        sqlx::query("UPDATE documents SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Merge extraction metadata into the document row
    pub async fn set_document_metadata(&self, id: Uuid, metadata: &Value) -> Result<()> {
        sqlx::query("UPDATE documents SET metadata = ?1 WHERE id = ?2")
            .bind(serde_json::to_string(metadata)?)
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Soft-delete; returns false when the document is absent for this tenant
    pub async fn soft_delete_document(&self, tenant: &str, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET is_deleted = 1, deleted_at = ?1
             WHERE id = ?2 AND tenant = ?3 AND is_deleted = 0",
        )
        .bind(format_ts(Utc::now()))
        .bind(id.to_string())
        .bind(tenant)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Soft-deleted rows awaiting the administrative sweep
    pub async fn soft_deleted_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents WHERE is_deleted = 1")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(row_to_document).collect()
    }

    /// Hard-delete one soft-deleted row and its chunks and classification.
    /// Callers must have removed the vectors first.
    pub async fn purge_document(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM classifications WHERE document_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?1 AND is_deleted = 1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(document = %id, "purged soft-deleted document");
        Ok(())
    }

    /// Live document counts per status for a tenant
    pub async fn document_counts(&self, tenant: &str) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM documents
             WHERE tenant = ?1 AND is_deleted = 0 GROUP BY status",
        )
        .bind(tenant)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("n")))
            .collect())
    }
}

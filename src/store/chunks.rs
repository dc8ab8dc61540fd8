//! Chunk rows: atomic batch insert tied to document completion

use super::Store;
use crate::chunker::TextChunk;
use crate::error::Result;
use crate::store::documents::DocumentStatus;
use crate::vector::chunk_vector_id;
use sqlx::Row;
use uuid::Uuid;

/// A persisted chunk
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub id: Uuid,
    pub document_id: Uuid,
    pub index: i64,
    pub text: String,
    pub token_count: i64,
    pub embedding_key: String,
    pub metadata: serde_json::Value,
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> ChunkRow {
    let id: String = row.get("id");
    let document_id: String = row.get("document_id");
    let metadata: String = row.get("metadata");
    ChunkRow {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        document_id: Uuid::parse_str(&document_id).unwrap_or_default(),
        index: row.get("chunk_index"),
        text: row.get("text"),
        token_count: row.get("token_count"),
        embedding_key: row.get("embedding_key"),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    }
}

impl Store {
    /// Insert a document's chunk batch and flip it to `completed` in one
    /// transaction. Any prior chunks are replaced, which keeps re-runs of
    /// the pipeline idempotent.
    pub async fn insert_chunks_and_complete(
        &self,
        document_id: Uuid,
        chunks: &[TextChunk],
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id.to_string())
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let metadata = serde_json::json!({ "paragraph": chunk.paragraph });
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (id, document_id, chunk_index, text, token_count,
                     embedding_key, metadata)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(document_id.to_string())
            .bind(chunk.index as i64)
            .bind(&chunk.text)
            .bind(chunk.token_count as i64)
            .bind(chunk_vector_id(document_id, chunk.index as i64))
            .bind(metadata.to_string())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE documents SET status = ?1 WHERE id = ?2")
            .bind(DocumentStatus::Completed.as_str())
            .bind(document_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// All chunks of a document ordered by index
    pub async fn chunks_for_document(&self, document_id: Uuid) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE document_id = ?1 ORDER BY chunk_index ASC",
        )
        .bind(document_id.to_string())
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(row_to_chunk).collect())
    }

    /// One chunk by document and index
    pub async fn get_chunk(&self, document_id: Uuid, index: i64) -> Result<Option<ChunkRow>> {
        let row = sqlx::query(
            "SELECT * FROM chunks WHERE document_id = ?1 AND chunk_index = ?2",
        )
        .bind(document_id.to_string())
        .bind(index)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(row_to_chunk))
    }

    /// Remove a document's chunks (pipeline rollback)
    pub async fn delete_chunks(&self, document_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Chunk count for a document
    pub async fn chunk_count(&self, document_id: Uuid) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chunks WHERE document_id = ?1")
            .bind(document_id.to_string())
            .fetch_one(self.pool())
            .await?;
        Ok(row.get("n"))
    }
}

//! The `process_document` pipeline state machine
//!
//! States progress download → extract → chunk → embed → upsert → classify
//! with progress reported at each boundary. The run is idempotent on the
//! document id: any chunks or vectors left over from a previous partial run
//! are deleted before work starts. Failures at or before the upsert stage
//! roll back everything written; a classification failure never blocks
//! completion.

use super::JobContext;
use crate::blob::BlobStore;
use crate::error::{CoreError, ExtractionError, Result};
use crate::extract::ExtractedDocument;
use crate::store::documents::{Document, DocumentStatus};
use crate::store::jobs::JobRow;
use crate::vector::{chunk_vector_id, namespace_for, VectorIndex, VectorItem};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Deserialize)]
struct ProcessArgs {
    doc_id: Uuid,
}

/// Pull the document id out of job args without deserializing the rest
pub fn doc_id_from_args(args: &Value) -> Option<Uuid> {
    args.get("doc_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Progress values at state boundaries
mod progress {
    pub const DOWNLOAD: i64 = 10;
    pub const EXTRACT: i64 = 30;
    pub const CHUNK: i64 = 50;
    pub const EMBED: i64 = 70;
    pub const UPSERT: i64 = 85;
    pub const CLASSIFY: i64 = 95;
    pub const DONE: i64 = 100;
}

pub async fn run(ctx: &JobContext, job: &JobRow) -> Result<Value> {
    let args: ProcessArgs = serde_json::from_value(job.args.clone())
        .map_err(|e| CoreError::PermanentFailure(format!("bad process_document args: {}", e)))?;

    let Some(document) = ctx.store.get_document_any_tenant(args.doc_id).await? else {
        return Err(CoreError::PermanentFailure(format!(
            "document {} does not exist",
            args.doc_id
        )));
    };
    if document.is_deleted {
        info!(document = %document.id, "document deleted since upload, skipping");
        return Ok(json!({"skipped": "deleted"}));
    }

    match run_pipeline(ctx, job, &document).await {
        Ok(result) => Ok(result),
        Err(e) => {
            rollback(ctx, &document).await;
            Err(e)
        }
    }
}

async fn run_pipeline(ctx: &JobContext, job: &JobRow, document: &Document) -> Result<Value> {
    let namespace = namespace_for(&document.tenant);

    // tolerate partial prior state: at-least-once delivery means a crashed
    // worker may have written some chunks or vectors already
    ctx.index.delete_document(&namespace, document.id).await?;
    ctx.store.delete_chunks(document.id).await?;
    ctx.store
        .set_document_status(document.id, DocumentStatus::Processing)
        .await?;

    check_cancelled(ctx, job).await?;
    ctx.store
        .set_job_progress(job.job_id, progress::DOWNLOAD)
        .await?;
    let bytes = ctx.blob.get(&document.storage_key).await?;

    check_cancelled(ctx, job).await?;
    let extracted = extract_with_timeout(ctx, document, bytes).await?;
    ctx.store
        .set_document_metadata(document.id, &serde_json::to_value(&extracted.metadata)?)
        .await?;
    ctx.store
        .set_job_progress(job.job_id, progress::EXTRACT)
        .await?;

    check_cancelled(ctx, job).await?;
    let chunks = ctx.chunker.chunk(&extracted.text);
    if chunks.is_empty() {
        return Err(ExtractionError::EmptyDocument.into());
    }
    ctx.store
        .set_job_progress(job.job_id, progress::CHUNK)
        .await?;

    check_cancelled(ctx, job).await?;
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = ctx.embedder.embed(&texts, &document.tenant).await?;
    ctx.store
        .set_job_progress(job.job_id, progress::EMBED)
        .await?;

    check_cancelled(ctx, job).await?;
    let items: Vec<VectorItem> = chunks
        .iter()
        .zip(vectors)
        .map(|(chunk, values)| VectorItem {
            id: chunk_vector_id(document.id, chunk.index as i64),
            values,
            metadata: json!({
                "kind": "chunk",
                "doc_id": document.id.to_string(),
                "chunk_index": chunk.index,
                "filename": document.filename,
                "file_type": document.file_type.as_str(),
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        })
        .collect();
    ctx.index.upsert(&namespace, items).await?;

    // the atomic commit point: chunk rows and the completed flip land
    // together
    ctx.store
        .insert_chunks_and_complete(document.id, &chunks)
        .await?;

    // past this point the document stays completed no matter what, so
    // progress bookkeeping and classification are both best-effort
    report_progress(ctx, job.job_id, progress::UPSERT).await;

    let doc_type = classify(ctx, document, &chunks).await;
    if let Some(doc_type) = &doc_type {
        tag_chunk_vectors(ctx, &namespace, document, &chunks, doc_type).await;
    }
    report_progress(ctx, job.job_id, progress::CLASSIFY).await;

    report_progress(ctx, job.job_id, progress::DONE).await;
    info!(
        document = %document.id,
        chunks = chunks.len(),
        classified = doc_type.is_some(),
        "document processed"
    );

    Ok(json!({
        "doc_id": document.id.to_string(),
        "chunks": chunks.len(),
        "classified": doc_type.is_some(),
    }))
}

/// Progress updates after the commit must never fail the job
async fn report_progress(ctx: &JobContext, job_id: Uuid, value: i64) {
    if let Err(e) = ctx.store.set_job_progress(job_id, value).await {
        warn!(job = %job_id, value, "failed to report progress: {}", e);
    }
}

async fn extract_with_timeout(
    ctx: &JobContext,
    document: &Document,
    bytes: Vec<u8>,
) -> Result<ExtractedDocument> {
    let extractor = ctx.extractor.clone();
    let file_type = document.file_type;
    let cap = Duration::from_secs(ctx.config.ingest.extraction_timeout_secs);

    // parsing is CPU-bound; keep it off the async workers
    let handle = tokio::task::spawn_blocking(move || extractor.extract(file_type, &bytes));
    match tokio::time::timeout(cap, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(CoreError::PermanentFailure(format!(
            "extraction panicked: {}",
            join_err
        ))),
        Err(_) => Err(ExtractionError::Timeout.into()),
    }
}

/// Classification is best-effort; returns the stored doc_type when a
/// record was written
async fn classify(
    ctx: &JobContext,
    document: &Document,
    chunks: &[crate::chunker::TextChunk],
) -> Option<String> {
    let excerpt: String = chunks
        .iter()
        .take(ctx.config.ingest.classifier_chunks)
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let context = match ctx.store.org_context(&document.tenant).await {
        Ok(context) => context,
        Err(e) => {
            warn!(document = %document.id, "org context unavailable: {}", e);
            Default::default()
        }
    };

    let classification = ctx
        .classifier
        .classify(&document.filename, document.file_type, &excerpt, &context)
        .await;

    match ctx
        .store
        .upsert_classification(&document.tenant, document.id, &classification)
        .await
    {
        Ok(()) => Some(classification.doc_type),
        Err(e) => {
            warn!(document = %document.id, "failed to store classification: {}", e);
            None
        }
    }
}

/// Write the document's label onto its chunk vectors so search-time
/// doc_type filters apply inside the index; best-effort, the
/// classification row stays authoritative
async fn tag_chunk_vectors(
    ctx: &JobContext,
    namespace: &str,
    document: &Document,
    chunks: &[crate::chunker::TextChunk],
    doc_type: &str,
) {
    for chunk in chunks {
        let id = chunk_vector_id(document.id, chunk.index as i64);
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "doc_type".to_string(),
            Value::String(doc_type.to_string()),
        );
        if let Err(e) = ctx.index.update_metadata(namespace, &id, metadata).await {
            warn!(document = %document.id, vector = %id, "vector metadata update failed: {}", e);
        }
    }
}

async fn check_cancelled(ctx: &JobContext, job: &JobRow) -> Result<()> {
    if ctx.store.job_cancel_requested(job.job_id).await? {
        return Err(CoreError::PermanentFailure("cancelled".to_string()));
    }
    Ok(())
}

/// Same cleanup as an upsert-stage failure: no chunks, no vectors
async fn rollback(ctx: &JobContext, document: &Document) {
    let namespace = namespace_for(&document.tenant);
    if let Err(e) = ctx.index.delete_document(&namespace, document.id).await {
        warn!(document = %document.id, "rollback: vector delete failed: {}", e);
    }
    if let Err(e) = ctx.store.delete_chunks(document.id).await {
        warn!(document = %document.id, "rollback: chunk delete failed: {}", e);
    }
}

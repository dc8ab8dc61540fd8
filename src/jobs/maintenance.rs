//! Background tasks besides document processing: reclassification, employee
//! profile embeddings, external source sync, deletion sweeps, and the
//! nightly consolidation run

use super::{JobContext, JobExecutor, PROCESS_DOCUMENT};
use crate::blob::{build_key, sanitize_filename, BlobStore};
use crate::error::{CoreError, Result};
use crate::extract::FileType;
use crate::store::documents::NewDocument;
use crate::store::jobs::JobRow;
use crate::vector::{employee_vector_id, namespace_for, VectorIndex, VectorItem};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

/// How long daily usage counters are retained before compaction
const USAGE_RETENTION_DAYS: i64 = 400;

#[derive(Deserialize)]
struct DocArgs {
    doc_id: Uuid,
}

/// Re-run classification over a document's stored chunks
pub async fn reclassify_document(ctx: &JobContext, job: &JobRow) -> Result<Value> {
    let args: DocArgs = serde_json::from_value(job.args.clone())
        .map_err(|e| CoreError::PermanentFailure(format!("bad reclassify args: {}", e)))?;

    let Some(document) = ctx.store.get_document_any_tenant(args.doc_id).await? else {
        return Err(CoreError::PermanentFailure(format!(
            "document {} does not exist",
            args.doc_id
        )));
    };

    let chunks = ctx.store.chunks_for_document(document.id).await?;
    if chunks.is_empty() {
        return Err(CoreError::PermanentFailure(
            "document has no chunks to classify".to_string(),
        ));
    }

    ctx.store.set_job_progress(job.job_id, 50).await?;

    let excerpt: String = chunks
        .iter()
        .take(ctx.config.ingest.classifier_chunks)
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let context = ctx.store.org_context(&document.tenant).await?;
    let classification = ctx
        .classifier
        .classify(&document.filename, document.file_type, &excerpt, &context)
        .await;

    ctx.store
        .upsert_classification(&document.tenant, document.id, &classification)
        .await?;

    // keep chunk vector metadata aligned so search-time doc_type filters
    // see the new label; the classification row stays authoritative
    let namespace = namespace_for(&document.tenant);
    for chunk in &chunks {
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "doc_type".to_string(),
            Value::String(classification.doc_type.clone()),
        );
        if let Err(e) = ctx
            .index
            .update_metadata(&namespace, &chunk.embedding_key, metadata)
            .await
        {
            warn!(
                document = %document.id,
                vector = %chunk.embedding_key,
                "vector metadata update failed: {}",
                e
            );
        }
    }

    Ok(json!({
        "doc_id": document.id.to_string(),
        "doc_type": classification.doc_type,
    }))
}

#[derive(Deserialize)]
struct EmployeeArgs {
    user_id: String,
    #[serde(default)]
    profile: Option<String>,
}

/// Embed an employee profile snapshot into the tenant namespace
pub async fn generate_employee_embedding(ctx: &JobContext, job: &JobRow) -> Result<Value> {
    let args: EmployeeArgs = serde_json::from_value(job.args.clone())
        .map_err(|e| CoreError::PermanentFailure(format!("bad employee args: {}", e)))?;

    let snapshot = match args.profile {
        Some(profile) if !profile.trim().is_empty() => profile,
        _ => match ctx
            .store
            .get_employee_embedding(&job.tenant, &args.user_id)
            .await?
        {
            Some(existing) => existing.profile_snapshot,
            None => format!("Employee {}", args.user_id),
        },
    };

    ctx.store.set_job_progress(job.job_id, 40).await?;
    let vectors = ctx.embedder.embed(&[snapshot.clone()], &job.tenant).await?;
    let values = vectors
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::PermanentFailure("embedder returned no vector".into()))?;

    let vector_id = employee_vector_id(&args.user_id);
    ctx.index
        .upsert(
            &namespace_for(&job.tenant),
            vec![VectorItem {
                id: vector_id.clone(),
                values,
                metadata: json!({
                    "kind": "employee",
                    "user_id": args.user_id,
                })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            }],
        )
        .await?;
    ctx.store.set_job_progress(job.job_id, 80).await?;

    ctx.store
        .upsert_employee_embedding(&args.user_id, &job.tenant, &vector_id, &snapshot)
        .await?;

    Ok(json!({"vector_id": vector_id}))
}

#[derive(Deserialize)]
struct SyncArgs {
    url: String,
    #[serde(default)]
    filename: Option<String>,
}

/// Pull a document from an external URL into the regular ingestion path
pub async fn sync_external_source(executor: &JobExecutor, job: &JobRow) -> Result<Value> {
    let ctx = executor.context();
    let args: SyncArgs = serde_json::from_value(job.args.clone())
        .map_err(|e| CoreError::PermanentFailure(format!("bad sync args: {}", e)))?;

    let response = reqwest::get(&args.url)
        .await
        .map_err(|e| CoreError::TransientUpstream(format!("source fetch: {}", e)))?;
    if !response.status().is_success() {
        return Err(CoreError::TransientUpstream(format!(
            "source fetch: HTTP {}",
            response.status()
        )));
    }

    let filename = sanitize_filename(
        &args
            .filename
            .or_else(|| {
                args.url
                    .rsplit('/')
                    .next()
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "synced-document.txt".to_string()),
    );
    let file_type = FileType::from_filename(&filename).unwrap_or(FileType::Txt);

    let bytes = response
        .bytes()
        .await
        .map_err(|e| CoreError::TransientUpstream(format!("source fetch: {}", e)))?
        .to_vec();
    if bytes.len() as u64 > ctx.config.blob.max_upload_bytes {
        return Err(CoreError::PermanentFailure(format!(
            "source payload of {} bytes exceeds the upload limit",
            bytes.len()
        )));
    }

    ctx.store.set_job_progress(job.job_id, 40).await?;

    let storage_key = build_key(&job.tenant, &filename);
    ctx.blob
        .put(&storage_key, bytes.clone(), file_type.content_type())
        .await?;

    let document = ctx
        .store
        .insert_document(NewDocument {
            tenant: job.tenant.clone(),
            filename,
            file_type,
            size_bytes: bytes.len() as i64,
            storage_key,
            uploader: "external-sync".to_string(),
        })
        .await?;
    ctx.store.set_job_progress(job.job_id, 70).await?;

    let process_job = executor
        .submit(
            &job.tenant,
            PROCESS_DOCUMENT,
            json!({"doc_id": document.id.to_string()}),
        )
        .await?;

    info!(document = %document.id, "external source staged for processing");
    Ok(json!({
        "doc_id": document.id.to_string(),
        "process_job_id": process_job.to_string(),
    }))
}

/// Remove a soft-deleted document's vectors, blob, and rows. Vectors go
/// first so the namespace never references a purged document.
pub async fn delete_document_artifacts(ctx: &JobContext, job: &JobRow) -> Result<Value> {
    let args: DocArgs = serde_json::from_value(job.args.clone())
        .map_err(|e| CoreError::PermanentFailure(format!("bad delete args: {}", e)))?;

    let Some(document) = ctx.store.get_document_any_tenant(args.doc_id).await? else {
        return Ok(json!({"skipped": "already purged"}));
    };
    if !document.is_deleted {
        return Err(CoreError::PermanentFailure(format!(
            "document {} is not soft-deleted",
            document.id
        )));
    }

    ctx.index
        .delete_document(&namespace_for(&document.tenant), document.id)
        .await?;
    ctx.store.set_job_progress(job.job_id, 60).await?;

    if let Err(e) = ctx.blob.delete(&document.storage_key).await {
        warn!(document = %document.id, "blob delete failed: {}", e);
    }
    ctx.store.purge_document(document.id).await?;

    Ok(json!({"doc_id": document.id.to_string(), "purged": true}))
}

/// Nightly sweep: purge soft-deleted documents and compact old usage rows
pub async fn consolidate_memories(ctx: &JobContext, job: &JobRow) -> Result<Value> {
    let pending = ctx.store.soft_deleted_documents().await?;
    let total = pending.len();
    let mut purged = 0usize;

    for document in pending {
        let namespace = namespace_for(&document.tenant);
        if let Err(e) = ctx.index.delete_document(&namespace, document.id).await {
            // leave the row for the next sweep rather than orphan vectors
            warn!(document = %document.id, "sweep: vector delete failed: {}", e);
            continue;
        }
        if let Err(e) = ctx.blob.delete(&document.storage_key).await {
            warn!(document = %document.id, "sweep: blob delete failed: {}", e);
        }
        ctx.store.purge_document(document.id).await?;
        purged += 1;
    }
    ctx.store.set_job_progress(job.job_id, 70).await?;

    let compacted = ctx.store.compact_usage(USAGE_RETENTION_DAYS).await?;

    info!(purged, total, compacted, "consolidation sweep finished");
    Ok(json!({
        "documents_purged": purged,
        "documents_pending": total - purged,
        "usage_rows_compacted": compacted,
    }))
}

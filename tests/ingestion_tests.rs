//! End-to-end ingestion pipeline scenarios over in-memory adapters


use corpora::config::CoreConfig;
use corpora::rag::RetrievalRequest;
use corpora::store::documents::DocumentStatus;
use corpora::store::jobs::JobStatus;
use corpora::vector::{chunk_vector_id, namespace_for, VectorIndex, VectorItem};
use std::sync::Arc;
use test_helpers::{hiring_policy_text, test_engine, test_engine_with, ScriptedChat};

#[tokio::test]
async fn test_happy_path_ingestion() {
    let engine = test_engine().await;
    let (doc_id, job_id) = engine
        .upload_text("7", "hiring-policy.txt", &hiring_policy_text())
        .await;

    engine.drain_queue().await;

    // job terminal and fully progressed
    let job = engine.store.get_job("7", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert!(job.started_at.unwrap() <= job.completed_at.unwrap());

    // document completed with at least one chunk and one vector per chunk
    let document = engine.store.get_document("7", doc_id).await.unwrap().unwrap();
    assert_eq!(document.status, DocumentStatus::Completed);

    let chunks = engine.store.chunks_for_document(doc_id).await.unwrap();
    assert!(!chunks.is_empty());
    let indexes: Vec<i64> = chunks.iter().map(|c| c.index).collect();
    assert_eq!(indexes, (0..chunks.len() as i64).collect::<Vec<_>>());
    assert_eq!(
        engine.index.namespace_len(&namespace_for("7")).await,
        chunks.len()
    );

    // classification landed with the scripted label
    let classification = engine
        .store
        .get_classification("7", doc_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(classification.fields.doc_type, "policy");
    assert_eq!(classification.fields.time_period.as_deref(), Some("2024-Q1"));

    // the document is retrievable as the top hit
    let hits = engine
        .rag
        .retrieve("7", "hiring policy", &RetrievalRequest::default())
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].doc_id, doc_id);
    assert!(hits[0].score >= 0.7);

    // usage was recorded against the tenant
    let month = chrono::Utc::now().format("%Y-%m").to_string();
    let usage = engine.store.usage_for_month("7", &month).await.unwrap();
    assert!(usage.tokens > 0);
    assert!(usage.api_calls > 0);
}

#[tokio::test]
async fn test_tenant_isolation() {
    let engine = test_engine().await;
    let (doc_7, _) = engine
        .upload_text("7", "policy.txt", &hiring_policy_text())
        .await;
    let (doc_8, _) = engine
        .upload_text("8", "policy.txt", &hiring_policy_text())
        .await;
    engine.drain_queue().await;

    // each tenant sees exactly its own document
    let hits_8 = engine
        .rag
        .retrieve("8", "hiring policy", &RetrievalRequest::default())
        .await
        .unwrap();
    assert!(!hits_8.is_empty());
    assert!(hits_8.iter().all(|h| h.doc_id == doc_8));

    // deleting tenant 7's copy leaves tenant 8 untouched
    engine.store.soft_delete_document("7", doc_7).await.unwrap();
    engine
        .executor
        .submit(
            "7",
            corpora::jobs::DELETE_DOCUMENT,
            serde_json::json!({"doc_id": doc_7.to_string()}),
        )
        .await
        .unwrap();
    engine.drain_queue().await;

    assert_eq!(engine.index.namespace_len(&namespace_for("7")).await, 0);
    let hits_8 = engine
        .rag
        .retrieve("8", "hiring policy", &RetrievalRequest::default())
        .await
        .unwrap();
    assert!(hits_8.iter().all(|h| h.doc_id == doc_8));

    // the relational row is gone too
    assert!(engine.store.get_document_any_tenant(doc_7).await.unwrap().is_none());
}

#[tokio::test]
async fn test_reentrant_processing_tolerates_partial_state() {
    let engine = test_engine().await;
    let (doc_id, _) = engine
        .upload_text("7", "policy.txt", &hiring_policy_text())
        .await;

    // fake a crashed earlier attempt: stale chunks and vectors exist
    let stale = corpora::chunker::TextChunk {
        text: "stale leftover".to_string(),
        index: 0,
        token_count: 2,
        paragraph: 0,
    };
    engine
        .store
        .insert_chunks_and_complete(doc_id, &[stale])
        .await
        .unwrap();
    engine
        .index
        .upsert(
            &namespace_for("7"),
            vec![
                VectorItem {
                    id: chunk_vector_id(doc_id, 0),
                    values: vec![1.0; test_helpers::DIMENSION],
                    metadata: Default::default(),
                },
                VectorItem {
                    id: chunk_vector_id(doc_id, 7),
                    values: vec![1.0; test_helpers::DIMENSION],
                    metadata: Default::default(),
                },
            ],
        )
        .await
        .unwrap();

    engine.drain_queue().await;

    // invariants restored: N chunks, N vectors, dense indexes, one
    // classification row
    let chunks = engine.store.chunks_for_document(doc_id).await.unwrap();
    assert!(chunks.len() > 1, "real content replaced the stale chunk");
    let indexes: Vec<i64> = chunks.iter().map(|c| c.index).collect();
    assert_eq!(indexes, (0..chunks.len() as i64).collect::<Vec<_>>());
    assert_eq!(
        engine.index.namespace_len(&namespace_for("7")).await,
        chunks.len()
    );
    assert!(engine
        .store
        .chunks_for_document(doc_id)
        .await
        .unwrap()
        .iter()
        .all(|c| c.text != "stale leftover"));
}

#[tokio::test]
async fn test_rerunning_completed_document_is_idempotent() {
    let engine = test_engine().await;
    let (doc_id, _) = engine
        .upload_text("7", "policy.txt", &hiring_policy_text())
        .await;
    engine.drain_queue().await;

    let first_chunks = engine.store.chunks_for_document(doc_id).await.unwrap();
    let first_count = first_chunks.len();

    // at-least-once delivery: the same work arrives again
    engine
        .executor
        .submit(
            "7",
            corpora::jobs::PROCESS_DOCUMENT,
            serde_json::json!({"doc_id": doc_id.to_string()}),
        )
        .await
        .unwrap();
    engine.drain_queue().await;

    let second_chunks = engine.store.chunks_for_document(doc_id).await.unwrap();
    assert_eq!(second_chunks.len(), first_count);
    assert_eq!(
        engine.index.namespace_len(&namespace_for("7")).await,
        first_count
    );
    // same vector id set both times
    let first_ids: Vec<String> = first_chunks.iter().map(|c| c.embedding_key.clone()).collect();
    let second_ids: Vec<String> = second_chunks.iter().map(|c| c.embedding_key.clone()).collect();
    assert_eq!(first_ids, second_ids);
}

#[tokio::test]
async fn test_budget_gate_fails_job_without_partial_writes() {
    let mut config = CoreConfig::default();
    config.llm.monthly_token_budget = Some(1);
    let engine = test_engine_with(config, Arc::new(ScriptedChat::default())).await;

    let (doc_id, job_id) = engine
        .upload_text("7", "policy.txt", &hiring_policy_text())
        .await;
    engine.drain_queue().await;

    let job = engine.store.get_job("7", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("BudgetExceeded"));

    // no chunks, no vectors, document marked failed
    assert_eq!(engine.store.chunk_count(doc_id).await.unwrap(), 0);
    assert_eq!(engine.index.namespace_len(&namespace_for("7")).await, 0);
    let document = engine.store.get_document("7", doc_id).await.unwrap().unwrap();
    assert_eq!(document.status, DocumentStatus::Failed);
}

#[tokio::test]
async fn test_type_mismatch_is_permanent_failure() {
    let engine = test_engine().await;

    // declared pdf, plain-text content
    use corpora::blob::{build_key, BlobStore};
    use corpora::store::documents::NewDocument;
    let key = build_key("7", "fake.pdf");
    engine
        .blob
        .put(&key, b"not a pdf at all".to_vec(), "application/pdf")
        .await
        .unwrap();
    let document = engine
        .store
        .insert_document(NewDocument {
            tenant: "7".to_string(),
            filename: "fake.pdf".to_string(),
            file_type: corpora::extract::FileType::Pdf,
            size_bytes: 16,
            storage_key: key,
            uploader: "u1".to_string(),
        })
        .await
        .unwrap();
    let job_id = engine
        .executor
        .submit(
            "7",
            corpora::jobs::PROCESS_DOCUMENT,
            serde_json::json!({"doc_id": document.id.to_string()}),
        )
        .await
        .unwrap();

    engine.drain_queue().await;

    let job = engine.store.get_job("7", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    // a single attempt: format mismatch is not retried
    assert_eq!(job.attempts, 1);

    let doc = engine
        .store
        .get_document("7", document.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
}

#[tokio::test]
async fn test_cancellation_rolls_back_like_upsert_failure() {
    let engine = test_engine().await;
    let (doc_id, job_id) = engine
        .upload_text("7", "policy.txt", &hiring_policy_text())
        .await;

    // cancel before any worker claims it
    engine.store.request_job_cancel("7", job_id).await.unwrap();
    engine.drain_queue().await;

    let job = engine.store.get_job("7", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("permanent failure: cancelled"));
    assert_eq!(engine.store.chunk_count(doc_id).await.unwrap(), 0);
    assert_eq!(engine.index.namespace_len(&namespace_for("7")).await, 0);
}

#[tokio::test]
async fn test_doc_type_filter_uses_vector_metadata() {
    let engine = test_engine().await;
    let (doc_id, _) = engine
        .upload_text("7", "hiring-policy.txt", &hiring_policy_text())
        .await;
    engine.drain_queue().await;

    // the pipeline tagged the chunk vectors with the classified doc_type
    let hits = engine
        .rag
        .retrieve(
            "7",
            "hiring policy",
            &RetrievalRequest {
                doc_type: Some("policy".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].doc_id, doc_id);

    // a non-matching filter excludes the document inside the index
    let none = engine
        .rag
        .retrieve(
            "7",
            "hiring policy",
            &RetrievalRequest {
                doc_type: Some("invoice".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_reclassify_twice_keeps_one_row() {
    let engine = test_engine().await;
    let (doc_id, _) = engine
        .upload_text("7", "policy.txt", &hiring_policy_text())
        .await;
    engine.drain_queue().await;

    for _ in 0..2 {
        engine
            .executor
            .submit(
                "7",
                corpora::jobs::RECLASSIFY_DOCUMENT,
                serde_json::json!({"doc_id": doc_id.to_string()}),
            )
            .await
            .unwrap();
    }
    engine.drain_queue().await;

    assert_eq!(engine.store.classification_count("7").await.unwrap(), 1);
}

#[tokio::test]
async fn test_employee_embedding_job() {
    let engine = test_engine().await;
    let job_id = engine
        .executor
        .submit(
            "7",
            corpora::jobs::GENERATE_EMPLOYEE_EMBEDDING,
            serde_json::json!({
                "user_id": "u42",
                "profile": "Staff engineer, search infrastructure, on-call lead"
            }),
        )
        .await
        .unwrap();
    engine.drain_queue().await;

    let job = engine.store.get_job("7", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let record = engine
        .store
        .get_employee_embedding("7", "u42")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.vector_id, "employee_u42");
    assert_eq!(engine.index.namespace_len(&namespace_for("7")).await, 1);

    // employee vectors are findable through the people search path
    let hits = engine
        .rag
        .search_employees("7", "search infrastructure", 5)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].user_id, "u42");
}

//! Chat answering paths: single-shot RAG and the orchestrated route


use corpora::orchestrator::Orchestrator;
use corpora::rag::{RetrievalRequest, NO_EVIDENCE_ANSWER};
use corpora::store::conversations::MessageRole;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{hiring_policy_text, test_engine, ScriptedChat};

#[tokio::test]
async fn test_rag_with_no_evidence_answers_honestly() {
    let engine = test_engine().await;

    let answer = engine
        .rag
        .answer("7", "what is our travel policy?", &RetrievalRequest::default())
        .await
        .unwrap();

    assert_eq!(answer.answer, NO_EVIDENCE_ANSWER);
    assert!(answer.sources.is_empty());
    assert_eq!(answer.usage.total_tokens, 0);
}

#[tokio::test]
async fn test_rag_answer_carries_sources_and_usage() {
    let engine = test_engine().await;
    let (doc_id, _) = engine
        .upload_text("7", "hiring-policy.txt", &hiring_policy_text())
        .await;
    engine.drain_queue().await;

    let answer = engine
        .rag
        .answer("7", "what is the hiring policy?", &RetrievalRequest::default())
        .await
        .unwrap();

    assert!(answer.answer.contains("[1]"));
    assert_eq!(answer.sources[0].doc_id, doc_id);
    assert_eq!(answer.sources[0].filename, "hiring-policy.txt");
    assert!(answer.usage.total_tokens > 0);
}

#[tokio::test]
async fn test_orchestrated_turn_records_reasoning() {
    let engine = test_engine().await;
    engine
        .upload_text("7", "hiring-policy.txt", &hiring_policy_text())
        .await;
    engine.drain_queue().await;

    let orchestrator = Orchestrator::new(
        engine.rag.clone(),
        Arc::new(ScriptedChat::default()),
        None,
        Duration::from_secs(60),
    );

    let answer = orchestrator
        .run("7", "what is the hiring policy?")
        .await
        .unwrap();

    assert_eq!(answer.answer, "Synthesized from the gathered evidence.");
    assert!(answer.confidence > 0.0);
    assert_eq!(answer.reasoning_steps[0].agent, "planner");
    assert_eq!(
        answer.reasoning_steps.last().unwrap().agent,
        "synthesis"
    );
    assert!(!answer.sources.documents.is_empty());
}

#[tokio::test]
async fn test_conversation_flow_persists_turns() {
    let engine = test_engine().await;
    engine
        .upload_text("7", "hiring-policy.txt", &hiring_policy_text())
        .await;
    engine.drain_queue().await;

    let conversation = engine
        .store
        .create_conversation("7", "u1", None)
        .await
        .unwrap();
    engine
        .store
        .append_message(
            conversation.id,
            MessageRole::User,
            "what is the hiring policy?",
            None,
            None,
        )
        .await
        .unwrap();

    let answer = engine
        .rag
        .answer("7", "what is the hiring policy?", &RetrievalRequest::default())
        .await
        .unwrap();
    let sources = serde_json::to_value(&answer.sources).unwrap();
    engine
        .store
        .append_message(
            conversation.id,
            MessageRole::Assistant,
            &answer.answer,
            None,
            Some(&sources),
        )
        .await
        .unwrap();

    let messages = engine.store.messages(conversation.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert!(messages[1].sources.is_some());

    let listed = engine.store.list_conversations("7", "u1").await.unwrap();
    assert_eq!(listed[0].title, "what is the hiring policy?");
}

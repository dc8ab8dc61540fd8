//! Corpora server: HTTP API plus the background worker pool in one process

use corpora::api::{create_router, AppState};
use corpora::blob::S3BlobStore;
use corpora::chunker::Chunker;
use corpora::classifier::Classifier;
use corpora::config::CoreConfig;
use corpora::embedder::{Embedder, HttpEmbeddingBackend};
use corpora::folders::FolderQueryService;
use corpora::jobs::{JobContext, JobExecutor, CONSOLIDATE_MEMORIES};
use corpora::llm::HttpChatClient;
use corpora::orchestrator::{HttpResearchClient, Orchestrator, ResearchClient};
use corpora::rag::RagEngine;
use corpora::store::Store;
use corpora::vector::HttpVectorIndex;
use corpora::Extractor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Nightly maintenance cadence
const CONSOLIDATION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1);
    let config = Arc::new(CoreConfig::load(config_path.as_deref())?);
    info!(addr = %config.http.addr, "starting corpora v{}", corpora::VERSION);

    let store = Store::connect(&config.database).await?;
    let blob = Arc::new(S3BlobStore::new(&config.blob)?);

    let embed_backend = Arc::new(HttpEmbeddingBackend::new(&config.llm));
    let embedder = Arc::new(Embedder::new(
        embed_backend,
        Arc::new(store.clone()),
        &config.ingest,
        &config.llm,
    ));
    let index = Arc::new(HttpVectorIndex::new(&config.vector, embedder.dimension()));
    let chat = Arc::new(HttpChatClient::new(&config.llm));
    let classifier = Arc::new(Classifier::new(chat.clone()));
    let chunker = Arc::new(Chunker::new(
        config.ingest.chunk_size,
        config.ingest.chunk_overlap,
    )?);

    let executor = JobExecutor::new(JobContext {
        store: store.clone(),
        blob: blob.clone(),
        embedder: embedder.clone(),
        index: index.clone(),
        classifier,
        extractor: Arc::new(Extractor::default()),
        chunker,
        config: config.clone(),
    });
    let worker_handles = executor.spawn_workers();

    let rag = Arc::new(RagEngine::new(
        embedder.clone(),
        index.clone(),
        store.clone(),
        chat.clone(),
        config.retrieval.clone(),
    ));
    let research: Option<Arc<dyn ResearchClient>> = config
        .llm
        .research_api_key
        .as_ref()
        .map(|key| {
            Arc::new(HttpResearchClient::new(&config.llm.research_url, key))
                as Arc<dyn ResearchClient>
        });
    let orchestrator = Arc::new(Orchestrator::new(
        rag.clone(),
        chat,
        research,
        Duration::from_secs(config.http.chat_turn_timeout_secs),
    ));

    // nightly consolidation sweep
    {
        let executor = executor.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CONSOLIDATION_INTERVAL);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if let Err(e) = executor
                    .submit("system", CONSOLIDATE_MEMORIES, serde_json::json!({}))
                    .await
                {
                    error!("failed to schedule consolidation: {}", e);
                }
            }
        });
    }

    let folders = FolderQueryService::new(store.clone());
    let state = AppState {
        store,
        blob,
        executor,
        rag,
        orchestrator,
        folders,
        index,
        config: config.clone(),
        embed_dimension: embedder.dimension(),
    };

    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.http.addr).await?;
    info!("listening on {}", config.http.addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    for handle in worker_handles {
        handle.abort();
    }
    Ok(())
}

//! Corpora: organizational knowledge engine
//!
//! Ingests office documents into a tenant-scoped, semantically searchable,
//! automatically classified corpus and answers questions over it with cited
//! sources. The four load-bearing subsystems:
//! - the durable ingestion pipeline (extract → chunk → embed → upsert →
//!   classify) driven by the job executor
//! - the tenant-namespaced vector index layer
//! - smart-folder faceted views over classification metadata
//! - retrieval-augmented answering, single-shot or multi-agent
//!
//! # Example
//!
//! ```rust,no_run
//! use corpora::config::CoreConfig;
//! use corpora::store::Store;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CoreConfig::load(None)?;
//!     let store = Store::connect(&config.database).await?;
//!     let docs = store.list_documents("acme").await?;
//!     println!("{} documents", docs.len());
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod blob;
pub mod chunker;
pub mod classifier;
pub mod config;
pub mod embedder;
pub mod error;
pub mod extract;
pub mod folders;
pub mod jobs;
pub mod llm;
pub mod orchestrator;
pub mod rag;
pub mod store;
pub mod vector;

// Re-export main types
pub use blob::{BlobStore, InMemoryBlobStore, S3BlobStore};
pub use chunker::{Chunker, TextChunk};
pub use classifier::{Classifier, Confidentiality, DocumentClassification, OrgContext};
pub use config::CoreConfig;
pub use embedder::{Embedder, EmbeddingBackend, HttpEmbeddingBackend, UsageTracker};
pub use error::{CoreError, ExtractionError, Result};
pub use extract::{ExtractedDocument, Extractor, FileType};
pub use folders::{FolderBucket, FolderQueryService, FolderView};
pub use jobs::{JobContext, JobExecutor};
pub use llm::{ChatClient, ChatMessage, GenerationOptions, HttpChatClient, TokenUsage};
pub use orchestrator::{Orchestrator, OrchestratorAnswer, ResearchClient, SourceKind};
pub use rag::{RagAnswer, RagEngine, RagSource, RetrievalRequest, NO_EVIDENCE_ANSWER};
pub use store::Store;
pub use vector::{HttpVectorIndex, InMemoryVectorIndex, VectorIndex, VectorItem, VectorMatch};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with(char::is_numeric));
    }
}

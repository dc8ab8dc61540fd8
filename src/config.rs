//! Configuration management for the knowledge engine
//!
//! Configuration is layered: compiled defaults, then an optional TOML/JSON
//! file, then environment variables. The resulting [`CoreConfig`] is immutable
//! after startup; adapters receive it by construction.

use serde::{Deserialize, Serialize};
use std::env;

/// Main configuration for the knowledge engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    /// HTTP server settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Relational store settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Job queue settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Blob store settings
    #[serde(default)]
    pub blob: BlobConfig,

    /// Vector index settings
    #[serde(default)]
    pub vector: VectorConfig,

    /// LLM endpoints (chat + embeddings + optional research)
    #[serde(default)]
    pub llm: LlmConfig,

    /// Ingestion pipeline tunables
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Retrieval tunables
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Bind address
    #[serde(default = "default_http_addr")]
    pub addr: String,

    /// End-to-end deadline for one chat turn, in seconds
    #[serde(default = "default_chat_deadline")]
    pub chat_turn_timeout_secs: u64,
}

/// Relational store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
}

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Broker URL; defaults to the relational store
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Number of concurrent workers draining the queue
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Sweep interval for jobs enqueued while no worker was listening
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// A `running` job older than this is considered abandoned and requeued
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// Attempt cap for transient failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Blob store configuration (S3-compatible)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    /// Custom endpoint for S3-compatible stores; None uses AWS
    pub endpoint: Option<String>,

    /// Region
    #[serde(default = "default_blob_region")]
    pub region: String,

    /// Bucket name
    #[serde(default = "default_blob_bucket")]
    pub bucket: String,

    /// Access key id
    pub access_key: Option<String>,

    /// Secret access key
    pub secret_key: Option<String>,

    /// Maximum accepted upload size in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// TTL for pre-signed download URLs, in seconds
    #[serde(default = "default_presign_ttl")]
    pub presign_ttl_secs: u64,
}

/// Vector index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    /// API key for the hosted index
    pub api_key: Option<String>,

    /// Index environment (region/cell identifier)
    #[serde(default = "default_vector_environment")]
    pub environment: String,

    /// Index name
    #[serde(default = "default_vector_index")]
    pub index_name: String,

    /// Full endpoint override; when absent it is derived from
    /// environment + index name
    pub endpoint: Option<String>,

    /// Metadata strings longer than this are truncated before upsert
    #[serde(default = "default_metadata_max_len")]
    pub metadata_max_len: usize,

    /// Upsert batch size
    #[serde(default = "default_upsert_batch")]
    pub upsert_batch: usize,
}

impl VectorConfig {
    /// Resolve the index endpoint
    pub fn resolved_endpoint(&self) -> String {
        match &self.endpoint {
            Some(url) => url.clone(),
            None => format!(
                "https://{}.svc.{}.pinecone.io",
                self.index_name, self.environment
            ),
        }
    }
}

/// LLM endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key for chat + embedding endpoints
    pub api_key: Option<String>,

    /// Base URL for an OpenAI-compatible API
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Embedding model
    #[serde(default = "default_embed_model")]
    pub embed_model: String,

    /// Expected embedding dimension; the adapter surfaces the dimension it
    /// actually observes, this is only the declared default
    #[serde(default = "default_embed_dimension")]
    pub embed_dimension: usize,

    /// Chat model
    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Price per embedding token, used for cost accounting
    #[serde(default = "default_token_unit_price")]
    pub token_unit_price: f64,

    /// Per-tenant monthly embedding budget in tokens; None disables the gate
    pub monthly_token_budget: Option<u64>,

    /// External research API key; research is skipped when absent
    pub research_api_key: Option<String>,

    /// External research API endpoint
    #[serde(default = "default_research_url")]
    pub research_url: String,
}

/// Ingestion pipeline tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Chunk size in tokens
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunk overlap in tokens
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Texts per upstream embedding call
    #[serde(default = "default_embed_batch")]
    pub embed_batch: usize,

    /// Embedding requests-per-minute ceiling
    #[serde(default = "default_embed_rpm")]
    pub embed_rpm: u32,

    /// Wall-clock cap for extracting one document, in seconds
    #[serde(default = "default_extraction_timeout")]
    pub extraction_timeout_secs: u64,

    /// Number of leading chunks fed to the classifier
    #[serde(default = "default_classifier_chunks")]
    pub classifier_chunks: usize,
}

/// Retrieval tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default top-k for searches
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Hard cap on requested top-k
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,

    /// Similarity score floor for RAG evidence
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_chat_deadline() -> u64 {
    60
}

fn default_database_url() -> String {
    "sqlite:corpora.db".to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    5
}

fn default_visibility_timeout() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_blob_region() -> String {
    "us-east-1".to_string()
}

fn default_blob_bucket() -> String {
    "corpora-documents".to_string()
}

fn default_max_upload_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_presign_ttl() -> u64 {
    3600
}

fn default_vector_environment() -> String {
    "us-east1-gcp".to_string()
}

fn default_vector_index() -> String {
    "corpora".to_string()
}

fn default_metadata_max_len() -> usize {
    2000
}

fn default_upsert_batch() -> usize {
    100
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embed_model() -> String {
    "text-embedding-3-large".to_string()
}

fn default_embed_dimension() -> usize {
    3072
}

fn default_chat_model() -> String {
    "gpt-4o".to_string()
}

fn default_llm_timeout() -> u64 {
    30
}

fn default_token_unit_price() -> f64 {
    0.000_000_13
}

fn default_research_url() -> String {
    "https://api.tavily.com/search".to_string()
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_embed_batch() -> usize {
    100
}

fn default_embed_rpm() -> u32 {
    300
}

fn default_extraction_timeout() -> u64 {
    120
}

fn default_classifier_chunks() -> usize {
    6
}

fn default_top_k() -> usize {
    10
}

fn default_max_top_k() -> usize {
    100
}

fn default_min_score() -> f32 {
    0.7
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: default_http_addr(),
            chat_turn_timeout_secs: default_chat_deadline(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            worker_concurrency: default_worker_concurrency(),
            poll_interval_secs: default_poll_interval(),
            visibility_timeout_secs: default_visibility_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: default_blob_region(),
            bucket: default_blob_bucket(),
            access_key: None,
            secret_key: None,
            max_upload_bytes: default_max_upload_bytes(),
            presign_ttl_secs: default_presign_ttl(),
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            environment: default_vector_environment(),
            index_name: default_vector_index(),
            endpoint: None,
            metadata_max_len: default_metadata_max_len(),
            upsert_batch: default_upsert_batch(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_llm_base_url(),
            embed_model: default_embed_model(),
            embed_dimension: default_embed_dimension(),
            chat_model: default_chat_model(),
            timeout_secs: default_llm_timeout(),
            token_unit_price: default_token_unit_price(),
            monthly_token_budget: None,
            research_api_key: None,
            research_url: default_research_url(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            embed_batch: default_embed_batch(),
            embed_rpm: default_embed_rpm(),
            extraction_timeout_secs: default_extraction_timeout(),
            classifier_chunks: default_classifier_chunks(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            min_score: default_min_score(),
        }
    }
}

impl CoreConfig {
    /// Load configuration: defaults, then an optional file, then environment
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let mut cfg: CoreConfig = builder.build()?.try_deserialize().unwrap_or_default();
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply documented environment variable overrides
    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("HTTP_ADDR") {
            self.http.addr = v;
        }
        if let Ok(v) = env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = env::var("QUEUE_URL") {
            self.queue.url = v;
        }
        if let Ok(v) = env::var("WORKER_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                self.queue.worker_concurrency = n;
            }
        }
        if let Ok(v) = env::var("JOB_POLL_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.queue.poll_interval_secs = n;
            }
        }
        if let Ok(v) = env::var("BLOB_ENDPOINT") {
            self.blob.endpoint = Some(v);
        }
        if let Ok(v) = env::var("BLOB_REGION") {
            self.blob.region = v;
        }
        if let Ok(v) = env::var("BLOB_BUCKET") {
            self.blob.bucket = v;
        }
        if let Ok(v) = env::var("BLOB_KEY") {
            self.blob.access_key = Some(v);
        }
        if let Ok(v) = env::var("BLOB_SECRET") {
            self.blob.secret_key = Some(v);
        }
        if let Ok(v) = env::var("MAX_UPLOAD_BYTES") {
            if let Ok(n) = v.parse() {
                self.blob.max_upload_bytes = n;
            }
        }
        if let Ok(v) = env::var("VECTOR_API_KEY") {
            self.vector.api_key = Some(v);
        }
        if let Ok(v) = env::var("VECTOR_ENVIRONMENT") {
            self.vector.environment = v;
        }
        if let Ok(v) = env::var("VECTOR_INDEX_NAME") {
            self.vector.index_name = v;
        }
        if let Ok(v) = env::var("LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Ok(v) = env::var("LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = env::var("EMBED_MODEL") {
            self.llm.embed_model = v;
        }
        if let Ok(v) = env::var("CHAT_MODEL") {
            self.llm.chat_model = v;
        }
        if let Ok(v) = env::var("RESEARCH_API_KEY") {
            self.llm.research_api_key = Some(v);
        }
        if let Ok(v) = env::var("MONTHLY_TOKEN_BUDGET") {
            if let Ok(n) = v.parse() {
                self.llm.monthly_token_budget = Some(n);
            }
        }
        if let Ok(v) = env::var("CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.ingest.chunk_size = n;
            }
        }
        if let Ok(v) = env::var("CHUNK_OVERLAP") {
            if let Ok(n) = v.parse() {
                self.ingest.chunk_overlap = n;
            }
        }
        if let Ok(v) = env::var("EMBED_BATCH") {
            if let Ok(n) = v.parse() {
                self.ingest.embed_batch = n;
            }
        }
        if let Ok(v) = env::var("EMBED_RPM") {
            if let Ok(n) = v.parse() {
                self.ingest.embed_rpm = n;
            }
        }
        if let Ok(v) = env::var("RETRIEVAL_TOP_K") {
            if let Ok(n) = v.parse() {
                self.retrieval.top_k = n;
            }
        }
        if let Ok(v) = env::var("MIN_SCORE") {
            if let Ok(n) = v.parse() {
                self.retrieval.min_score = n;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ingest.chunk_overlap >= self.ingest.chunk_size {
            anyhow::bail!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                self.ingest.chunk_overlap,
                self.ingest.chunk_size
            );
        }

        if self.ingest.embed_batch == 0 || self.ingest.embed_batch > 100 {
            anyhow::bail!("embed batch must be in 1..=100");
        }

        if !(0.0..=1.0).contains(&self.retrieval.min_score) {
            anyhow::bail!("min score must be between 0.0 and 1.0");
        }

        if self.queue.worker_concurrency == 0 {
            anyhow::bail!("worker concurrency must be greater than 0");
        }

        if self.blob.max_upload_bytes == 0 {
            anyhow::bail!("max upload size must be greater than 0");
        }

        if self.llm.embed_dimension == 0 {
            anyhow::bail!("embedding dimension must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ingest.chunk_size, 1000);
        assert_eq!(config.ingest.chunk_overlap, 200);
        assert_eq!(config.retrieval.top_k, 10);
        assert_eq!(config.llm.embed_dimension, 3072);
        assert_eq!(config.blob.max_upload_bytes, 50 * 1024 * 1024);
    }

    #[test]
    fn test_validation_rejects_overlap_ge_chunk_size() {
        let mut config = CoreConfig::default();
        config.ingest.chunk_overlap = config.ingest.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_min_score() {
        let mut config = CoreConfig::default();
        config.retrieval.min_score = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_env_overrides() {
        env::set_var("CHUNK_SIZE", "512");
        env::set_var("MONTHLY_TOKEN_BUDGET", "100000");
        env::set_var("MIN_SCORE", "0.55");

        let mut config = CoreConfig::default();
        config.apply_env();

        env::remove_var("CHUNK_SIZE");
        env::remove_var("MONTHLY_TOKEN_BUDGET");
        env::remove_var("MIN_SCORE");

        assert_eq!(config.ingest.chunk_size, 512);
        assert_eq!(config.llm.monthly_token_budget, Some(100_000));
        assert!((config.retrieval.min_score - 0.55).abs() < f32::EPSILON);
    }

    #[test]
    fn test_vector_endpoint_derivation() {
        let mut config = VectorConfig::default();
        config.index_name = "kb".to_string();
        config.environment = "eu-west1-gcp".to_string();
        assert_eq!(
            config.resolved_endpoint(),
            "https://kb.svc.eu-west1-gcp.pinecone.io"
        );

        config.endpoint = Some("http://localhost:9100".to_string());
        assert_eq!(config.resolved_endpoint(), "http://localhost:9100");
    }
}

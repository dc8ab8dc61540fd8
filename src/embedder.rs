//! Batched text embedding with upstream protection
//!
//! The [`Embedder`] wraps a raw [`EmbeddingBackend`] with the policies every
//! caller needs: request batching, a requests-per-minute token bucket,
//! exponential backoff for transient failures, a circuit breaker guarding the
//! upstream, per-tenant monthly budget enforcement, and usage accounting.

use crate::config::{IngestConfig, LlmConfig};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use chrono::Utc;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Result of one upstream embedding call
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f32>>,
    pub tokens: u64,
}

/// Raw embedding transport
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed one batch of texts; the returned vectors are index-aligned
    async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch>;

    /// Embedding dimension produced by the model
    fn dimension(&self) -> usize;
}

/// Usage accounting sink for embedding spend
#[async_trait]
pub trait UsageTracker: Send + Sync {
    /// Record tokens/calls/cost against a tenant's daily counter
    async fn record(&self, tenant: &str, tokens: u64, calls: u64, cost: f64) -> Result<()>;

    /// Total tokens recorded for a tenant in the given `YYYY-MM` month
    async fn month_tokens(&self, tenant: &str, month: &str) -> Result<u64>;
}

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_probe: bool,
}

/// Policy wrapper around an embedding backend
pub struct Embedder {
    backend: Arc<dyn EmbeddingBackend>,
    usage: Arc<dyn UsageTracker>,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    breaker: Mutex<BreakerState>,
    batch_size: usize,
    unit_price: f64,
    monthly_token_budget: Option<u64>,
}

impl Embedder {
    pub fn new(
        backend: Arc<dyn EmbeddingBackend>,
        usage: Arc<dyn UsageTracker>,
        ingest: &IngestConfig,
        llm: &LlmConfig,
    ) -> Self {
        let rpm = NonZeroU32::new(ingest.embed_rpm.max(1)).expect("non-zero rpm");
        Self {
            backend,
            usage,
            limiter: RateLimiter::direct(Quota::per_minute(rpm)),
            breaker: Mutex::new(BreakerState::default()),
            batch_size: ingest.embed_batch.clamp(1, 100),
            unit_price: llm.token_unit_price,
            monthly_token_budget: llm.monthly_token_budget,
        }
    }

    /// Embedding dimension, as surfaced by the backend
    pub fn dimension(&self) -> usize {
        self.backend.dimension()
    }

    /// Embed all texts for a tenant, preserving input order
    pub async fn embed(&self, texts: &[String], tenant: &str) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        self.check_budget(tenant, texts).await?;

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let result = self.call_with_retry(batch).await?;
            if result.vectors.len() != batch.len() {
                return Err(CoreError::PermanentFailure(format!(
                    "embedding backend returned {} vectors for {} inputs",
                    result.vectors.len(),
                    batch.len()
                )));
            }
            self.usage
                .record(
                    tenant,
                    result.tokens,
                    1,
                    result.tokens as f64 * self.unit_price,
                )
                .await?;
            vectors.extend(result.vectors);
        }

        Ok(vectors)
    }

    /// Reject the call up front when the tenant's monthly spend is exhausted
    async fn check_budget(&self, tenant: &str, texts: &[String]) -> Result<()> {
        let Some(budget) = self.monthly_token_budget else {
            return Ok(());
        };

        let month = Utc::now().format("%Y-%m").to_string();
        let used = self.usage.month_tokens(tenant, &month).await?;
        let projected = used + estimate_tokens(texts);
        if projected > budget {
            warn!(
                tenant = %tenant,
                used, projected, budget, "monthly embedding budget exhausted"
            );
            return Err(CoreError::BudgetExceeded {
                tenant: tenant.to_string(),
            });
        }
        Ok(())
    }

    async fn call_with_retry(&self, batch: &[String]) -> Result<EmbeddingBatch> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.check_breaker().await?;
            self.limiter.until_ready().await;

            match self.backend.embed_batch(batch).await {
                Ok(result) => {
                    self.record_success().await;
                    return Ok(result);
                }
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    self.record_failure().await;
                    let delay = backoff_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "embedding call failed, backing off: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        self.record_failure().await;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn check_breaker(&self) -> Result<()> {
        let mut breaker = self.breaker.lock().await;
        if let Some(opened_at) = breaker.opened_at {
            if opened_at.elapsed() < BREAKER_COOLDOWN {
                return Err(CoreError::TransientUpstream(
                    "embedding circuit open".to_string(),
                ));
            }
            if breaker.half_open_probe {
                // one probe call is already in flight
                return Err(CoreError::TransientUpstream(
                    "embedding circuit half-open".to_string(),
                ));
            }
            breaker.half_open_probe = true;
            debug!("embedding circuit half-open, probing upstream");
        }
        Ok(())
    }

    async fn record_success(&self) {
        let mut breaker = self.breaker.lock().await;
        *breaker = BreakerState::default();
    }

    async fn record_failure(&self) {
        let mut breaker = self.breaker.lock().await;
        breaker.consecutive_failures += 1;
        breaker.half_open_probe = false;
        if breaker.consecutive_failures >= BREAKER_THRESHOLD && breaker.opened_at.is_none() {
            warn!(
                failures = breaker.consecutive_failures,
                "opening embedding circuit"
            );
        }
        if breaker.consecutive_failures >= BREAKER_THRESHOLD {
            breaker.opened_at = Some(Instant::now());
        }
    }
}

/// Rough token estimate used only for the pre-flight budget projection
fn estimate_tokens(texts: &[String]) -> u64 {
    texts.iter().map(|t| (t.len() as u64 / 4) + 1).sum()
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.as_millis() as u64 * 2u64.pow(attempt.saturating_sub(1));
    let capped = exp.min(BACKOFF_CAP.as_millis() as u64);
    let jitter = rand::rng().random_range(0..=capped / 4);
    Duration::from_millis(capped + jitter)
}

/// OpenAI-compatible embedding endpoint
pub struct HttpEmbeddingBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
    #[serde(default)]
    usage: EmbeddingUsage,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize, Default)]
struct EmbeddingUsage {
    #[serde(default)]
    total_tokens: u64,
}

impl HttpEmbeddingBackend {
    pub fn new(config: &LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.embed_model.clone(),
            dimension: config.embed_dimension,
        }
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbeddingBackend {
    async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        let url = format!("{}/embeddings", self.base_url);
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::TransientUpstream(format!("embeddings: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| format!("HTTP {}", status));
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                CoreError::TransientUpstream(format!("embeddings ({}): {}", status, text))
            } else {
                CoreError::PermanentFailure(format!("embeddings ({}): {}", status, text))
            });
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| CoreError::TransientUpstream(format!("embeddings response: {}", e)))?;

        parsed.data.sort_by_key(|d| d.index);
        for datum in &parsed.data {
            if datum.embedding.len() != self.dimension {
                return Err(CoreError::PermanentFailure(format!(
                    "model returned dimension {} but {} is configured",
                    datum.embedding.len(),
                    self.dimension
                )));
            }
        }

        Ok(EmbeddingBatch {
            vectors: parsed.data.into_iter().map(|d| d.embedding).collect(),
            tokens: parsed.usage.total_tokens,
        })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

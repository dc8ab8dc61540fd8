//! Multi-agent answering: plan, fan out, synthesize
//!
//! The richer chat path. A planner picks which of the closed set of
//! sub-agents to consult; the selected agents run concurrently under the
//! turn deadline; synthesis fuses whatever completed into one answer with a
//! confidence score. Reasoning steps are appended in completion order.

use crate::error::{CoreError, Result};
use crate::llm::{ChatClient, ChatMessage, GenerationOptions, TokenUsage};
use crate::rag::{EmployeeHit, RagEngine, RagSource, RetrievalRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use utoipa::ToSchema;

/// An external research hit
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// External web-research backend
#[async_trait]
pub trait ResearchClient: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<ResearchHit>>;
}

/// HTTP research client for a hosted search API
pub struct HttpResearchClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

#[derive(Serialize)]
struct ResearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
}

#[derive(Deserialize)]
struct ResearchResponse {
    #[serde(default)]
    results: Vec<ResearchResult>,
}

#[derive(Deserialize)]
struct ResearchResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

impl HttpResearchClient {
    pub fn new(url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .expect("failed to create HTTP client"),
            url: url.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl ResearchClient for HttpResearchClient {
    async fn search(&self, query: &str) -> Result<Vec<ResearchHit>> {
        let response = self
            .client
            .post(&self.url)
            .json(&ResearchRequest {
                api_key: &self.api_key,
                query,
                max_results: 5,
            })
            .send()
            .await
            .map_err(|e| CoreError::TransientUpstream(format!("research: {}", e)))?;

        if !response.status().is_success() {
            return Err(CoreError::TransientUpstream(format!(
                "research: HTTP {}",
                response.status()
            )));
        }

        let parsed: ResearchResponse = response
            .json()
            .await
            .map_err(|e| CoreError::TransientUpstream(format!("research response: {}", e)))?;

        Ok(parsed
            .results
            .into_iter()
            .map(|r| ResearchHit {
                title: r.title,
                url: r.url,
                snippet: r.content,
            })
            .collect())
    }
}

/// The closed set of consultable sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Documents,
    People,
    External,
}

impl SourceKind {
    fn label(&self) -> &'static str {
        match self {
            Self::Documents => "documents",
            Self::People => "people",
            Self::External => "external",
        }
    }
}

/// One entry of the reasoning trace
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReasoningStep {
    pub agent: String,
    pub detail: String,
}

/// Everything the sub-agents surfaced
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SourceSet {
    pub documents: Vec<RagSource>,
    pub employees: Vec<EmployeeHit>,
    pub external: Vec<ResearchHit>,
}

/// Final orchestrated answer
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrchestratorAnswer {
    pub answer: String,
    pub confidence: f32,
    pub reasoning_steps: Vec<ReasoningStep>,
    pub sources: SourceSet,
    pub usage: TokenUsage,
}

/// Shared context cloned into each spawned sub-agent
#[derive(Clone)]
struct AgentContext {
    rag: Arc<RagEngine>,
    research: Option<Arc<dyn ResearchClient>>,
    tenant: String,
    query: String,
}

/// A sub-agent is a tagged variant with one uniform entry point
enum SubAgent {
    Documents,
    People,
    External,
}

struct SubAgentOutput {
    kind: SourceKind,
    detail: String,
    documents: Vec<RagSource>,
    employees: Vec<EmployeeHit>,
    external: Vec<ResearchHit>,
}

impl SubAgent {
    fn for_kind(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Documents => Self::Documents,
            SourceKind::People => Self::People,
            SourceKind::External => Self::External,
        }
    }

    async fn run(self, ctx: AgentContext) -> Result<SubAgentOutput> {
        match self {
            Self::Documents => {
                let documents = ctx
                    .rag
                    .retrieve(&ctx.tenant, &ctx.query, &RetrievalRequest::default())
                    .await?;
                Ok(SubAgentOutput {
                    kind: SourceKind::Documents,
                    detail: format!("document search returned {} hits", documents.len()),
                    documents,
                    employees: Vec::new(),
                    external: Vec::new(),
                })
            }
            Self::People => {
                let employees = ctx.rag.search_employees(&ctx.tenant, &ctx.query, 10).await?;
                Ok(SubAgentOutput {
                    kind: SourceKind::People,
                    detail: format!("people search returned {} hits", employees.len()),
                    documents: Vec::new(),
                    employees,
                    external: Vec::new(),
                })
            }
            Self::External => {
                let Some(research) = &ctx.research else {
                    // not configured; an empty result is not a failure
                    return Ok(SubAgentOutput {
                        kind: SourceKind::External,
                        detail: "research skipped: no credentials configured".to_string(),
                        documents: Vec::new(),
                        employees: Vec::new(),
                        external: Vec::new(),
                    });
                };
                let external = research.search(&ctx.query).await?;
                Ok(SubAgentOutput {
                    kind: SourceKind::External,
                    detail: format!("external research returned {} results", external.len()),
                    documents: Vec::new(),
                    employees: Vec::new(),
                    external,
                })
            }
        }
    }
}

#[derive(Deserialize)]
struct PlannerResponse {
    sources: Vec<SourceKind>,
}

#[derive(Deserialize)]
struct SynthesisResponse {
    answer: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    #[allow(dead_code)]
    sources_used: Vec<String>,
}

/// Plan → parallel sub-agents → synthesize
pub struct Orchestrator {
    rag: Arc<RagEngine>,
    chat: Arc<dyn ChatClient>,
    research: Option<Arc<dyn ResearchClient>>,
    turn_deadline: Duration,
}

impl Orchestrator {
    pub fn new(
        rag: Arc<RagEngine>,
        chat: Arc<dyn ChatClient>,
        research: Option<Arc<dyn ResearchClient>>,
        turn_deadline: Duration,
    ) -> Self {
        Self {
            rag,
            chat,
            research,
            turn_deadline,
        }
    }

    /// Answer a query through the multi-agent path
    pub async fn run(&self, tenant: &str, query: &str) -> Result<OrchestratorAnswer> {
        let started = tokio::time::Instant::now();
        let mut usage = TokenUsage::default();
        let mut steps = Vec::new();

        let selected = self.plan(query, &mut usage).await;
        steps.push(ReasoningStep {
            agent: "planner".to_string(),
            detail: format!(
                "consulting: {}",
                selected
                    .iter()
                    .map(|k| k.label())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        });

        let ctx = AgentContext {
            rag: self.rag.clone(),
            research: self.research.clone(),
            tenant: tenant.to_string(),
            query: query.to_string(),
        };

        let mut join_set = JoinSet::new();
        for kind in &selected {
            let agent = SubAgent::for_kind(*kind);
            let ctx = ctx.clone();
            join_set.spawn(async move { agent.run(ctx).await });
        }

        let mut sources = SourceSet::default();
        loop {
            let remaining = self
                .turn_deadline
                .saturating_sub(started.elapsed());
            let next = tokio::time::timeout(remaining, join_set.join_next()).await;
            match next {
                Ok(Some(Ok(Ok(output)))) => {
                    steps.push(ReasoningStep {
                        agent: output.kind.label().to_string(),
                        detail: output.detail,
                    });
                    sources.documents.extend(output.documents);
                    sources.employees.extend(output.employees);
                    sources.external.extend(output.external);
                }
                Ok(Some(Ok(Err(e)))) => {
                    // one agent failing does not sink the turn
                    warn!("sub-agent failed: {}", e);
                    steps.push(ReasoningStep {
                        agent: "error".to_string(),
                        detail: e.to_string(),
                    });
                }
                Ok(Some(Err(join_err))) => {
                    warn!("sub-agent panicked: {}", join_err);
                }
                Ok(None) => break,
                Err(_) => {
                    // deadline: cancel the stragglers and answer from what we
                    // have
                    join_set.abort_all();
                    steps.push(ReasoningStep {
                        agent: "orchestrator".to_string(),
                        detail: "turn deadline reached, synthesizing from completed agents"
                            .to_string(),
                    });
                    break;
                }
            }
        }

        let (answer, confidence) = self.synthesize(query, &sources, &mut usage).await?;
        steps.push(ReasoningStep {
            agent: "synthesis".to_string(),
            detail: format!("confidence {:.2}", confidence),
        });

        debug!(tenant, steps = steps.len(), "orchestration complete");
        Ok(OrchestratorAnswer {
            answer,
            confidence,
            reasoning_steps: steps,
            sources,
            usage,
        })
    }

    /// Classify the query into the subset of sources worth consulting
    async fn plan(&self, query: &str, usage: &mut TokenUsage) -> Vec<SourceKind> {
        let messages = [
            ChatMessage::system(
                "Decide which sources can answer the user's question. Respond \
                 with a JSON object {\"sources\": [...]} choosing any of \
                 \"documents\" (internal document search), \"people\" \
                 (employee expertise search), \"external\" (public web \
                 research). Pick only what is useful.",
            ),
            ChatMessage::user(query.to_string()),
        ];
        let options = GenerationOptions {
            temperature: 0.0,
            max_tokens: 128,
            json: true,
        };

        match self.chat.generate(&messages, &options).await {
            Ok(response) => {
                usage.add(response.usage);
                match serde_json::from_str::<PlannerResponse>(response.text.trim()) {
                    Ok(plan) if !plan.sources.is_empty() => {
                        let mut sources = plan.sources;
                        sources.dedup();
                        sources
                    }
                    _ => vec![SourceKind::Documents],
                }
            }
            Err(e) => {
                warn!("planner failed, defaulting to document search: {}", e);
                vec![SourceKind::Documents]
            }
        }
    }

    async fn synthesize(
        &self,
        query: &str,
        sources: &SourceSet,
        usage: &mut TokenUsage,
    ) -> Result<(String, f32)> {
        let mut context = String::new();
        if !sources.documents.is_empty() {
            context.push_str("Internal documents:\n");
            for (i, doc) in sources.documents.iter().enumerate() {
                context.push_str(&format!(
                    "[{}] ({}) {}\n",
                    i + 1,
                    doc.filename,
                    doc.chunk_text
                ));
            }
        }
        if !sources.employees.is_empty() {
            context.push_str("\nPeople:\n");
            for hit in &sources.employees {
                context.push_str(&format!("- {}: {}\n", hit.user_id, hit.profile_snapshot));
            }
        }
        if !sources.external.is_empty() {
            context.push_str("\nExternal research:\n");
            for hit in &sources.external {
                context.push_str(&format!("- {} ({}): {}\n", hit.title, hit.url, hit.snippet));
            }
        }
        if context.is_empty() {
            context.push_str("(no sources returned anything)\n");
        }

        let messages = [
            ChatMessage::system(
                "Fuse the gathered evidence into one answer. If sources \
                 contradict each other, say so explicitly in the answer. \
                 Respond with a JSON object: {\"answer\": string, \
                 \"confidence\": number between 0 and 1, \"sources_used\": \
                 array of source labels}.",
            ),
            ChatMessage::user(format!("{}\nQuestion: {}", context, query)),
        ];
        let options = GenerationOptions {
            temperature: 0.3,
            max_tokens: 1024,
            json: true,
        };

        let response = self.chat.generate(&messages, &options).await?;
        usage.add(response.usage);

        match serde_json::from_str::<SynthesisResponse>(response.text.trim()) {
            Ok(synthesis) => Ok((synthesis.answer, synthesis.confidence.clamp(0.0, 1.0))),
            Err(_) => Ok((response.text, 0.5)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IngestConfig, LlmConfig, RetrievalConfig};
    use crate::embedder::{Embedder, EmbeddingBackend, EmbeddingBatch, UsageTracker};
    use crate::llm::GenerationResponse;
    use crate::store::test_store;
    use crate::vector::InMemoryVectorIndex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlatBackend;

    #[async_trait]
    impl EmbeddingBackend for FlatBackend {
        async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch> {
            Ok(EmbeddingBatch {
                vectors: texts.iter().map(|_| vec![1.0, 0.0]).collect(),
                tokens: 1,
            })
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    struct NullUsage;

    #[async_trait]
    impl UsageTracker for NullUsage {
        async fn record(&self, _: &str, _: u64, _: u64, _: f64) -> Result<()> {
            Ok(())
        }
        async fn month_tokens(&self, _: &str, _: &str) -> Result<u64> {
            Ok(0)
        }
    }

    /// First call returns the plan, second call the synthesis
    struct PlanThenSynthChat {
        plan: String,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChatClient for PlanThenSynthChat {
        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _options: &GenerationOptions,
        ) -> Result<GenerationResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let text = if call == 0 {
                self.plan.clone()
            } else {
                serde_json::json!({
                    "answer": "Synthesized answer.",
                    "confidence": 0.8,
                    "sources_used": ["documents"]
                })
                .to_string()
            };
            Ok(GenerationResponse {
                text,
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 10,
                    total_tokens: 20,
                },
                model: "scripted".to_string(),
            })
        }
    }

    struct SlowResearch;

    #[async_trait]
    impl ResearchClient for SlowResearch {
        async fn search(&self, _query: &str) -> Result<Vec<ResearchHit>> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(vec![])
        }
    }

    async fn orchestrator(
        plan: &str,
        research: Option<Arc<dyn ResearchClient>>,
        deadline: Duration,
    ) -> Orchestrator {
        let store = test_store().await;
        let embedder = Arc::new(Embedder::new(
            Arc::new(FlatBackend),
            Arc::new(NullUsage),
            &IngestConfig::default(),
            &LlmConfig::default(),
        ));
        let chat: Arc<dyn ChatClient> = Arc::new(PlanThenSynthChat {
            plan: plan.to_string(),
            calls: AtomicU32::new(0),
        });
        let rag = Arc::new(RagEngine::new(
            embedder,
            Arc::new(InMemoryVectorIndex::new()),
            store,
            chat.clone(),
            RetrievalConfig::default(),
        ));
        Orchestrator::new(rag, chat, research, deadline)
    }

    #[tokio::test]
    async fn test_planner_decision_is_first_step() {
        let orch = orchestrator(
            r#"{"sources": ["documents", "people"]}"#,
            None,
            Duration::from_secs(60),
        )
        .await;
        let answer = orch.run("7", "who knows about billing?").await.unwrap();

        assert_eq!(answer.reasoning_steps[0].agent, "planner");
        assert!(answer.reasoning_steps[0].detail.contains("documents"));
        assert!(answer.reasoning_steps[0].detail.contains("people"));
        assert_eq!(answer.answer, "Synthesized answer.");
        assert!((answer.confidence - 0.8).abs() < f32::EPSILON);

        // both agents reported before synthesis
        let agents: Vec<&str> = answer
            .reasoning_steps
            .iter()
            .map(|s| s.agent.as_str())
            .collect();
        assert!(agents.contains(&"documents"));
        assert!(agents.contains(&"people"));
        assert_eq!(*agents.last().unwrap(), "synthesis");
    }

    #[tokio::test]
    async fn test_invalid_plan_defaults_to_documents() {
        let orch = orchestrator("planner exploded", None, Duration::from_secs(60)).await;
        let answer = orch.run("7", "anything").await.unwrap();
        assert!(answer.reasoning_steps[0].detail.contains("documents"));
        assert!(!answer.reasoning_steps[0].detail.contains("people"));
    }

    #[tokio::test]
    async fn test_missing_research_credentials_is_non_fatal() {
        let orch = orchestrator(
            r#"{"sources": ["external"]}"#,
            None,
            Duration::from_secs(60),
        )
        .await;
        let answer = orch.run("7", "industry news").await.unwrap();

        let external_step = answer
            .reasoning_steps
            .iter()
            .find(|s| s.agent == "external")
            .unwrap();
        assert!(external_step.detail.contains("no credentials"));
        assert!(answer.sources.external.is_empty());
        assert_eq!(answer.answer, "Synthesized answer.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_stragglers_and_synthesizes() {
        let orch = orchestrator(
            r#"{"sources": ["documents", "external"]}"#,
            Some(Arc::new(SlowResearch)),
            Duration::from_secs(60),
        )
        .await;
        let answer = orch.run("7", "mixed question").await.unwrap();

        // the slow research agent never completed
        let agents: Vec<&str> = answer
            .reasoning_steps
            .iter()
            .map(|s| s.agent.as_str())
            .collect();
        assert!(agents.contains(&"documents"));
        assert!(agents.contains(&"orchestrator"));
        assert!(!agents.contains(&"external"));
        assert_eq!(answer.answer, "Synthesized answer.");
    }
}

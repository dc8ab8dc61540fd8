//! LLM-driven multi-dimensional document classification
//!
//! The classifier sees the leading chunks of a document, its filename, and
//! the tenant's existing organizational vocabulary, and produces the
//! structured label record. Classification never blocks document completion:
//! any failure after one retry degrades to a heuristic fallback.

use crate::error::{CoreError, Result};
use crate::extract::FileType;
use crate::llm::{ChatClient, ChatMessage, GenerationOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use utoipa::ToSchema;

/// Confidentiality levels, least to most restricted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Confidentiality {
    Public,
    Internal,
    Confidential,
    Restricted,
}

/// The structured label attached to a document
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DocumentClassification {
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    pub doc_type: String,
    #[serde(default)]
    pub time_period: Option<String>,
    pub confidentiality: Confidentiality,
    #[serde(default)]
    pub people: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub confidence: HashMap<String, f32>,
}

impl DocumentClassification {
    /// Reject confidence values outside [0,1] instead of normalizing
    pub fn validate(&self) -> Result<()> {
        for (field, value) in &self.confidence {
            if !(0.0..=1.0).contains(value) {
                return Err(CoreError::Validation(format!(
                    "confidence for {} is {} (outside [0,1])",
                    field, value
                )));
            }
        }
        Ok(())
    }
}

/// Existing vocabulary of a tenant, offered to the model for consistency
#[derive(Debug, Clone, Default)]
pub struct OrgContext {
    pub teams: Vec<String>,
    pub projects: Vec<String>,
    pub doc_types: Vec<String>,
}

const FALLBACK_CONFIDENCE: f32 = 0.3;

const SYSTEM_PROMPT: &str = "You are a document classification engine for an \
organizational knowledge base. Respond with a single JSON object containing \
exactly these fields: team (string or null), project (string or null), \
doc_type (string), time_period (string or null, e.g. \"2024-Q1\"), \
confidentiality (one of: public, internal, confidential, restricted), \
people (array of person names mentioned), tags (array of topical keywords), \
summary (one or two sentences), confidence (object mapping each field name \
to a number between 0 and 1). Prefer values from the organization's existing \
vocabulary when they fit.";

/// Document classifier with heuristic fallback
pub struct Classifier {
    chat: Arc<dyn ChatClient>,
}

impl Classifier {
    pub fn new(chat: Arc<dyn ChatClient>) -> Self {
        Self { chat }
    }

    /// Classify a document; degrades to a fallback label, never fails
    pub async fn classify(
        &self,
        filename: &str,
        file_type: FileType,
        excerpt: &str,
        context: &OrgContext,
    ) -> DocumentClassification {
        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(build_prompt(filename, excerpt, context)),
        ];
        let options = GenerationOptions {
            // low temperature keeps the categorical fields stable
            temperature: 0.1,
            max_tokens: 1024,
            json: true,
        };

        for attempt in 0..2 {
            match self.chat.generate(&messages, &options).await {
                Ok(response) => match parse_classification(&response.text) {
                    Ok(classification) => return classification,
                    Err(e) => {
                        warn!(attempt, "classifier returned invalid JSON: {}", e);
                    }
                },
                Err(e) => {
                    warn!(attempt, "classifier call failed: {}", e);
                }
            }
        }

        warn!(filename, "falling back to heuristic classification");
        fallback_classification(filename, file_type)
    }
}

fn build_prompt(filename: &str, excerpt: &str, context: &OrgContext) -> String {
    let mut prompt = format!("Filename: {}\n", filename);
    if !context.teams.is_empty() {
        prompt.push_str(&format!("Known teams: {}\n", context.teams.join(", ")));
    }
    if !context.projects.is_empty() {
        prompt.push_str(&format!(
            "Known projects: {}\n",
            context.projects.join(", ")
        ));
    }
    if !context.doc_types.is_empty() {
        prompt.push_str(&format!(
            "Known document types: {}\n",
            context.doc_types.join(", ")
        ));
    }
    prompt.push_str("\nDocument excerpt:\n");
    prompt.push_str(excerpt);
    prompt
}

/// Parse and validate the model's JSON answer
pub fn parse_classification(text: &str) -> Result<DocumentClassification> {
    // models occasionally wrap JSON in a code fence despite instructions
    let trimmed = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let classification: DocumentClassification = serde_json::from_str(trimmed)?;
    classification.validate()?;
    Ok(classification)
}

/// Heuristic classification used when the model is unavailable
pub fn fallback_classification(filename: &str, file_type: FileType) -> DocumentClassification {
    let lower = filename.to_ascii_lowercase();
    let doc_type = if lower.contains("invoice") {
        "invoice"
    } else if lower.contains("policy") {
        "policy"
    } else if lower.contains("contract") || lower.contains("agreement") {
        "contract"
    } else if lower.contains("report") {
        "report"
    } else if lower.contains("minutes") || lower.contains("meeting") {
        "meeting_notes"
    } else if lower.contains("resume") || lower.contains("cv") {
        "resume"
    } else {
        match file_type {
            FileType::Csv => "spreadsheet",
            FileType::Md => "notes",
            _ => "document",
        }
    };

    let fields = [
        "team",
        "project",
        "doc_type",
        "time_period",
        "confidentiality",
        "people",
        "tags",
        "summary",
    ];

    DocumentClassification {
        team: None,
        project: None,
        doc_type: doc_type.to_string(),
        time_period: None,
        confidentiality: Confidentiality::Internal,
        people: Vec::new(),
        tags: Vec::new(),
        summary: String::new(),
        confidence: fields
            .iter()
            .map(|f| (f.to_string(), FALLBACK_CONFIDENCE))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::llm::GenerationResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedChat {
        responses: tokio::sync::Mutex<Vec<Result<String>>>,
        calls: AtomicU32,
    }

    impl ScriptedChat {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: tokio::sync::Mutex::new(responses),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedChat {
        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _options: &GenerationOptions,
        ) -> Result<GenerationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                return Err(CoreError::TransientUpstream("script exhausted".into()));
            }
            responses.remove(0).map(|text| GenerationResponse {
                text,
                usage: Default::default(),
                model: "scripted".to_string(),
            })
        }
    }

    fn valid_json() -> String {
        serde_json::json!({
            "team": "People Ops",
            "project": null,
            "doc_type": "policy",
            "time_period": "2024-Q1",
            "confidentiality": "internal",
            "people": ["Ada Lovelace"],
            "tags": ["hiring"],
            "summary": "Hiring policy effective 2024-Q1.",
            "confidence": {"doc_type": 0.95, "team": 0.7}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_classify_parses_model_output() {
        let chat = Arc::new(ScriptedChat::new(vec![Ok(valid_json())]));
        let classifier = Classifier::new(chat.clone());

        let result = classifier
            .classify(
                "hiring-policy.pdf",
                FileType::Pdf,
                "Hiring policy effective 2024-Q1.",
                &OrgContext::default(),
            )
            .await;

        assert_eq!(result.doc_type, "policy");
        assert_eq!(result.confidentiality, Confidentiality::Internal);
        assert_eq!(result.time_period.as_deref(), Some("2024-Q1"));
        assert_eq!(chat.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_json_retries_then_falls_back() {
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok("not json at all".to_string()),
            Ok("{ still broken".to_string()),
        ]));
        let classifier = Classifier::new(chat.clone());

        let result = classifier
            .classify(
                "board-meeting-minutes.docx",
                FileType::Docx,
                "Minutes of the board meeting.",
                &OrgContext::default(),
            )
            .await;

        assert_eq!(chat.calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.doc_type, "meeting_notes");
        assert_eq!(result.confidentiality, Confidentiality::Internal);
        assert!(result.tags.is_empty());
        assert!(result
            .confidence
            .values()
            .all(|v| (*v - FALLBACK_CONFIDENCE).abs() < f32::EPSILON));
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_is_rejected() {
        let bad = serde_json::json!({
            "doc_type": "report",
            "confidentiality": "public",
            "confidence": {"doc_type": 1.7}
        })
        .to_string();

        assert!(parse_classification(&bad).is_err());

        // and end-to-end it degrades to the fallback
        let chat = Arc::new(ScriptedChat::new(vec![Ok(bad.clone()), Ok(bad)]));
        let classifier = Classifier::new(chat);
        let result = classifier
            .classify("metrics.csv", FileType::Csv, "a,b", &OrgContext::default())
            .await;
        assert_eq!(result.doc_type, "spreadsheet");
    }

    #[tokio::test]
    async fn test_llm_outage_falls_back_without_error() {
        let chat = Arc::new(ScriptedChat::new(vec![]));
        let classifier = Classifier::new(chat);
        let result = classifier
            .classify(
                "notes.md",
                FileType::Md,
                "some notes",
                &OrgContext::default(),
            )
            .await;
        assert_eq!(result.doc_type, "notes");
    }

    #[test]
    fn test_parse_strips_code_fences() {
        let fenced = format!("```json\n{}\n```", valid_json());
        let parsed = parse_classification(&fenced).unwrap();
        assert_eq!(parsed.doc_type, "policy");
    }

    #[test]
    fn test_fallback_keyword_heuristics() {
        assert_eq!(
            fallback_classification("Q3-INVOICE-0042.pdf", FileType::Pdf).doc_type,
            "invoice"
        );
        assert_eq!(
            fallback_classification("employment_contract.docx", FileType::Docx).doc_type,
            "contract"
        );
        assert_eq!(
            fallback_classification("random.txt", FileType::Txt).doc_type,
            "document"
        );
    }
}

//! Namespaced vector index adapter
//!
//! One namespace per tenant (`tenant:{org_id}`) over a cosine-similarity
//! index. The HTTP implementation targets a hosted index; the in-memory
//! implementation backs tests and local development with the same contract.

use crate::config::VectorConfig;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Namespace for a tenant's vectors
pub fn namespace_for(tenant: &str) -> String {
    format!("tenant:{}", tenant)
}

/// Stable vector id for a document chunk
pub fn chunk_vector_id(doc_id: Uuid, index: i64) -> String {
    format!("doc_{}_chunk_{}", doc_id, index)
}

/// Prefix shared by every chunk vector of a document
pub fn chunk_vector_prefix(doc_id: Uuid) -> String {
    format!("doc_{}_chunk_", doc_id)
}

/// Stable vector id for an employee profile embedding
pub fn employee_vector_id(user_id: &str) -> String {
    format!("employee_{}", user_id)
}

/// Recover `(document, chunk index)` from a chunk vector id
pub fn parse_chunk_vector_id(id: &str) -> Option<(Uuid, i64)> {
    let rest = id.strip_prefix("doc_")?;
    let (doc, index) = rest.split_once("_chunk_")?;
    Some((Uuid::parse_str(doc).ok()?, index.parse().ok()?))
}

/// An item to upsert
#[derive(Debug, Clone, Serialize)]
pub struct VectorItem {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: Map<String, Value>,
}

/// One search hit
#[derive(Debug, Clone, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Tenant-scoped vector index operations
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Upsert items into a namespace
    async fn upsert(&self, namespace: &str, items: Vec<VectorItem>) -> Result<()>;

    /// Top-k cosine search with an optional metadata filter
    async fn search(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<Value>,
    ) -> Result<Vec<VectorMatch>>;

    /// Merge fields into an existing vector's metadata without touching its
    /// values; updating a missing vector is a no-op
    async fn update_metadata(
        &self,
        namespace: &str,
        id: &str,
        metadata: Map<String, Value>,
    ) -> Result<()>;

    /// Remove every chunk vector belonging to a document
    async fn delete_document(&self, namespace: &str, doc_id: Uuid) -> Result<()>;

    /// Remove a single vector by id
    async fn delete_id(&self, namespace: &str, id: &str) -> Result<()>;

    /// Drop an entire tenant namespace
    async fn delete_namespace(&self, namespace: &str) -> Result<()>;
}

/// Keep only scalars and flat string/number arrays; truncate long strings
pub fn sanitize_metadata(metadata: Map<String, Value>, max_len: usize) -> Map<String, Value> {
    let mut clean = Map::new();
    for (key, value) in metadata {
        match value {
            Value::String(s) => {
                clean.insert(key, Value::String(truncate(s, max_len)));
            }
            Value::Bool(_) | Value::Number(_) => {
                clean.insert(key, value);
            }
            Value::Array(items) => {
                if items
                    .iter()
                    .all(|v| matches!(v, Value::String(_) | Value::Number(_)))
                {
                    let flat = items
                        .into_iter()
                        .map(|v| match v {
                            Value::String(s) => Value::String(truncate(s, max_len)),
                            other => other,
                        })
                        .collect();
                    clean.insert(key, Value::Array(flat));
                }
            }
            // nested objects and nulls are not representable upstream
            Value::Object(_) | Value::Null => {}
        }
    }
    clean
}

fn truncate(s: String, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s
    } else {
        s.chars().take(max_len).collect()
    }
}

/// Hosted cosine index over HTTP
pub struct HttpVectorIndex {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    index_name: String,
    dimension: usize,
    batch_size: usize,
    metadata_max_len: usize,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    namespace: &'a str,
    vectors: &'a [VectorItem],
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    namespace: &'a str,
    vector: &'a [f32],
    #[serde(rename = "topK")]
    top_k: usize,
    #[serde(rename = "includeMetadata")]
    include_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Value>,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<VectorMatch>,
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    namespace: &'a str,
    id: &'a str,
    #[serde(rename = "setMetadata")]
    set_metadata: Map<String, Value>,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    namespace: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Value>,
    #[serde(rename = "deleteAll", skip_serializing_if = "Option::is_none")]
    delete_all: Option<bool>,
}

#[derive(Serialize)]
struct CreateIndexRequest<'a> {
    name: &'a str,
    dimension: usize,
    metric: &'a str,
}

impl HttpVectorIndex {
    /// `dimension` comes from the embedder, never from a constant
    pub fn new(config: &VectorConfig, dimension: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            endpoint: config.resolved_endpoint(),
            api_key: config.api_key.clone(),
            index_name: config.index_name.clone(),
            dimension,
            batch_size: config.upsert_batch.clamp(1, 100),
            metadata_max_len: config.metadata_max_len,
        }
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), path);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.header("Api-Key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| CoreError::TransientUpstream(format!("vector index: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| format!("HTTP {}", status));
        Err(match status.as_u16() {
            404 => CoreError::NotFound(format!("vector index: {}", text)),
            429 | 500..=599 => {
                CoreError::TransientUpstream(format!("vector index ({}): {}", status, text))
            }
            _ => CoreError::PermanentFailure(format!("vector index ({}): {}", status, text)),
        })
    }

    /// Create the index with the embedder's dimension and cosine metric
    async fn create_index(&self) -> Result<()> {
        info!(
            index = %self.index_name,
            dimension = self.dimension,
            "creating vector index"
        );
        self.post(
            "indexes",
            &CreateIndexRequest {
                name: &self.index_name,
                dimension: self.dimension,
                metric: "cosine",
            },
        )
        .await?;
        Ok(())
    }

    async fn upsert_batch(&self, namespace: &str, batch: &[VectorItem]) -> Result<()> {
        let request = UpsertRequest {
            namespace,
            vectors: batch,
        };
        match self.post("vectors/upsert", &request).await {
            Ok(_) => Ok(()),
            // index does not exist yet; create it lazily and retry once
            Err(CoreError::NotFound(_)) => {
                self.create_index().await?;
                self.post("vectors/upsert", &request).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn upsert(&self, namespace: &str, items: Vec<VectorItem>) -> Result<()> {
        let items: Vec<VectorItem> = items
            .into_iter()
            .map(|mut item| {
                item.metadata = sanitize_metadata(item.metadata, self.metadata_max_len);
                item
            })
            .collect();

        for batch in items.chunks(self.batch_size) {
            self.upsert_batch(namespace, batch).await?;
        }
        debug!(namespace = %namespace, count = items.len(), "upserted vectors");
        Ok(())
    }

    async fn search(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<Value>,
    ) -> Result<Vec<VectorMatch>> {
        let response = self
            .post(
                "query",
                &QueryRequest {
                    namespace,
                    vector: query,
                    top_k,
                    include_metadata: true,
                    filter,
                },
            )
            .await?;

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| CoreError::TransientUpstream(format!("vector response: {}", e)))?;
        Ok(parsed.matches)
    }

    async fn update_metadata(
        &self,
        namespace: &str,
        id: &str,
        metadata: Map<String, Value>,
    ) -> Result<()> {
        let request = UpdateRequest {
            namespace,
            id,
            set_metadata: sanitize_metadata(metadata, self.metadata_max_len),
        };
        match self.post("vectors/update", &request).await {
            Ok(_) => Ok(()),
            // the vector may already be gone under eventual consistency
            Err(CoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_document(&self, namespace: &str, doc_id: Uuid) -> Result<()> {
        // chunk vectors carry their document id in metadata, which lets the
        // upstream delete by filter instead of listing the id pattern
        self.post(
            "vectors/delete",
            &DeleteRequest {
                namespace,
                ids: None,
                filter: Some(serde_json::json!({"doc_id": {"$eq": doc_id.to_string()}})),
                delete_all: None,
            },
        )
        .await?;
        Ok(())
    }

    async fn delete_id(&self, namespace: &str, id: &str) -> Result<()> {
        self.post(
            "vectors/delete",
            &DeleteRequest {
                namespace,
                ids: Some(vec![id.to_string()]),
                filter: None,
                delete_all: None,
            },
        )
        .await?;
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        self.post(
            "vectors/delete",
            &DeleteRequest {
                namespace,
                ids: None,
                filter: None,
                delete_all: Some(true),
            },
        )
        .await?;
        Ok(())
    }
}

/// In-process cosine index for tests and local development
pub struct InMemoryVectorIndex {
    namespaces: Arc<RwLock<HashMap<String, HashMap<String, (Vec<f32>, Map<String, Value>)>>>>,
    metadata_max_len: usize,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            namespaces: Arc::new(RwLock::new(HashMap::new())),
            metadata_max_len: 2000,
        }
    }

    /// Total vectors held in a namespace
    pub async fn namespace_len(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map(|ns| ns.len())
            .unwrap_or(0)
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a * norm_b)
    }

    fn matches_filter(metadata: &Map<String, Value>, filter: &Value) -> bool {
        let Some(conditions) = filter.as_object() else {
            return true;
        };
        conditions.iter().all(|(field, expected)| {
            let actual = metadata.get(field);
            match expected {
                Value::Object(op) => match (op.get("$eq"), actual) {
                    (Some(want), Some(have)) => want == have,
                    _ => false,
                },
                want => actual == Some(want),
            }
        })
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, namespace: &str, items: Vec<VectorItem>) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        let ns = namespaces.entry(namespace.to_string()).or_default();
        for item in items {
            let metadata = sanitize_metadata(item.metadata, self.metadata_max_len);
            ns.insert(item.id, (item.values, metadata));
        }
        Ok(())
    }

    async fn search(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<Value>,
    ) -> Result<Vec<VectorMatch>> {
        let namespaces = self.namespaces.read().await;
        let Some(ns) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<VectorMatch> = ns
            .iter()
            .filter(|(_, (_, metadata))| {
                filter
                    .as_ref()
                    .map(|f| Self::matches_filter(metadata, f))
                    .unwrap_or(true)
            })
            .map(|(id, (values, metadata))| VectorMatch {
                id: id.clone(),
                score: Self::cosine_similarity(query, values),
                metadata: metadata.clone(),
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn update_metadata(
        &self,
        namespace: &str,
        id: &str,
        metadata: Map<String, Value>,
    ) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        if let Some((_, existing)) = namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.get_mut(id))
        {
            for (key, value) in sanitize_metadata(metadata, self.metadata_max_len) {
                existing.insert(key, value);
            }
        }
        Ok(())
    }

    async fn delete_document(&self, namespace: &str, doc_id: Uuid) -> Result<()> {
        let prefix = chunk_vector_prefix(doc_id);
        let mut namespaces = self.namespaces.write().await;
        if let Some(ns) = namespaces.get_mut(namespace) {
            ns.retain(|id, _| !id.starts_with(&prefix));
        }
        Ok(())
    }

    async fn delete_id(&self, namespace: &str, id: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        if let Some(ns) = namespaces.get_mut(namespace) {
            ns.remove(id);
        }
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        self.namespaces.write().await.remove(namespace);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, values: Vec<f32>, metadata: Value) -> VectorItem {
        VectorItem {
            id: id.to_string(),
            values,
            metadata: metadata.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_vector_id_shapes() {
        let doc = Uuid::nil();
        assert_eq!(
            chunk_vector_id(doc, 3),
            format!("doc_{}_chunk_3", Uuid::nil())
        );
        assert_eq!(employee_vector_id("u1"), "employee_u1");
        assert_eq!(namespace_for("7"), "tenant:7");
    }

    #[test]
    fn test_parse_chunk_vector_id() {
        let doc = Uuid::new_v4();
        assert_eq!(
            parse_chunk_vector_id(&chunk_vector_id(doc, 7)),
            Some((doc, 7))
        );
        assert_eq!(parse_chunk_vector_id("employee_u1"), None);
        assert_eq!(parse_chunk_vector_id("doc_nonsense_chunk_x"), None);
    }

    #[test]
    fn test_sanitize_metadata_drops_nested_and_truncates() {
        let metadata = json!({
            "filename": "a".repeat(30),
            "page": 3,
            "people": ["Ada", "Grace"],
            "nested": {"x": 1},
            "mixed": ["a", {"b": 1}],
            "none": null
        });
        let clean = sanitize_metadata(metadata.as_object().unwrap().clone(), 10);

        assert_eq!(clean.get("filename").unwrap(), &json!("aaaaaaaaaa"));
        assert_eq!(clean.get("page").unwrap(), &json!(3));
        assert_eq!(clean.get("people").unwrap(), &json!(["Ada", "Grace"]));
        assert!(!clean.contains_key("nested"));
        assert!(!clean.contains_key("mixed"));
        assert!(!clean.contains_key("none"));
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(
                "tenant:7",
                vec![
                    item("a", vec![1.0, 0.0, 0.0], json!({})),
                    item("b", vec![0.9, 0.1, 0.0], json!({})),
                    item("c", vec![0.0, 1.0, 0.0], json!({})),
                ],
            )
            .await
            .unwrap();

        let matches = index
            .search("tenant:7", &[1.0, 0.0, 0.0], 2, None)
            .await
            .unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, "a");
        assert_eq!(matches[1].id, "b");
        assert!(matches[0].score > matches[1].score);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert("tenant:7", vec![item("a", vec![1.0, 0.0], json!({}))])
            .await
            .unwrap();

        let matches = index
            .search("tenant:8", &[1.0, 0.0], 10, None)
            .await
            .unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn test_metadata_filter() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(
                "tenant:7",
                vec![
                    item("a", vec![1.0, 0.0], json!({"doc_type": "policy"})),
                    item("b", vec![1.0, 0.0], json!({"doc_type": "report"})),
                ],
            )
            .await
            .unwrap();

        let matches = index
            .search(
                "tenant:7",
                &[1.0, 0.0],
                10,
                Some(json!({"doc_type": {"$eq": "policy"}})),
            )
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "a");
    }

    #[tokio::test]
    async fn test_update_metadata_merges_fields() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(
                "tenant:7",
                vec![item("a", vec![1.0, 0.0], json!({"kind": "chunk"}))],
            )
            .await
            .unwrap();

        index
            .update_metadata(
                "tenant:7",
                "a",
                json!({"doc_type": "policy"}).as_object().cloned().unwrap(),
            )
            .await
            .unwrap();

        let matches = index
            .search(
                "tenant:7",
                &[1.0, 0.0],
                10,
                Some(json!({"kind": {"$eq": "chunk"}, "doc_type": {"$eq": "policy"}})),
            )
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        // existing fields survive the merge
        assert_eq!(matches[0].metadata.get("kind").unwrap(), &json!("chunk"));

        // updating a missing vector is a no-op
        index
            .update_metadata(
                "tenant:7",
                "ghost",
                json!({"doc_type": "policy"}).as_object().cloned().unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_document_removes_chunk_pattern() {
        let index = InMemoryVectorIndex::new();
        let doc = Uuid::new_v4();
        let other = Uuid::new_v4();
        index
            .upsert(
                "tenant:7",
                vec![
                    item(&chunk_vector_id(doc, 0), vec![1.0, 0.0], json!({})),
                    item(&chunk_vector_id(doc, 1), vec![1.0, 0.0], json!({})),
                    item(&chunk_vector_id(other, 0), vec![1.0, 0.0], json!({})),
                    item(&employee_vector_id("u1"), vec![1.0, 0.0], json!({})),
                ],
            )
            .await
            .unwrap();

        index.delete_document("tenant:7", doc).await.unwrap();
        assert_eq!(index.namespace_len("tenant:7").await, 2);
    }
}

//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the narrow contract the pipeline needs from
//! the vector store: upsert vectors with chunk metadata into a namespace, and
//! query a namespace for the nearest neighbours of a vector. Implementations:
//!
//! - **[`PineconeIndex`]** — the Pinecone data-plane HTTP API.
//! - **[`InMemoryIndex`]** — brute-force cosine similarity behind a
//!   `RwLock`, for local runs and tests.
//!
//! Records are keyed by the chunk key (`"{source}#{index}"`), so upserting
//! the same chunk twice overwrites rather than duplicates.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::config::IndexConfig;
use crate::embedding::cosine_similarity;
use crate::error::RagError;
use crate::models::Chunk;

/// A chunk and its embedding, ready to upsert.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A nearest-neighbour match with its reconstructed chunk.
#[derive(Debug, Clone)]
pub struct IndexMatch {
    pub chunk: Chunk,
    pub score: f32,
}

/// Abstract vector index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or overwrite records by chunk key |
/// | [`query`](VectorIndex::query) | Top-k similarity search, best match first |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or overwrite records. Returns the number of records written.
    async fn upsert(&self, namespace: &str, records: &[IndexRecord]) -> Result<usize, RagError>;

    /// Return up to `top_k` matches ordered by descending score. An empty
    /// namespace yields an empty vec.
    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<IndexMatch>, RagError>;
}

/// Create the configured index implementation.
pub fn create_index(config: &IndexConfig) -> anyhow::Result<Arc<dyn VectorIndex>> {
    match config.kind.as_str() {
        "pinecone" => Ok(Arc::new(PineconeIndex::new(config)?)),
        "memory" => Ok(Arc::new(InMemoryIndex::new())),
        other => anyhow::bail!("Unknown index kind: {}", other),
    }
}

// ============ In-memory ============

/// In-memory index for tests and local development.
pub struct InMemoryIndex {
    namespaces: RwLock<HashMap<String, HashMap<String, IndexRecord>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    /// Number of vectors stored in a namespace.
    pub fn count(&self, namespace: &str) -> usize {
        let namespaces = self.namespaces.read().unwrap_or_else(|e| e.into_inner());
        namespaces.get(namespace).map(|ns| ns.len()).unwrap_or(0)
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, namespace: &str, records: &[IndexRecord]) -> Result<usize, RagError> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(|e| e.into_inner());
        let ns = namespaces.entry(namespace.to_string()).or_default();
        for record in records {
            ns.insert(record.chunk.id.clone(), record.clone());
        }
        Ok(records.len())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<IndexMatch>, RagError> {
        let namespaces = self.namespaces.read().unwrap_or_else(|e| e.into_inner());
        let ns = match namespaces.get(namespace) {
            Some(ns) => ns,
            None => return Ok(Vec::new()),
        };

        let mut matches: Vec<IndexMatch> = ns
            .values()
            .map(|record| IndexMatch {
                chunk: record.chunk.clone(),
                score: cosine_similarity(vector, &record.vector),
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }
}

// ============ Pinecone ============

/// Client for a Pinecone serverless index host.
///
/// Chunk fields are stored as vector metadata under `source_file`,
/// `chunk_index`, `chunk_text`, `chunk_hash` and (optionally) `url`.
pub struct PineconeIndex {
    client: reqwest::Client,
    host: String,
    api_key: String,
}

impl PineconeIndex {
    pub fn new(config: &IndexConfig) -> anyhow::Result<Self> {
        let host = config
            .host
            .clone()
            .ok_or_else(|| anyhow::anyhow!("index.host required for Pinecone"))?;
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host
        } else {
            format!("https://{}", host)
        };
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Pinecone API key not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value, RagError> {
        let url = format!("{}{}", self.host, path);
        debug!("Pinecone request: {}", url);

        let response = self
            .client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", "2024-07")
            .json(body)
            .send()
            .await
            .map_err(|e| RagError::Index(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Index(format!("Pinecone error {}: {}", status, text)));
        }

        response
            .json()
            .await
            .map_err(|e| RagError::Index(format!("invalid Pinecone response: {}", e)))
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn upsert(&self, namespace: &str, records: &[IndexRecord]) -> Result<usize, RagError> {
        if records.is_empty() {
            return Ok(0);
        }
        let vectors: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.chunk.id,
                    "values": r.vector,
                    "metadata": chunk_to_metadata(&r.chunk),
                })
            })
            .collect();
        let body = serde_json::json!({ "vectors": vectors, "namespace": namespace });

        let json = self.post("/vectors/upsert", &body).await?;
        Ok(json["upsertedCount"].as_u64().unwrap_or(records.len() as u64) as usize)
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<IndexMatch>, RagError> {
        let body = serde_json::json!({
            "namespace": namespace,
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
            "includeValues": false,
        });
        let json = self.post("/query", &body).await?;
        Ok(parse_query_response(&json))
    }
}

fn chunk_to_metadata(chunk: &Chunk) -> serde_json::Value {
    let mut md = serde_json::json!({
        "source_file": chunk.source,
        "chunk_index": chunk.chunk_index,
        "chunk_text": chunk.text,
        "chunk_hash": chunk.hash,
    });
    if let Some(url) = &chunk.url {
        md["url"] = serde_json::Value::String(url.clone());
    }
    md
}

/// Citation label for a match whose metadata lacks `source_file`.
const UNKNOWN_SOURCE: &str = "Document";

fn metadata_to_chunk(id: &str, md: &serde_json::Value) -> Chunk {
    let source = md["source_file"]
        .as_str()
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_SOURCE)
        .to_string();
    // Pinecone returns numeric metadata as floats.
    let chunk_index = md["chunk_index"]
        .as_u64()
        .or_else(|| md["chunk_index"].as_f64().map(|f| f as u64))
        .unwrap_or(0) as usize;

    Chunk {
        id: id.to_string(),
        source,
        chunk_index,
        text: md["chunk_text"].as_str().unwrap_or("").to_string(),
        hash: md["chunk_hash"].as_str().unwrap_or("").to_string(),
        url: md["url"].as_str().map(|s| s.to_string()),
    }
}

/// Parse `matches[]` from a query response, preserving the index's order.
fn parse_query_response(json: &serde_json::Value) -> Vec<IndexMatch> {
    json["matches"]
        .as_array()
        .map(|matches| {
            matches
                .iter()
                .map(|m| IndexMatch {
                    chunk: metadata_to_chunk(m["id"].as_str().unwrap_or(""), &m["metadata"]),
                    score: m["score"].as_f64().unwrap_or(0.0) as f32,
                })
                .collect()
        })
        .unwrap_or_default()
}

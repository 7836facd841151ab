//! Embedding provider abstraction, implementations, and tiered fallback.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`GeminiEmbedder`]** — calls Google's `batchEmbedContents` endpoint.
//! - **[`OpenAIEmbedder`]** — calls the OpenAI `/v1/embeddings` endpoint.
//! - **[`OllamaEmbedder`]** — calls a local Ollama instance's `/api/embed` endpoint.
//!
//! [`EmbeddingAdapter`] drives an ordered list of provider tiers (primary,
//! then optional secondary). Each tier is called once; a quota or
//! availability failure moves on to the next tier, and only when every tier
//! has failed does the adapter report [`RagError::ProvidersExhausted`].
//!
//! # Dimension Reconciliation
//!
//! Every vector leaving the adapter has exactly the index dimension. A
//! provider whose native dimension differs is normalized by
//! [`resize_to_dim`]: longer vectors are truncated, shorter ones are
//! zero-padded. This is lossy and may reduce retrieval quality, but it is
//! deterministic and never drops a vector.
//!
//! Also provides [`cosine_similarity`] for the in-memory index.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{Config, ProviderConfig};
use crate::error::{Capability, ProviderError, RagError};
use crate::usage::{estimate_tokens, UsageCounters};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Vectors returned by one provider call, with the tokens it consumed.
#[derive(Debug, Clone)]
pub struct Embeddings {
    pub vectors: Vec<Vec<f32>>,
    pub tokens: u64,
}

/// Trait for embedding providers.
///
/// A provider embeds a batch of texts in one call and returns one vector
/// per input, in input order. Vectors are returned at the provider's native
/// dimension; resizing is the adapter's job.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Backend name (e.g. `"gemini"`).
    fn name(&self) -> &str;
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Embeddings, ProviderError>;
}

// ============ Gemini Provider ============

/// Embedding provider using the Gemini API.
pub struct GeminiEmbedder {
    client: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl GeminiEmbedder {
    pub fn new(client: reqwest::Client, model: String, api_key: String, base_url: String) -> Self {
        Self {
            client,
            model,
            api_key,
            base_url,
        }
    }

    fn build_request_body(model: &str, texts: &[String]) -> serde_json::Value {
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|t| {
                serde_json::json!({
                    "model": format!("models/{}", model),
                    "content": { "parts": [{ "text": t }] },
                })
            })
            .collect();
        serde_json::json!({ "requests": requests })
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedder {
    fn name(&self) -> &str {
        "gemini"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Embeddings, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:batchEmbedContents",
            self.base_url, self.model
        );
        debug!("Gemini embedding request: model={} texts={}", self.model, texts.len());

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::build_request_body(&self.model, texts))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let json: serde_json::Value = response.json().await?;
        let vectors = parse_gemini_response(&json)?;
        let tokens = texts.iter().map(|t| estimate_tokens(t)).sum();
        Ok(Embeddings { vectors, tokens })
    }
}

/// Parse a `batchEmbedContents` response: `embeddings[].values`.
fn parse_gemini_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let items = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| ProviderError::InvalidResponse("missing embeddings array".into()))?;

    items
        .iter()
        .map(|item| {
            let values = item
                .get("values")
                .and_then(|v| v.as_array())
                .ok_or_else(|| ProviderError::InvalidResponse("missing embeddings[].values".into()))?;
            to_f32_vec(values)
        })
        .collect()
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl OpenAIEmbedder {
    pub fn new(client: reqwest::Client, model: String, api_key: String, base_url: String) -> Self {
        Self {
            client,
            model,
            api_key,
            base_url,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedder {
    fn name(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Embeddings, ProviderError> {
        let url = format!("{}/v1/embeddings", self.base_url);
        debug!("OpenAI embedding request: model={} texts={}", self.model, texts.len());

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let json: serde_json::Value = response.json().await?;
        let vectors = parse_openai_response(&json)?;
        let tokens = json["usage"]["total_tokens"]
            .as_u64()
            .unwrap_or_else(|| texts.iter().map(|t| estimate_tokens(t)).sum());
        Ok(Embeddings { vectors, tokens })
    }
}

/// Parse the OpenAI embeddings response, ordering by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::InvalidResponse("missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ProviderError::InvalidResponse("missing data[].embedding".into()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(position as u64);
        indexed.push((index, to_f32_vec(embedding)?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Requires Ollama to be running with an embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`). No API key is needed.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    base_url: String,
}

impl OllamaEmbedder {
    pub fn new(client: reqwest::Client, model: String, base_url: String) -> Self {
        Self {
            client,
            model,
            base_url,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn name(&self) -> &str {
        "ollama"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Embeddings, ProviderError> {
        let url = format!("{}/api/embed", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ProviderError::Unavailable(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.base_url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let json: serde_json::Value = response.json().await?;
        let vectors = parse_ollama_response(&json)?;
        let tokens = json["prompt_eval_count"]
            .as_u64()
            .unwrap_or_else(|| texts.iter().map(|t| estimate_tokens(t)).sum());
        Ok(Embeddings { vectors, tokens })
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| ProviderError::InvalidResponse("missing embeddings array".into()))?;

    embeddings
        .iter()
        .map(|embedding| {
            let values = embedding
                .as_array()
                .ok_or_else(|| ProviderError::InvalidResponse("embedding is not an array".into()))?;
            to_f32_vec(values)
        })
        .collect()
}

/// Convert a JSON number array; any non-numeric entry rejects the response.
fn to_f32_vec(values: &[serde_json::Value]) -> Result<Vec<f32>, ProviderError> {
    values
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                ProviderError::InvalidResponse(format!("non-numeric embedding value: {}", v))
            })
        })
        .collect()
}

/// Create the [`EmbeddingProvider`] for one configured tier.
///
/// | `provider` | Implementation |
/// |------------|----------------|
/// | `"gemini"` | [`GeminiEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_provider(
    config: &ProviderConfig,
    timeout_secs: u64,
) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?;
    let api_key = || {
        config
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("API key missing for {} embeddings", config.provider))
    };
    let base_url = |default: &str| {
        config
            .base_url
            .clone()
            .unwrap_or_else(|| default.to_string())
            .trim_end_matches('/')
            .to_string()
    };

    match config.provider.as_str() {
        "gemini" => Ok(Arc::new(GeminiEmbedder::new(
            client,
            config.model.clone(),
            api_key()?,
            base_url(GEMINI_BASE_URL),
        ))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(
            client,
            config.model.clone(),
            api_key()?,
            base_url(OPENAI_BASE_URL),
        ))),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(
            client,
            config.model.clone(),
            base_url(OLLAMA_BASE_URL),
        ))),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

/// Deterministically resize a vector to `dims`: truncate if longer,
/// zero-pad if shorter, unchanged if equal.
pub fn resize_to_dim(mut vec: Vec<f32>, dims: usize) -> Vec<f32> {
    if vec.len() != dims {
        debug!("resizing embedding from {} to {} dimensions", vec.len(), dims);
        vec.resize(dims, 0.0);
    }
    vec
}

/// Two-tier embedding front end used by ingestion and retrieval.
pub struct EmbeddingAdapter {
    tiers: Vec<Arc<dyn EmbeddingProvider>>,
    dims: usize,
    usage: Arc<UsageCounters>,
}

impl EmbeddingAdapter {
    /// Build an adapter over an ordered provider list (primary first).
    pub fn new(tiers: Vec<Arc<dyn EmbeddingProvider>>, dims: usize, usage: Arc<UsageCounters>) -> Self {
        Self { tiers, dims, usage }
    }

    /// Build the configured primary/secondary tiers.
    pub fn from_config(config: &Config, usage: Arc<UsageCounters>) -> anyhow::Result<Self> {
        let embedding = &config.embedding;
        let mut tiers = vec![create_provider(&embedding.primary, embedding.timeout_secs)?];
        if let Some(secondary) = &embedding.secondary {
            tiers.push(create_provider(secondary, embedding.timeout_secs)?);
        }
        Ok(Self::new(tiers, config.index.dims, usage))
    }

    /// Embed one text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        Ok(vectors.pop().unwrap_or_else(|| vec![0.0; self.dims]))
    }

    /// Embed a batch of texts, falling back to the next tier on failure.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut last_err = None;
        for (position, provider) in self.tiers.iter().enumerate() {
            let result = provider.embed(texts).await.and_then(|out| {
                if out.vectors.len() == texts.len() {
                    Ok(out)
                } else {
                    Err(ProviderError::InvalidResponse(format!(
                        "expected {} embeddings, got {}",
                        texts.len(),
                        out.vectors.len()
                    )))
                }
            });

            match result {
                Ok(out) => {
                    self.usage
                        .record_success(Capability::Embedding, position, out.tokens);
                    if position > 0 {
                        self.usage.record_fallback(Capability::Embedding);
                    }
                    return Ok(out
                        .vectors
                        .into_iter()
                        .map(|v| resize_to_dim(v, self.dims))
                        .collect());
                }
                Err(e) => {
                    self.usage.record_failure(Capability::Embedding, position);
                    warn!(
                        "embedding provider {} ({}) {}: {}",
                        provider.name(),
                        provider.model_name(),
                        if e.is_quota() { "is out of quota" } else { "failed" },
                        e
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(RagError::ProvidersExhausted {
            capability: Capability::Embedding,
            last: last_err
                .unwrap_or_else(|| ProviderError::NotConfigured("no embedding providers".into())),
        })
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProvider {
        native_dims: usize,
        fail_with: Option<fn() -> ProviderError>,
        calls: AtomicUsize,
    }

    impl FixedProvider {
        fn ok(native_dims: usize) -> Arc<Self> {
            Arc::new(Self {
                native_dims,
                fail_with: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(f: fn() -> ProviderError) -> Arc<Self> {
            Arc::new(Self {
                native_dims: 0,
                fail_with: Some(f),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }
        fn model_name(&self) -> &str {
            "fixed-model"
        }
        async fn embed(&self, texts: &[String]) -> Result<Embeddings, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(f) = self.fail_with {
                return Err(f());
            }
            Ok(Embeddings {
                vectors: texts.iter().map(|_| vec![1.0; self.native_dims]).collect(),
                tokens: 5,
            })
        }
    }

    fn quota() -> ProviderError {
        ProviderError::QuotaExceeded {
            status: 429,
            body: "quota".into(),
        }
    }

    fn unavailable() -> ProviderError {
        ProviderError::Unavailable("connection refused".into())
    }

    #[test]
    fn test_resize_pads_truncates_and_keeps() {
        assert_eq!(resize_to_dim(vec![1.0, 2.0], 4), vec![1.0, 2.0, 0.0, 0.0]);
        assert_eq!(resize_to_dim(vec![1.0, 2.0, 3.0, 4.0, 5.0], 3), vec![1.0, 2.0, 3.0]);
        assert_eq!(resize_to_dim(vec![1.0, 2.0, 3.0], 3), vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_primary_success_no_fallback() {
        let usage = Arc::new(UsageCounters::new());
        let primary = FixedProvider::ok(8);
        let secondary = FixedProvider::ok(8);
        let adapter = EmbeddingAdapter::new(
            vec![primary.clone() as Arc<dyn EmbeddingProvider>, secondary.clone()],
            8,
            usage.clone(),
        );

        let v = adapter.embed("hello").await.unwrap();
        assert_eq!(v.len(), 8);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
        let snap = usage.snapshot();
        assert_eq!(snap.embedding.primary.requests, 1);
        assert_eq!(snap.embedding.primary.tokens, 5);
        assert_eq!(snap.embedding.fallbacks, 0);
    }

    #[tokio::test]
    async fn test_quota_falls_back_and_resizes() {
        let usage = Arc::new(UsageCounters::new());
        let secondary = FixedProvider::ok(1536);
        let adapter = EmbeddingAdapter::new(
            vec![FixedProvider::failing(quota) as Arc<dyn EmbeddingProvider>, secondary.clone()],
            768,
            usage.clone(),
        );

        let vectors = adapter
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.len() == 768));
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);

        let snap = usage.snapshot();
        assert_eq!(snap.embedding.fallbacks, 1);
        assert_eq!(snap.embedding.primary.failures, 1);
        assert_eq!(snap.embedding.secondary.requests, 1);
    }

    #[tokio::test]
    async fn test_both_tiers_fail() {
        let usage = Arc::new(UsageCounters::new());
        let adapter = EmbeddingAdapter::new(
            vec![
                FixedProvider::failing(quota) as Arc<dyn EmbeddingProvider>,
                FixedProvider::failing(unavailable),
            ],
            8,
            usage.clone(),
        );
        let err = adapter.embed("x").await.unwrap_err();
        match err {
            RagError::ProvidersExhausted { capability, last } => {
                assert_eq!(capability, Capability::Embedding);
                assert!(matches!(last, ProviderError::Unavailable(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(usage.snapshot().embedding.fallbacks, 0);
    }

    #[tokio::test]
    async fn test_no_secondary_configured() {
        let adapter = EmbeddingAdapter::new(
            vec![FixedProvider::failing(unavailable) as Arc<dyn EmbeddingProvider>],
            8,
            Arc::new(UsageCounters::new()),
        );
        assert!(matches!(
            adapter.embed("x").await,
            Err(RagError::ProvidersExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_calls() {
        let primary = FixedProvider::ok(4);
        let adapter = EmbeddingAdapter::new(
            vec![primary.clone() as Arc<dyn EmbeddingProvider>],
            4,
            Arc::new(UsageCounters::new()),
        );
        assert!(adapter.embed_batch(&[]).await.unwrap().is_empty());
        assert_eq!(primary.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_parse_gemini_response() {
        let json = serde_json::json!({
            "embeddings": [{ "values": [0.5, -1.0] }, { "values": [2.0, 0.0] }]
        });
        let v = parse_gemini_response(&json).unwrap();
        assert_eq!(v, vec![vec![0.5, -1.0], vec![2.0, 0.0]]);
    }

    #[test]
    fn test_gemini_request_body() {
        let body = GeminiEmbedder::build_request_body("gemini-embedding-001", &["hi".to_string()]);
        assert_eq!(body["requests"][0]["model"], "models/gemini-embedding-001");
        assert_eq!(body["requests"][0]["content"]["parts"][0]["text"], "hi");
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [2.0] },
                { "index": 0, "embedding": [1.0] }
            ],
            "usage": { "total_tokens": 9 }
        });
        let v = parse_openai_response(&json).unwrap();
        assert_eq!(v, vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn test_parse_invalid_responses() {
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
        assert!(parse_gemini_response(&serde_json::json!({"embeddings": [{}]})).is_err());
        assert!(parse_ollama_response(&serde_json::json!({"embeddings": [1]})).is_err());
    }

    #[test]
    fn test_non_numeric_values_rejected() {
        let gemini = serde_json::json!({ "embeddings": [{ "values": [0.5, "NaN"] }] });
        assert!(matches!(
            parse_gemini_response(&gemini),
            Err(ProviderError::InvalidResponse(_))
        ));
        let openai = serde_json::json!({ "data": [{ "index": 0, "embedding": [1.0, null] }] });
        assert!(parse_openai_response(&openai).is_err());
        let ollama = serde_json::json!({ "embeddings": [[0.1, true]] });
        assert!(parse_ollama_response(&ollama).is_err());
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_degenerate() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}

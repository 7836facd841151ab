//! Error types shared by the retrieval and generation pipeline.
//!
//! Provider backends report [`ProviderError`]; every variant is treated as a
//! tier failure and triggers the single fallback hop. Pipeline operations
//! report [`RagError`], which is what callers (CLI, HTTP server) see.

use std::fmt;

/// Failure reported by a single embedding or generation provider call.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("quota exceeded ({status}): {body}")]
    QuotaExceeded { status: u16, body: String },
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Unavailable(err.to_string())
    }
}

impl ProviderError {
    /// Classify a non-success HTTP response.
    ///
    /// HTTP 429 and Google's `RESOURCE_EXHAUSTED` status count as quota
    /// exhaustion; everything else is an availability failure.
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 429 || body.contains("RESOURCE_EXHAUSTED") {
            ProviderError::QuotaExceeded { status, body }
        } else {
            ProviderError::Unavailable(format!("HTTP {}: {}", status, body))
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, ProviderError::QuotaExceeded { .. })
    }
}

/// Which provider capability an error or counter refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Embedding,
    Generation,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Embedding => write!(f, "embedding"),
            Capability::Generation => write!(f, "generation"),
        }
    }
}

/// Errors surfaced by the ingestion and query pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("question is {len} characters long; the limit is {max}")]
    InputRejected { len: usize, max: usize },
    #[error("all {capability} providers failed; last error: {last}")]
    ProvidersExhausted {
        capability: Capability,
        last: ProviderError,
    },
    #[error("vector index error: {0}")]
    Index(String),
    #[error("ingestion failed: all {failed} chunks were skipped")]
    IngestionFatal { failed: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

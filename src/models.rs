//! Core data models used throughout the pipeline.
//!
//! These types represent the documents, chunks, retrieved passages and chat
//! exchanges that flow through ingestion and question answering.

use serde::{Deserialize, Serialize};

/// A source document loaded for one ingestion run.
#[derive(Debug, Clone)]
pub struct Document {
    /// Source identifier (path relative to the document root).
    pub source: String,
    pub text: String,
    /// External citation URL, if one is configured.
    pub url: Option<String>,
}

/// A bounded span of a document's text, the unit stored in the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Stable index key, `"{source}#{chunk_index}"`.
    pub id: String,
    pub source: String,
    pub chunk_index: usize,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
    pub url: Option<String>,
}

impl Chunk {
    /// Build the stable index key for a chunk.
    pub fn key(source: &str, chunk_index: usize) -> String {
        format!("{}#{}", source, chunk_index)
    }
}

/// A chunk returned by a similarity search, with its score.
#[derive(Debug, Clone)]
pub struct RetrievedPassage {
    pub chunk: Chunk,
    pub score: f32,
    pub namespace: String,
}

/// Speaker of a conversation turn. The wire names match the chat API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One turn of caller-supplied conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

/// A cited source: the document identifier and an optional display link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Which generation tier produced an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServedBy {
    Primary,
    Secondary,
    Degraded,
}

impl ServedBy {
    /// The tier at a position in the provider list.
    pub fn tier(position: usize) -> Self {
        if position == 0 {
            ServedBy::Primary
        } else {
            ServedBy::Secondary
        }
    }
}

/// Chat invocation body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
}

/// Chat response body. Always well formed, even when every provider failed.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub answer: String,
    pub sources: Vec<Citation>,
    pub provider: ServedBy,
}

/// Result of an ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub documents: u64,
    pub chunks_created: u64,
    pub vectors_upserted: u64,
    pub skipped: u64,
    pub dry_run: bool,
}

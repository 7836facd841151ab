//! Query-time retrieval: embed the question, search the namespace.

use std::sync::Arc;
use tracing::debug;

use crate::embedding::EmbeddingAdapter;
use crate::error::RagError;
use crate::index::VectorIndex;
use crate::models::RetrievedPassage;

/// Embeds queries and runs top-k similarity search against one namespace.
pub struct Retriever {
    embedder: Arc<EmbeddingAdapter>,
    index: Arc<dyn VectorIndex>,
    namespace: String,
}

impl Retriever {
    pub fn new(embedder: Arc<EmbeddingAdapter>, index: Arc<dyn VectorIndex>, namespace: String) -> Self {
        Self {
            embedder,
            index,
            namespace,
        }
    }

    /// Return up to `top_k` passages, best first, in the order the index
    /// ranked them. An empty namespace yields an empty vec.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedPassage>, RagError> {
        let vector = self.embedder.embed(query).await?;
        let matches = self.index.query(&self.namespace, &vector, top_k).await?;
        debug!("retrieved {} passages from namespace {}", matches.len(), self.namespace);

        Ok(matches
            .into_iter()
            .map(|m| RetrievedPassage {
                chunk: m.chunk,
                score: m.score,
                namespace: self.namespace.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingProvider, Embeddings};
    use crate::error::ProviderError;
    use crate::index::{InMemoryIndex, IndexRecord};
    use crate::models::Chunk;
    use crate::usage::UsageCounters;
    use async_trait::async_trait;

    /// Maps text to a two-dimensional vector by keyword.
    struct KeywordProvider;

    #[async_trait]
    impl EmbeddingProvider for KeywordProvider {
        fn name(&self) -> &str {
            "keyword"
        }
        fn model_name(&self) -> &str {
            "keyword"
        }
        async fn embed(&self, texts: &[String]) -> Result<Embeddings, ProviderError> {
            let vectors = texts
                .iter()
                .map(|t| {
                    if t.to_lowercase().contains("vacation") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect();
            Ok(Embeddings { vectors, tokens: 0 })
        }
    }

    fn chunk(source: &str, text: &str) -> Chunk {
        Chunk {
            id: Chunk::key(source, 0),
            source: source.to_string(),
            chunk_index: 0,
            text: text.to_string(),
            hash: String::new(),
            url: None,
        }
    }

    fn retriever(index: Arc<InMemoryIndex>) -> Retriever {
        let tiers: Vec<Arc<dyn EmbeddingProvider>> = vec![Arc::new(KeywordProvider)];
        let embedder = Arc::new(EmbeddingAdapter::new(tiers, 2, Arc::new(UsageCounters::new())));
        Retriever::new(embedder, index, "hr".to_string())
    }

    #[tokio::test]
    async fn test_empty_namespace_returns_empty() {
        let r = retriever(Arc::new(InMemoryIndex::new()));
        assert!(r.retrieve("vacation days?", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_best_match_first_with_namespace() {
        let index = Arc::new(InMemoryIndex::new());
        index
            .upsert(
                "hr",
                &[
                    IndexRecord {
                        chunk: chunk("dental.md", "Dental plan."),
                        vector: vec![0.0, 1.0],
                    },
                    IndexRecord {
                        chunk: chunk("vacation.md", "Vacation: 15 days."),
                        vector: vec![1.0, 0.0],
                    },
                ],
            )
            .await
            .unwrap();

        let passages = retriever(index).retrieve("How much vacation?", 1).await.unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].chunk.source, "vacation.md");
        assert_eq!(passages[0].namespace, "hr");
    }
}

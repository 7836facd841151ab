//! Ingestion pipeline orchestration.
//!
//! Coordinates the ingestion flow: documents → chunking → embedding →
//! index upsert. Chunks are embedded and upserted in batches of
//! `embedding.batch_size`. When a batch fails its chunks are retried one at
//! a time, and only the chunks that still fail are logged and counted as
//! skipped; the run only fails as a whole when every chunk was skipped.
//!
//! Dry-run mode chunks and counts without calling the embedding providers
//! or writing to the index.

use std::sync::Arc;
use tracing::{info, warn};

use crate::chunk::chunk_document;
use crate::config::ChunkingConfig;
use crate::embedding::EmbeddingAdapter;
use crate::error::RagError;
use crate::index::{IndexRecord, VectorIndex};
use crate::models::{Chunk, Document, IngestSummary};

/// Drives chunking, embedding and upserts for a document set.
pub struct Ingestor {
    chunking: ChunkingConfig,
    batch_size: usize,
    embedder: Arc<EmbeddingAdapter>,
    index: Arc<dyn VectorIndex>,
}

impl Ingestor {
    pub fn new(
        chunking: ChunkingConfig,
        batch_size: usize,
        embedder: Arc<EmbeddingAdapter>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            chunking,
            batch_size: batch_size.max(1),
            embedder,
            index,
        }
    }

    /// Chunk and count `documents` without touching any provider or the
    /// index. Needs no [`Ingestor`] and no credentials.
    pub fn dry_run(documents: &[Document], chunking: &ChunkingConfig) -> IngestSummary {
        let mut summary = IngestSummary {
            dry_run: true,
            ..Default::default()
        };
        for doc in documents {
            let chunks = chunk_document(doc, chunking.max_chars, chunking.overlap_chars);
            info!("[dry-run] would ingest {} chunks from {}", chunks.len(), doc.source);
            summary.documents += 1;
            summary.chunks_created += chunks.len() as u64;
        }
        summary
    }

    /// Ingest `documents` into `namespace`.
    ///
    /// Returns [`RagError::IngestionFatal`] only if the run produced at
    /// least one chunk and none of them were upserted.
    pub async fn ingest(
        &self,
        documents: &[Document],
        namespace: &str,
        dry_run: bool,
    ) -> Result<IngestSummary, RagError> {
        if dry_run {
            return Ok(Self::dry_run(documents, &self.chunking));
        }

        let mut summary = IngestSummary::default();
        for doc in documents {
            let chunks = chunk_document(doc, self.chunking.max_chars, self.chunking.overlap_chars);
            summary.documents += 1;
            summary.chunks_created += chunks.len() as u64;

            if chunks.is_empty() {
                info!("{}: empty, nothing to ingest", doc.source);
                continue;
            }

            let mut doc_upserted = 0u64;
            for batch in chunks.chunks(self.batch_size) {
                match self.ingest_batch(namespace, batch).await {
                    Ok(n) => doc_upserted += n as u64,
                    Err(e) if batch.len() == 1 => {
                        warn!("{}: skipping chunk #{}: {}", doc.source, batch[0].chunk_index, e);
                        summary.skipped += 1;
                    }
                    Err(e) => {
                        warn!(
                            "{}: batch #{}..#{} failed, retrying chunks one at a time: {}",
                            doc.source,
                            batch[0].chunk_index,
                            batch[batch.len() - 1].chunk_index,
                            e
                        );
                        for chunk in batch {
                            match self.ingest_batch(namespace, std::slice::from_ref(chunk)).await {
                                Ok(n) => doc_upserted += n as u64,
                                Err(e) => {
                                    warn!(
                                        "{}: skipping chunk #{}: {}",
                                        doc.source, chunk.chunk_index, e
                                    );
                                    summary.skipped += 1;
                                }
                            }
                        }
                    }
                }
            }
            summary.vectors_upserted += doc_upserted;
            info!("ingested {} chunks from {}", doc_upserted, doc.source);
        }

        if summary.chunks_created > 0 && summary.skipped == summary.chunks_created {
            return Err(RagError::IngestionFatal {
                failed: summary.skipped,
            });
        }

        Ok(summary)
    }

    async fn ingest_batch(&self, namespace: &str, batch: &[Chunk]) -> Result<usize, RagError> {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        let records: Vec<IndexRecord> = batch
            .iter()
            .cloned()
            .zip(vectors)
            .map(|(chunk, vector)| IndexRecord { chunk, vector })
            .collect();

        self.index.upsert(namespace, &records).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingProvider, Embeddings};
    use crate::error::ProviderError;
    use crate::index::{IndexMatch, InMemoryIndex};
    use crate::usage::UsageCounters;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails any batch containing `poison`.
    struct PickyProvider {
        poison: Option<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for PickyProvider {
        fn name(&self) -> &str {
            "picky"
        }
        fn model_name(&self) -> &str {
            "picky-1"
        }
        async fn embed(&self, texts: &[String]) -> Result<Embeddings, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(p) = self.poison {
                if texts.iter().any(|t| t.contains(p)) {
                    return Err(ProviderError::Unavailable("poisoned".into()));
                }
            }
            Ok(Embeddings {
                vectors: texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect(),
                tokens: 1,
            })
        }
    }

    /// Rejects any upsert carrying a chunk from `reject_source`.
    struct RejectingIndex {
        inner: InMemoryIndex,
        reject_source: &'static str,
        upserts: AtomicUsize,
    }

    #[async_trait]
    impl VectorIndex for RejectingIndex {
        async fn upsert(&self, namespace: &str, records: &[IndexRecord]) -> Result<usize, RagError> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            if records.iter().any(|r| r.chunk.source == self.reject_source) {
                return Err(RagError::Index("HTTP 400: metadata too large".into()));
            }
            self.inner.upsert(namespace, records).await
        }

        async fn query(
            &self,
            namespace: &str,
            vector: &[f32],
            top_k: usize,
        ) -> Result<Vec<IndexMatch>, RagError> {
            self.inner.query(namespace, vector, top_k).await
        }
    }

    fn picky(poison: Option<&'static str>) -> Arc<PickyProvider> {
        Arc::new(PickyProvider {
            poison,
            calls: AtomicUsize::new(0),
        })
    }

    fn ingestor(
        provider: Arc<PickyProvider>,
        index: Arc<dyn VectorIndex>,
        max_chars: usize,
        overlap_chars: usize,
        batch_size: usize,
    ) -> Ingestor {
        let tiers: Vec<Arc<dyn EmbeddingProvider>> = vec![provider];
        let embedder = Arc::new(EmbeddingAdapter::new(
            tiers,
            4,
            Arc::new(UsageCounters::new()),
        ));
        Ingestor::new(
            ChunkingConfig {
                max_chars,
                overlap_chars,
            },
            batch_size,
            embedder,
            index,
        )
    }

    fn setup(poison: Option<&'static str>) -> (Ingestor, Arc<InMemoryIndex>, Arc<PickyProvider>) {
        let provider = picky(poison);
        let index = Arc::new(InMemoryIndex::new());
        let ingestor = ingestor(provider.clone(), index.clone(), 20, 5, 1);
        (ingestor, index, provider)
    }

    fn rejecting(reject_source: &'static str) -> Arc<RejectingIndex> {
        Arc::new(RejectingIndex {
            inner: InMemoryIndex::new(),
            reject_source,
            upserts: AtomicUsize::new(0),
        })
    }

    fn doc(source: &str, text: &str) -> Document {
        Document {
            source: source.to_string(),
            text: text.to_string(),
            url: None,
        }
    }

    #[tokio::test]
    async fn test_ingest_counts_and_idempotency() {
        let (ingestor, index, _) = setup(None);
        let docs = vec![doc("a.md", &"x".repeat(50)), doc("b.md", "short")];

        let first = ingestor.ingest(&docs, "hr", false).await.unwrap();
        assert_eq!(first.documents, 2);
        assert_eq!(first.chunks_created, 4);
        assert_eq!(first.vectors_upserted, 4);
        assert_eq!(first.skipped, 0);
        assert_eq!(index.count("hr"), 4);

        ingestor.ingest(&docs, "hr", false).await.unwrap();
        assert_eq!(index.count("hr"), 4);
    }

    #[tokio::test]
    async fn test_dry_run_makes_no_calls_or_writes() {
        let (ingestor, index, provider) = setup(None);
        let summary = ingestor
            .ingest(&[doc("a.md", &"y".repeat(50))], "hr", true)
            .await
            .unwrap();
        assert!(summary.dry_run);
        assert_eq!(summary.chunks_created, 3);
        assert_eq!(summary.vectors_upserted, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(index.count("hr"), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_skips_and_continues() {
        let (ingestor, index, _) = setup(Some("BAD"));
        let docs = vec![doc("good.md", "fine text"), doc("bad.md", "BAD text")];
        let summary = ingestor.ingest(&docs, "hr", false).await.unwrap();
        assert_eq!(summary.chunks_created, 2);
        assert_eq!(summary.vectors_upserted, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(index.count("hr"), 1);
    }

    #[tokio::test]
    async fn test_bad_chunk_in_large_batch_skips_only_that_chunk() {
        let provider = picky(Some("BAD"));
        let index = Arc::new(InMemoryIndex::new());
        let ingestor = ingestor(provider.clone(), index.clone(), 10, 0, 64);

        // chunks: "aaaaaaaaaa", "BADbbbbbbb", "cccccccccc"
        let text = format!("{}BAD{}{}", "a".repeat(10), "b".repeat(7), "c".repeat(10));
        let summary = ingestor.ingest(&[doc("mixed.md", &text)], "hr", false).await.unwrap();

        assert_eq!(summary.chunks_created, 3);
        assert_eq!(summary.vectors_upserted, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(index.count("hr"), 2);
        // one failed batch call, then one call per chunk
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_total_failure_is_fatal() {
        let (ingestor, _, _) = setup(Some("BAD"));
        let err = ingestor
            .ingest(&[doc("bad.md", "BAD BAD")], "hr", false)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::IngestionFatal { failed: 1 }));
    }

    #[tokio::test]
    async fn test_rejected_upserts_are_skipped_and_run_continues() {
        let index = rejecting("bad.md");
        let ingestor = ingestor(picky(None), index.clone(), 20, 5, 64);
        let docs = vec![
            doc("bad.md", &"x".repeat(50)),
            doc("good.md", "fine text"),
        ];

        let summary = ingestor.ingest(&docs, "hr", false).await.unwrap();
        assert_eq!(summary.chunks_created, 4);
        assert_eq!(summary.vectors_upserted, 1);
        assert_eq!(summary.skipped, 3);
        assert_eq!(index.inner.count("hr"), 1);
        // bad.md: one batch attempt plus three single-chunk retries
        assert_eq!(index.upserts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_all_upserts_rejected_is_fatal() {
        let index = rejecting("bad.md");
        let ingestor = ingestor(picky(None), index.clone(), 20, 5, 64);

        let err = ingestor
            .ingest(&[doc("bad.md", &"x".repeat(50))], "hr", false)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::IngestionFatal { failed: 3 }));
        assert_eq!(index.inner.count("hr"), 0);
    }

    #[tokio::test]
    async fn test_empty_documents_are_not_an_error() {
        let (ingestor, _, _) = setup(None);
        let summary = ingestor.ingest(&[doc("empty.md", "")], "hr", false).await.unwrap();
        assert_eq!(summary.documents, 1);
        assert_eq!(summary.chunks_created, 0);
    }
}

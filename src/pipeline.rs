//! The question-answering pipeline.
//!
//! [`Assistant::ask`] runs one chat request through
//! `VALIDATING → RETRIEVING → ASSEMBLING → GENERATING → DONE`. Requests
//! share nothing mutable except the [`UsageCounters`]; every other piece of
//! state lives on the stack of the request.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::context::assemble;
use crate::embedding::EmbeddingAdapter;
use crate::error::RagError;
use crate::generate::Orchestrator;
use crate::index::{create_index, VectorIndex};
use crate::models::{ChatRequest, ChatResponse};
use crate::retrieve::Retriever;
use crate::usage::UsageCounters;

/// Stage of a chat request, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    Validating,
    Retrieving,
    Assembling,
    Generating,
    Done,
    Rejected,
    Degraded,
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryStage::Validating => "validating",
            QueryStage::Retrieving => "retrieving",
            QueryStage::Assembling => "assembling",
            QueryStage::Generating => "generating",
            QueryStage::Done => "done",
            QueryStage::Rejected => "rejected",
            QueryStage::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Retrieval + generation, shared by every request via `Arc`.
pub struct Assistant {
    retriever: Retriever,
    orchestrator: Orchestrator,
    usage: Arc<UsageCounters>,
    top_k: usize,
    max_context_chars: usize,
    citation_base_url: Option<String>,
}

impl Assistant {
    pub fn new(
        retriever: Retriever,
        orchestrator: Orchestrator,
        usage: Arc<UsageCounters>,
        top_k: usize,
        max_context_chars: usize,
        citation_base_url: Option<String>,
    ) -> Self {
        Self {
            retriever,
            orchestrator,
            usage,
            top_k,
            max_context_chars,
            citation_base_url,
        }
    }

    /// Wire up providers, index and counters from configuration.
    pub fn from_config(config: &Config, usage: Arc<UsageCounters>) -> anyhow::Result<Self> {
        let embedder = Arc::new(EmbeddingAdapter::from_config(config, usage.clone())?);
        let index: Arc<dyn VectorIndex> = create_index(&config.index)?;
        let retriever = Retriever::new(embedder, index, config.index.namespace.clone());
        let orchestrator = Orchestrator::from_config(config, usage.clone())?;
        Ok(Self::new(
            retriever,
            orchestrator,
            usage,
            config.retrieval.top_k,
            config.retrieval.max_context_chars,
            config.documents.citation_base_url.clone(),
        ))
    }

    pub fn usage(&self) -> &Arc<UsageCounters> {
        &self.usage
    }

    /// Answer one question.
    ///
    /// Only an over-long question is an error. Provider and index failures
    /// produce a degraded answer instead.
    pub async fn ask(&self, request: &ChatRequest) -> Result<ChatResponse, RagError> {
        self.usage.record_chat_request();

        stage(QueryStage::Validating);
        if let Err(e) = self.orchestrator.validate(&request.message) {
            stage(QueryStage::Rejected);
            self.usage.record_rejected();
            return Err(e);
        }

        stage(QueryStage::Retrieving);
        let passages = match self.retriever.retrieve(&request.message, self.top_k).await {
            Ok(passages) => passages,
            Err(e) => {
                warn!("retrieval failed, answering degraded: {}", e);
                stage(QueryStage::Degraded);
                let generation = self.orchestrator.degraded(Vec::new());
                return Ok(ChatResponse {
                    answer: generation.answer,
                    sources: generation.sources,
                    provider: generation.provider,
                });
            }
        };

        stage(QueryStage::Assembling);
        let context = assemble(
            &passages,
            self.max_context_chars,
            self.citation_base_url.as_deref(),
        );
        debug!(
            "{} of {} passages fit the context window",
            context.passages,
            passages.len()
        );

        stage(QueryStage::Generating);
        let generation = self
            .orchestrator
            .generate(&request.message, &request.history, &context.text, context.citations)
            .await?;

        stage(QueryStage::Done);
        Ok(ChatResponse {
            answer: generation.answer,
            sources: generation.sources,
            provider: generation.provider,
        })
    }
}

fn stage(stage: QueryStage) {
    debug!(%stage, "chat request stage");
}

//! # ask-docs
//!
//! Cited question answering over a private document corpus.
//!
//! Documents are chunked, embedded and stored in a vector index ahead of
//! time. At question time the question is embedded, the closest chunks are
//! retrieved and packed into a bounded context window, and a generation
//! model answers from that context. Answers always carry the list of source
//! documents they drew from.
//!
//! Both embedding and generation run against an ordered pair of provider
//! tiers. A quota or availability failure on the primary moves the call to
//! the secondary; if both fail, ingestion skips the batch and the chat path
//! returns a well-formed degraded answer.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌─────────┐   ┌───────────┐   ┌──────────────┐
//! │ documents │──▶│ chunker │──▶│ embedding │──▶│ vector index │
//! └───────────┘   └─────────┘   │  adapter  │   └──────┬───────┘
//!                               └─────▲─────┘          │
//!                                     │                ▼
//!  question ──▶ validate ──▶ retriever ──▶ context assembler ──▶ orchestrator ──▶ answer + sources
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Provider and pipeline error types |
//! | [`documents`] | Directory document loader |
//! | [`extract`] | Text extraction (plain text, PDF) |
//! | [`chunk`] | Overlapping character-window chunking |
//! | [`embedding`] | Embedding providers and the tiered adapter |
//! | [`index`] | Vector index trait, Pinecone and in-memory backends |
//! | [`ingest`] | Ingestion pipeline |
//! | [`retrieve`] | Top-k retrieval |
//! | [`context`] | Context window assembly and citations |
//! | [`generate`] | Generation providers and the orchestrator |
//! | [`pipeline`] | End-to-end question answering |
//! | [`usage`] | Atomic usage counters |
//! | [`server`] | HTTP chat server |

pub mod chunk;
pub mod config;
pub mod context;
pub mod documents;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generate;
pub mod index;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod retrieve;
pub mod server;
pub mod usage;

//! mnemo-retriever: semantic memory for long-running group conversations
//!
//! This crate keeps two vector indexes over a conversation log — one per
//! message, one per dialog window — and answers questions against both at
//! once, fusing the results into a single confidence-graded hit list for a
//! downstream generation step.
//!
//! ## Key Modules
//!
//! - **[`retrieval`]**: the indexing orchestrator, the two index handlers,
//!   hybrid multi-variant search, RRF fusion, reranking, confidence grading
//! - **[`storage`]**: capability traits plus the bundled SQLite implementation
//! - **[`status`]**: backlog accounting for operational visibility
//! - **[`config`]**: TOML-loadable configuration for every tunable
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mnemo_embed::HashEmbedder;
//! use mnemo_retriever::retrieval::hybrid::{HybridRetriever, RetrieveOptions};
//! use mnemo_retriever::storage::sqlite_store::SqliteStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(SqliteStore::open(std::path::Path::new(".")).await?);
//! let retriever = HybridRetriever::new(Arc::new(HashEmbedder::default()), store);
//!
//! let outcome = retriever
//!     .retrieve(42, "what did we decide about the cache?", &RetrieveOptions::default())
//!     .await?;
//! println!("{}: {} hits", outcome.confidence.level, outcome.hits.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Messages → MessageIndexer ─┐
//!     │                      ├→ Embeddings → Vector Store
//!     └→ Segmenter → WindowIndexer ─┘            │
//!                        ↑                       ↓
//!            IndexingOrchestrator      HybridRetriever → RRF → Rerank
//!                                                               │
//!                                                    Confidence Gate
//! ```

pub mod config;
pub mod retrieval;
pub mod status;
pub mod storage;

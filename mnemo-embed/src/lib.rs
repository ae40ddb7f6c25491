//! # mnemo-embed
//!
//! The embedding capability for mnemo: a small trait surface over batchable
//! text-to-vector providers, with a local FastEmbed-backed implementation and
//! a deterministic hashing stand-in for tests.
//!
//! ## Design
//!
//! - **One logical provider per role**: callers hold a single
//!   [`EmbeddingProvider`]; provider failover, API keys, and transport live in
//!   whatever adapter implements the trait, never in the callers.
//! - **Rate limits are data, not failures**: remote adapters map throttling
//!   onto [`EmbedError::RateLimited`] so the indexing orchestrator can pause
//!   and resume instead of erroring out.
//! - **Half-precision vectors**: embeddings are `Vec<f16>`, normalized, which
//!   halves storage and makes cosine similarity a plain dot product.
//!
//! ## Quick Start
//!
//! ```no_run
//! use mnemo_embed::{EmbedConfig, EmbeddingProvider, FastEmbedProvider};
//!
//! # async fn example() -> mnemo_embed::Result<()> {
//! let provider = FastEmbedProvider::create(EmbedConfig::default()).await?;
//!
//! let texts = vec!["alice: lunch at noon?".to_string()];
//! let result = provider.embed_texts(&texts).await?;
//! println!("{} vectors of dimension {}", result.len(), result.dimension);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod provider;

// Re-export main types for easy access
pub use config::EmbedConfig;
pub use error::{EmbedError, Result};
pub use provider::{EmbeddingProvider, EmbeddingResult, FastEmbedProvider, HashEmbedder};

//! Embedding provider implementations

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use half::f16;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text
    pub embeddings: Vec<Vec<f16>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result from a vector of f16 embeddings.
    ///
    /// The dimension is inferred from the first embedding vector; an empty
    /// result has dimension 0.
    pub fn new(embeddings: Vec<Vec<f16>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    /// Returns the number of embedding vectors in this result.
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    /// Returns `true` if this result contains no embedding vectors.
    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Trait for embedding providers that can generate embeddings from text.
///
/// Implementations must be batchable and must report rate limiting through
/// [`EmbedError::RateLimited`] so the indexing orchestrator can back off
/// without treating the provider as broken.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f16>>;

    /// Generate embeddings for multiple texts (batch processing)
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;
}

/// FastEmbed-based embedding provider using local ONNX models.
///
/// The model runs in-process; `embed_texts` moves the actual inference onto
/// the blocking thread pool in sub-batches of [`EmbedConfig::batch_size`].
/// Being local, this provider never returns [`EmbedError::RateLimited`] —
/// that variant exists for providers wrapping remote APIs.
#[derive(Clone)]
pub struct FastEmbedProvider {
    config: EmbedConfig,
    model: Arc<Mutex<TextEmbedding>>,
    dimension: usize,
}

impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("config", &self.config)
            .field("dimension", &self.dimension)
            .finish()
    }
}

fn builtin_model(name: &str) -> Result<EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        other => Err(EmbedError::invalid_config(format!(
            "unknown embedding model: {other}"
        ))),
    }
}

impl FastEmbedProvider {
    /// Load the configured model and verify it produces usable vectors.
    pub async fn create(config: EmbedConfig) -> Result<Self> {
        tracing::info!("Loading embedding model: {}", config.model_name);
        let model_choice = builtin_model(&config.model_name)?;

        let (model, dimension) =
            tokio::task::spawn_blocking(move || -> Result<(TextEmbedding, usize)> {
                let init_options =
                    InitOptions::new(model_choice).with_show_download_progress(false);
                let mut model = TextEmbedding::try_new(init_options)
                    .map_err(|e| EmbedError::External { source: e })?;

                // Probe the dimension with a throwaway embedding.
                let probe = model
                    .embed(vec!["dimension probe".to_string()], None)
                    .map_err(|e| EmbedError::External { source: e })?;
                let dimension = probe.first().map(|e| e.len()).unwrap_or(0);
                if dimension == 0 {
                    return Err(EmbedError::invalid_config(
                        "model produced an empty probe embedding",
                    ));
                }
                Ok((model, dimension))
            })
            .await??;

        tracing::info!("Model loaded. Dimension: {}", dimension);
        Ok(Self {
            config,
            model: Arc::new(Mutex::new(model)),
            dimension,
        })
    }

    /// Convert f32 embeddings to normalized f16
    fn convert_to_f16(embeddings: Vec<Vec<f32>>) -> Vec<Vec<f16>> {
        embeddings
            .into_iter()
            .map(|embedding| {
                let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
                embedding
                    .into_iter()
                    .map(|value| {
                        if norm > 0.0 {
                            f16::from_f32(value / norm)
                        } else {
                            f16::from_f32(value)
                        }
                    })
                    .collect()
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed_text(&self, text: &str) -> Result<Vec<f16>> {
        let texts = vec![text.to_string()];
        let result = self.embed_texts(&texts).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::invalid_config("No embedding generated for text"))
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }

        tracing::debug!("Generating embeddings for {} texts", texts.len());

        let mut all_embeddings = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.config.batch_size) {
            let chunk = chunk.to_vec();
            let model = Arc::clone(&self.model);

            let batch = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
                let mut guard = model.lock().map_err(|_| {
                    EmbedError::invalid_config("embedding model mutex poisoned")
                })?;
                guard
                    .embed(chunk, None)
                    .map_err(|e| EmbedError::External { source: e })
            })
            .await??;

            all_embeddings.extend(Self::convert_to_f16(batch));
        }

        Ok(EmbeddingResult::new(all_embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "fastembed"
    }
}

/// Deterministic hashing-based provider for tests and offline runs.
///
/// Each lowercase alphanumeric token is hashed into one of `dimension`
/// buckets and the bucket counts are L2-normalized, so texts sharing words
/// land near each other under cosine similarity while the output stays fully
/// deterministic across runs. This is obviously not a semantic model — it
/// exists so the orchestrator and retriever can be exercised end to end
/// without loading ONNX weights.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f16> {
        let mut buckets = vec![0f32; self.dimension];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let bucket = (hasher.finish() % self.dimension as u64) as usize;
            buckets[bucket] += 1.0;
        }

        let norm: f32 = buckets.iter().map(|x| x * x).sum::<f32>().sqrt();
        buckets
            .into_iter()
            .map(|v| {
                if norm > 0.0 {
                    f16::from_f32(v / norm)
                } else {
                    f16::from_f32(0.0)
                }
            })
            .collect()
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed_text(&self, text: &str) -> Result<Vec<f16>> {
        Ok(self.embed_one(text))
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        Ok(EmbeddingResult::new(
            texts.iter().map(|t| self.embed_one(t)).collect(),
        ))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "hash"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f16], b: &[f16]) -> f32 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| x.to_f32() * y.to_f32())
            .sum()
    }

    #[test]
    fn embedding_result_infers_dimension() {
        let embeddings = vec![
            vec![f16::from_f32(0.1), f16::from_f32(0.2), f16::from_f32(0.3)],
            vec![f16::from_f32(0.4), f16::from_f32(0.5), f16::from_f32(0.6)],
        ];
        let result = EmbeddingResult::new(embeddings);

        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 3);
        assert!(!result.is_empty());
    }

    #[test]
    fn unknown_model_name_is_rejected() {
        assert!(builtin_model("no-such-model").is_err());
        assert!(builtin_model("all-minilm-l6-v2").is_ok());
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic() -> Result<()> {
        let embedder = HashEmbedder::default();
        let a = embedder.embed_text("we deployed the new cache on friday").await?;
        let b = embedder.embed_text("we deployed the new cache on friday").await?;
        assert_eq!(a, b);
        Ok(())
    }

    #[tokio::test]
    async fn hash_embedder_ranks_shared_vocabulary_higher() -> Result<()> {
        let embedder = HashEmbedder::default();
        let query = embedder.embed_text("when did we deploy the cache").await?;
        let related = embedder
            .embed_text("we deploy the cache every friday evening")
            .await?;
        let unrelated = embedder
            .embed_text("my cat knocked over a plant yesterday")
            .await?;

        assert!(dot(&query, &related) > dot(&query, &unrelated));
        Ok(())
    }

    #[tokio::test]
    async fn hash_embedder_handles_empty_batches_and_blank_text() -> Result<()> {
        let embedder = HashEmbedder::default();
        let result = embedder.embed_texts(&[]).await?;
        assert!(result.is_empty());

        let blank = embedder.embed_text("   ").await?;
        assert_eq!(blank.len(), embedder.embedding_dimension());
        assert!(blank.iter().all(|v| v.to_f32() == 0.0));
        Ok(())
    }

    #[tokio::test]
    async fn rate_limit_errors_are_distinguishable() {
        let err = EmbedError::rate_limited(Some(std::time::Duration::from_secs(9)));
        assert!(err.is_rate_limit());
        assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(9)));

        let other = EmbedError::invalid_config("nope");
        assert!(!other.is_rate_limit());
        assert_eq!(other.retry_after(), None);
    }
}

//! Configuration for embedding providers

use serde::{Deserialize, Serialize};

/// Configuration for the bundled [`FastEmbedProvider`](crate::FastEmbedProvider).
///
/// Only built-in fastembed models are supported; `model_name` selects among
/// them. Embeddings are always L2-normalized before being handed to callers
/// so cosine similarity reduces to a dot product downstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbedConfig {
    /// Name of the fastembed built-in model to load.
    pub model_name: String,
    /// How many texts to embed per blocking batch.
    pub batch_size: usize,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            model_name: "all-minilm-l6-v2".to_string(),
            batch_size: 16,
        }
    }
}

impl EmbedConfig {
    /// Create a config for a named built-in model.
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    /// Set the per-batch text count.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_names_minilm() {
        let config = EmbedConfig::default();
        assert_eq!(config.model_name, "all-minilm-l6-v2");
        assert_eq!(config.batch_size, 16);
    }

    #[test]
    fn batch_size_never_zero() {
        let config = EmbedConfig::default().with_batch_size(0);
        assert_eq!(config.batch_size, 1);
    }
}

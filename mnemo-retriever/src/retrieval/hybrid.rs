//! Foreground retrieval: multi-variant hybrid search over both indexes.
//!
//! A question (plus optional alternate phrasings) is embedded once per
//! variant, every (variant, index) pair is queried as one branch of a
//! fan-out, and the branches are joined before fusion. Branches are
//! independent failure domains: a slow or failing branch degrades to an empty
//! list after its timeout instead of taking the whole retrieval down.
//!
//! Retrieval is read-only with respect to the indexes and may run while the
//! orchestrator writes; the only cost is serving slightly stale windows
//! during an in-flight reindex.

use crate::retrieval::confidence::{Confidence, ConfidenceThresholds, grade_confidence};
use crate::retrieval::fusion::{DEFAULT_RRF_K, FusedHit, Hit, rrf_fuse};
use crate::retrieval::rerank::{RelevanceJudge, Reranker};
use crate::storage::{IndexKind, VectorStore};
use anyhow::Result;
use itertools::Itertools;
use mnemo_embed::EmbeddingProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-call knobs for [`HybridRetriever::retrieve`].
#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    /// Alternate phrasings of the question, fused alongside it. Generating
    /// them (e.g. with an LLM) is the caller's concern.
    pub variants: Vec<String>,
    /// Cap on total variants issued, the question included.
    pub max_variants: usize,
    /// Result limit per (variant, index) branch.
    pub per_query_limit: usize,
    /// Whether to run the relevance judge over the top fused hits.
    pub rerank: bool,
    /// Hits at least this similar to the query are assumed to be the index
    /// echoing the question itself and are dropped.
    pub near_duplicate_threshold: f32,
    /// Replace message-hit display texts with their enclosing window, when
    /// one exists.
    pub expand_message_hits: bool,
    /// Timeout per search branch.
    pub branch_timeout: Duration,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            variants: Vec::new(),
            max_variants: 3,
            per_query_limit: 8,
            rerank: false,
            near_duplicate_threshold: 0.98,
            expand_message_hits: false,
            branch_timeout: Duration::from_secs(10),
        }
    }
}

impl RetrieveOptions {
    pub fn with_variants(mut self, variants: Vec<String>) -> Self {
        self.variants = variants;
        self
    }

    pub fn with_rerank(mut self, rerank: bool) -> Self {
        self.rerank = rerank;
        self
    }

    pub fn with_per_query_limit(mut self, limit: usize) -> Self {
        self.per_query_limit = limit.max(1);
        self
    }
}

/// What a retrieval hands back: the fused (possibly reranked) hits plus the
/// confidence verdict. An empty hit list always comes with
/// [`ConfidenceLevel::None`](crate::retrieval::confidence::ConfidenceLevel)
/// and an explicit reason, never silently.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RetrievalOutcome {
    pub hits: Vec<FusedHit>,
    pub confidence: Confidence,
}

/// Issues multi-variant queries against both indexes and fuses the results.
pub struct HybridRetriever {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    judge: Option<Arc<dyn RelevanceJudge>>,
    reranker: Reranker,
    rrf_k: f32,
    thresholds: ConfidenceThresholds,
}

impl HybridRetriever {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embedder,
            store,
            judge: None,
            reranker: Reranker::default(),
            rrf_k: DEFAULT_RRF_K,
            thresholds: ConfidenceThresholds::default(),
        }
    }

    /// Attach a relevance judge; without one, `rerank` requests are ignored.
    pub fn with_judge(mut self, judge: Arc<dyn RelevanceJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_reranker(mut self, reranker: Reranker) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn with_rrf_k(mut self, k: f32) -> Self {
        self.rrf_k = k;
        self
    }

    pub fn with_confidence_thresholds(mut self, thresholds: ConfidenceThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Retrieve conversation fragments relevant to `question`.
    ///
    /// Never fails on provider or store trouble: degraded branches shrink the
    /// result set and the confidence verdict reports what is left. The only
    /// errors surfaced are programming/wiring mistakes.
    pub async fn retrieve(
        &self,
        conversation_id: i64,
        question: &str,
        options: &RetrieveOptions,
    ) -> Result<RetrievalOutcome> {
        let variants: Vec<String> = std::iter::once(question.to_string())
            .chain(options.variants.iter().cloned())
            .unique()
            .take(options.max_variants.max(1))
            .collect();

        let embedded = match self.embedder.embed_texts(&variants).await {
            Ok(result) if result.len() == variants.len() => result,
            Ok(result) => {
                warn!(
                    "embedder returned {} vectors for {} variants, grounding unavailable",
                    result.len(),
                    variants.len()
                );
                return Ok(Self::ungrounded("query embedding came back malformed"));
            }
            Err(e) => {
                warn!("query embedding failed, grounding unavailable: {e}");
                return Ok(Self::ungrounded("embedding provider unavailable"));
            }
        };

        // One branch per (variant, index): dispatched together, joined, and
        // individually allowed to fail empty.
        let branches = variants.iter().enumerate().flat_map(|(query_idx, _)| {
            [IndexKind::Message, IndexKind::Window]
                .into_iter()
                .map(move |index| (query_idx, index))
        });
        let searches = branches.map(|(query_idx, index)| {
            let store = Arc::clone(&self.store);
            let vector = embedded.embeddings[query_idx].clone();
            let limit = options.per_query_limit;
            let timeout = options.branch_timeout;
            async move {
                let result = tokio::time::timeout(
                    timeout,
                    store.query(index, conversation_id, &vector, limit),
                )
                .await;
                let records = match result {
                    Ok(Ok(records)) => records,
                    Ok(Err(e)) => {
                        warn!("search branch ({index}, variant {query_idx}) failed: {e:#}");
                        Vec::new()
                    }
                    Err(_) => {
                        warn!("search branch ({index}, variant {query_idx}) timed out");
                        Vec::new()
                    }
                };
                (query_idx, index, records)
            }
        });

        let mut lists: Vec<Vec<Hit>> = Vec::new();
        for (query_idx, index, records) in futures::future::join_all(searches).await {
            let hits: Vec<Hit> = records
                .into_iter()
                .filter(|r| r.similarity < options.near_duplicate_threshold)
                .map(|r| Hit {
                    source_key: r.source_key,
                    display_text: r.display_text,
                    raw_score: r.similarity,
                    origin_index: index,
                    origin_query: query_idx,
                })
                .collect();
            debug!(
                "branch ({index}, variant {query_idx}): {} hits after near-duplicate filter",
                hits.len()
            );
            lists.push(hits);
        }

        let mut fused = rrf_fuse(&lists, self.rrf_k);

        if options.expand_message_hits {
            self.expand_to_windows(conversation_id, &mut fused).await;
        }

        if options.rerank {
            if let Some(judge) = &self.judge {
                fused = self.reranker.rerank(judge.as_ref(), question, fused).await;
            }
        }

        let confidence = grade_confidence(&fused, variants.len(), self.rrf_k, self.thresholds);
        Ok(RetrievalOutcome {
            hits: fused,
            confidence,
        })
    }

    fn ungrounded(reason: &str) -> RetrievalOutcome {
        RetrievalOutcome {
            hits: Vec::new(),
            confidence: Confidence {
                level: crate::retrieval::confidence::ConfidenceLevel::None,
                reason: format!("insufficient grounding: {reason}"),
            },
        }
    }

    /// Swap message-hit display texts for their enclosing window, giving the
    /// consumer dialog context. A membership lookup per hit; failures leave
    /// the original line in place.
    async fn expand_to_windows(&self, conversation_id: i64, fused: &mut [FusedHit]) {
        for hit in fused.iter_mut() {
            if hit.origin_index != IndexKind::Message {
                continue;
            }
            match self
                .store
                .enclosing_windows(conversation_id, hit.source_key)
                .await
            {
                Ok(windows) => {
                    if let Some(window) = windows.first() {
                        hit.display_text = window.display_text.clone();
                    }
                }
                Err(e) => {
                    warn!("window expansion failed for message {}: {e:#}", hit.source_key);
                }
            }
        }
    }
}

//! Optional reordering of the top fused hits with a relevance judge.
//!
//! RRF knows which items were surfaced repeatedly, but nothing about whether
//! they actually address the question. A relevance judge (typically an LLM
//! adapter) grades the top-K candidates and the blend of grade and fused
//! score reorders them. Two hard rules:
//!
//! - The reranker only reorders. Filtering authority belongs to the
//!   confidence gate and downstream consumers, so a zero grade moves a
//!   candidate down, never out.
//! - The judge is best-effort. A failed call or malformed output falls back
//!   to the pre-rerank order unchanged.

use super::fusion::FusedHit;
use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

/// Grades candidate texts for relevance to a question on an integer scale
/// from 0 (irrelevant) to [`Reranker::MAX_GRADE`] (directly answers it).
/// Implementations wrap whatever model does the judging; failures here are
/// always recoverable by the caller.
#[async_trait]
pub trait RelevanceJudge: Send + Sync {
    async fn grade(&self, question: &str, candidates: &[String]) -> Result<Vec<u8>>;
}

/// Reorders the top `top_k` fused hits by blending the judge's grade with the
/// fused score. See module docs for the fail-open contract.
#[derive(Debug, Clone)]
pub struct Reranker {
    top_k: usize,
    /// Weight given to the judge's grade; the rest stays with the fused
    /// score.
    grade_weight: f32,
}

impl Reranker {
    pub const MAX_GRADE: u8 = 3;

    pub fn new(top_k: usize, grade_weight: f32) -> Self {
        Self {
            top_k: top_k.max(1),
            grade_weight: grade_weight.clamp(0.0, 1.0),
        }
    }

    /// Reorder `hits` using the judge. The returned list always has the same
    /// length and membership as the input.
    pub async fn rerank(
        &self,
        judge: &dyn RelevanceJudge,
        question: &str,
        hits: Vec<FusedHit>,
    ) -> Vec<FusedHit> {
        let k = self.top_k.min(hits.len());
        if k == 0 {
            return hits;
        }

        let candidates: Vec<String> = hits[..k].iter().map(|h| h.display_text.clone()).collect();
        let grades = match judge.grade(question, &candidates).await {
            Ok(grades) => grades,
            Err(e) => {
                warn!("relevance judge failed, keeping fused order: {e}");
                return hits;
            }
        };

        if grades.len() != k || grades.iter().any(|&g| g > Self::MAX_GRADE) {
            warn!(
                "relevance judge returned malformed grades ({} for {} candidates), keeping fused order",
                grades.len(),
                k
            );
            return hits;
        }

        let max_fused = hits[..k]
            .iter()
            .map(|h| h.fused_score)
            .fold(f32::MIN, f32::max);

        let mut head: Vec<(usize, FusedHit, f32)> = hits
            .into_iter()
            .enumerate()
            .map(|(position, hit)| {
                let blended = if position < k {
                    let normalized_fused = if max_fused > 0.0 {
                        hit.fused_score / max_fused
                    } else {
                        0.0
                    };
                    let normalized_grade = grades[position] as f32 / Self::MAX_GRADE as f32;
                    (1.0 - self.grade_weight) * normalized_fused
                        + self.grade_weight * normalized_grade
                } else {
                    // The tail never moves.
                    f32::MIN
                };
                (position, hit, blended)
            })
            .collect();

        let tail = head.split_off(k);
        head.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        head.into_iter()
            .chain(tail)
            .map(|(_, hit, _)| hit)
            .collect()
    }
}

impl Default for Reranker {
    fn default() -> Self {
        Self::new(10, 0.5)
    }
}

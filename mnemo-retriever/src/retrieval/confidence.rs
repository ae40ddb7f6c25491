//! Confidence grading for fused retrieval results.
//!
//! Downstream generation needs to know whether to answer, hedge, or refuse.
//! The gate converts the fused list's score distribution into a discrete
//! verdict plus a human-readable reason; it annotates, never filters or
//! reorders.

use super::fusion::{FusedHit, max_fused_score};
use serde::{Deserialize, Serialize};

/// How strongly the retrieved context supports answering. Ordered from
/// weakest to strongest so verdicts compare naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    /// Nothing matched; the caller must treat grounding as absent, not just
    /// weak.
    None,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfidenceLevel::None => "none",
            ConfidenceLevel::Low => "low",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::High => "high",
        };
        f.write_str(s)
    }
}

/// The gate's verdict over one retrieval.
#[derive(Debug, Clone, Serialize)]
pub struct Confidence {
    pub level: ConfidenceLevel,
    pub reason: String,
}

/// Score bands for the verdict, against the best fused score normalized by
/// the theoretical maximum for the number of variants issued. Tunable;
/// nothing downstream depends on the defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceThresholds {
    pub high: f32,
    pub medium: f32,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            high: 0.65,
            medium: 0.35,
        }
    }
}

/// Grade a fused result list.
///
/// The best fused score is normalized against `variant_count * 1/(k+1)`, the
/// score of a hit ranked first by every variant in one index. `High` is
/// reached either by clearing the high band or by corroboration: a top hit
/// independently surfaced by two or more (variant, index) lists is strong
/// evidence even when each individual score is modest.
pub fn grade_confidence(
    hits: &[FusedHit],
    variant_count: usize,
    rrf_k: f32,
    thresholds: ConfidenceThresholds,
) -> Confidence {
    let Some(top) = hits.first() else {
        return Confidence {
            level: ConfidenceLevel::None,
            reason: "insufficient grounding: no indexed conversation fragments matched the question"
                .to_string(),
        };
    };

    let ceiling = max_fused_score(variant_count.max(1), rrf_k);
    let normalized = if ceiling > 0.0 {
        top.fused_score / ceiling
    } else {
        0.0
    };
    let corroborated = top.contributing.len() >= 2;

    let level = if corroborated || normalized >= thresholds.high {
        ConfidenceLevel::High
    } else if normalized >= thresholds.medium {
        ConfidenceLevel::Medium
    } else {
        ConfidenceLevel::Low
    };

    let reason = if corroborated {
        format!(
            "top hit corroborated by {} result lists (normalized score {normalized:.2})",
            top.contributing.len()
        )
    } else {
        format!("top hit normalized score {normalized:.2} across {variant_count} query variants")
    };

    Confidence { level, reason }
}

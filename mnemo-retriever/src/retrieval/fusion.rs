//! Reciprocal Rank Fusion over per-(variant, index) hit lists.
//!
//! Each query variant produces one ranked list per index, so a single
//! retrieval yields up to `variants * 2` lists. RRF merges them without
//! comparing raw similarity scores across lists (they are not comparable
//! between indexes): a hit at 0-based rank `r` in one list contributes
//! `1 / (k + r + 1)`, and a hit's fused score is the sum of its contributions
//! over every list it appears in. Items surfaced independently by several
//! phrasings or by both indexes therefore outrank items that merely scored
//! well once — a robustness signal raw similarity does not provide.
//!
//! Deduplication uses a normalized form of the display text (lowercased,
//! whitespace-collapsed, hashed with blake3), which also collapses the same
//! fragment surfacing through both indexes. The first-seen display text wins;
//! contributions accumulate.

use crate::storage::IndexKind;
use mnemo_dialog::normalize_text;
use serde::Serialize;

/// Default RRF constant, per the standard literature value.
pub const DEFAULT_RRF_K: f32 = 60.0;

/// One raw nearest-neighbor match, tagged with where it came from. Transient;
/// never persisted.
#[derive(Debug, Clone)]
pub struct Hit {
    pub source_key: i64,
    pub display_text: String,
    /// Cosine similarity against the originating query variant.
    pub raw_score: f32,
    pub origin_index: IndexKind,
    /// 0-based index of the query variant that produced this hit.
    pub origin_query: usize,
}

/// A deduplicated, fused result.
#[derive(Debug, Clone, Serialize)]
pub struct FusedHit {
    pub source_key: i64,
    pub origin_index: IndexKind,
    pub display_text: String,
    /// Raw similarity from the first list this hit was seen in.
    pub raw_score: f32,
    pub fused_score: f32,
    /// Every `(variant, index)` list that surfaced this hit.
    pub contributing: Vec<(usize, IndexKind)>,
}

struct FusedEntry {
    hit: FusedHit,
    /// Position of first appearance, for stable ordering.
    arrival: usize,
    /// Best (lowest) 0-based rank across contributing lists.
    best_rank: usize,
    /// Earliest contributing variant, the primary tie-break.
    earliest_query: usize,
}

/// Fuse ranked hit lists into one ordered, deduplicated list.
///
/// Each inner slice must be one (variant, index) result list in descending
/// relevance order. The output is deterministic for identical inputs: ties on
/// fused score break by earliest contributing variant, then by best original
/// rank, then by order of first appearance.
pub fn rrf_fuse(lists: &[Vec<Hit>], k: f32) -> Vec<FusedHit> {
    let mut entries: Vec<FusedEntry> = Vec::new();
    let mut by_key: std::collections::HashMap<[u8; 32], usize> = std::collections::HashMap::new();

    for list in lists {
        for (rank, hit) in list.iter().enumerate() {
            let contribution = 1.0 / (k + rank as f32 + 1.0);
            let key: [u8; 32] = blake3::hash(normalize_text(&hit.display_text).as_bytes()).into();

            match by_key.get(&key) {
                Some(&idx) => {
                    let entry = &mut entries[idx];
                    entry.hit.fused_score += contribution;
                    entry
                        .hit
                        .contributing
                        .push((hit.origin_query, hit.origin_index));
                    entry.best_rank = entry.best_rank.min(rank);
                    entry.earliest_query = entry.earliest_query.min(hit.origin_query);
                }
                None => {
                    by_key.insert(key, entries.len());
                    entries.push(FusedEntry {
                        hit: FusedHit {
                            source_key: hit.source_key,
                            origin_index: hit.origin_index,
                            display_text: hit.display_text.clone(),
                            raw_score: hit.raw_score,
                            fused_score: contribution,
                            contributing: vec![(hit.origin_query, hit.origin_index)],
                        },
                        arrival: entries.len(),
                        best_rank: rank,
                        earliest_query: hit.origin_query,
                    });
                }
            }
        }
    }

    entries.sort_by(|a, b| {
        b.hit
            .fused_score
            .partial_cmp(&a.hit.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.earliest_query.cmp(&b.earliest_query))
            .then(a.best_rank.cmp(&b.best_rank))
            .then(a.arrival.cmp(&b.arrival))
    });

    entries.into_iter().map(|e| e.hit).collect()
}

/// The largest fused score a single hit can reach from `variant_count`
/// variants at rank 0 in one index each; the confidence gate normalizes
/// against this.
pub fn max_fused_score(variant_count: usize, k: f32) -> f32 {
    variant_count as f32 * (1.0 / (k + 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(key: i64, text: &str, query: usize, index: IndexKind) -> Hit {
        Hit {
            source_key: key,
            display_text: text.to_string(),
            raw_score: 0.5,
            origin_index: index,
            origin_query: query,
        }
    }

    #[test]
    fn corroborated_hit_outranks_single_list_hits() {
        // Variant 0 returns [m1, m2]; variant 1 returns [m2, m3]. With k=60,
        // m2 scores 1/61 + 1/61 while m1 and m3 each score 1/62... except m1
        // and m3 sit at different ranks: m1 at rank 0 (1/61), m3 at rank 1
        // (1/62). m2 leads.
        let lists = vec![
            vec![
                hit(1, "m1", 0, IndexKind::Message),
                hit(2, "m2", 0, IndexKind::Message),
            ],
            vec![
                hit(2, "m2", 1, IndexKind::Message),
                hit(3, "m3", 1, IndexKind::Message),
            ],
        ];

        let fused = rrf_fuse(&lists, 60.0);
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].display_text, "m2");

        let m2 = &fused[0];
        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((m2.fused_score - expected).abs() < 1e-6);
        assert_eq!(
            m2.contributing,
            vec![(0, IndexKind::Message), (1, IndexKind::Message)]
        );
    }

    #[test]
    fn rank_zero_in_n_lists_scores_n_over_k_plus_one() {
        let lists = vec![
            vec![hit(5, "the deploy discussion", 0, IndexKind::Message)],
            vec![hit(5, "the deploy discussion", 1, IndexKind::Message)],
            vec![hit(5, "the deploy discussion", 0, IndexKind::Window)],
        ];

        let fused = rrf_fuse(&lists, 60.0);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].fused_score - 3.0 / 61.0).abs() < 1e-6);
        assert!((fused[0].fused_score - max_fused_score(3, 60.0)).abs() < 1e-6);
    }

    #[test]
    fn equal_scores_break_ties_by_earliest_query_then_rank() {
        // m1: rank 0 for variant 0. m3: rank 0 for variant 1. Same score;
        // m1 wins on earlier variant.
        let lists = vec![
            vec![hit(1, "m1", 0, IndexKind::Message)],
            vec![hit(3, "m3", 1, IndexKind::Message)],
        ];
        let fused = rrf_fuse(&lists, 60.0);
        assert_eq!(fused[0].display_text, "m1");
        assert_eq!(fused[1].display_text, "m3");
    }

    #[test]
    fn fusion_is_deterministic() {
        let lists = vec![
            vec![
                hit(1, "alpha", 0, IndexKind::Message),
                hit(2, "beta", 0, IndexKind::Message),
                hit(3, "gamma", 0, IndexKind::Message),
            ],
            vec![
                hit(10, "beta", 0, IndexKind::Window),
                hit(11, "delta", 0, IndexKind::Window),
            ],
            vec![
                hit(3, "gamma", 1, IndexKind::Message),
                hit(1, "alpha", 1, IndexKind::Message),
            ],
        ];

        let first = rrf_fuse(&lists, 60.0);
        let second = rrf_fuse(&lists, 60.0);

        let orders: Vec<Vec<(i64, String)>> = [&first, &second]
            .iter()
            .map(|run| {
                run.iter()
                    .map(|h| (h.source_key, format!("{:.6}", h.fused_score)))
                    .collect()
            })
            .collect();
        assert_eq!(orders[0], orders[1]);
    }

    #[test]
    fn dedup_by_normalized_text_merges_contributors() {
        // Same fragment, different whitespace and case, surfaced by two
        // variants: one fused hit crediting both.
        let lists = vec![
            vec![hit(7, "Alice:  lunch at NOON?", 0, IndexKind::Message)],
            vec![hit(7, "alice: lunch at noon?", 1, IndexKind::Message)],
        ];

        let fused = rrf_fuse(&lists, 60.0);
        assert_eq!(fused.len(), 1);
        assert_eq!(
            fused[0].contributing,
            vec![(0, IndexKind::Message), (1, IndexKind::Message)]
        );
        // First-seen display text wins.
        assert_eq!(fused[0].display_text, "Alice:  lunch at NOON?");
        assert!((fused[0].fused_score - 2.0 / 61.0).abs() < 1e-6);
    }

    #[test]
    fn empty_input_fuses_to_empty() {
        assert!(rrf_fuse(&[], 60.0).is_empty());
        assert!(rrf_fuse(&[vec![], vec![]], 60.0).is_empty());
    }
}

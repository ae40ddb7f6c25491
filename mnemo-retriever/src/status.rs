//! Operational visibility types for the indexing pipeline.

use serde::{Deserialize, Serialize};

/// Backlog accounting for one indexer over one conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerStatus {
    /// Source items the indexer knows about (for windows, an upper-bound
    /// estimate; see `WindowIndexer::status`).
    pub total: usize,
    /// Records currently present in the index partition.
    pub indexed: usize,
    /// Items not yet indexed.
    pub pending: usize,
}

impl IndexerStatus {
    pub fn merge(&mut self, other: IndexerStatus) {
        self.total += other.total;
        self.indexed += other.indexed;
        self.pending += other.pending;
    }
}

/// Aggregated status for one indexer across all conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerReport {
    pub name: String,
    pub status: IndexerStatus,
}

/// The full status surface returned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingReport {
    pub conversations: usize,
    pub indexers: Vec<IndexerReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates_all_fields() {
        let mut status = IndexerStatus {
            total: 10,
            indexed: 4,
            pending: 6,
        };
        status.merge(IndexerStatus {
            total: 5,
            indexed: 5,
            pending: 0,
        });
        assert_eq!(
            status,
            IndexerStatus {
                total: 15,
                indexed: 9,
                pending: 6
            }
        );
    }
}

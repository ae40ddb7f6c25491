//! Storage abstraction layer for mnemo-retriever.
//!
//! The core never talks to a concrete database: indexing and retrieval are
//! written against three small capability traits, and everything else about
//! persistence (engine, schema, consistency) belongs to the implementation
//! behind them.
//!
//! - [`VectorStore`]: the two vector index partitions (messages, windows),
//!   keyed by `(conversation_id, source_key)` with upsert semantics.
//! - [`MessageSource`]: the append-only raw message log, fetched in cursor
//!   order.
//! - [`CursorStore`]: per-`(indexer, conversation)` resume positions.
//!
//! [`sqlite_store::SqliteStore`] implements all three over one SQLite file,
//! which is the bundled default; deployments with a dedicated vector database
//! swap in their own `VectorStore` without touching the rest of the crate.

pub mod sqlite_store;

use anyhow::Result;
use async_trait::async_trait;
use half::f16;
use mnemo_dialog::ChatMessage;
use serde::{Deserialize, Serialize};

/// Which of the two parallel indexes a record or query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// One record per message, embedded as a single `"author: text"` line.
    Message,
    /// One record per dialog window, embedded with full surrounding context.
    Window,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Message => "messages",
            IndexKind::Window => "windows",
        }
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One embedded record in a vector index partition.
///
/// Exactly one current record exists per `(index, conversation_id,
/// source_key)`: re-indexing overwrites, never appends. For message records
/// the span fields collapse to the message itself (`size == 1`).
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub conversation_id: i64,
    /// Message id (message index) or window center id (window index).
    pub source_key: i64,
    pub embedding: Vec<f16>,
    pub display_text: String,
    pub start_message_id: i64,
    pub end_message_id: i64,
    pub size: usize,
}

/// A nearest-neighbor match returned by [`VectorStore::query`].
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub source_key: i64,
    pub display_text: String,
    pub similarity: f32,
}

/// A stored window row, as returned by the membership lookup.
#[derive(Debug, Clone)]
pub struct StoredWindow {
    pub source_key: i64,
    pub start_message_id: i64,
    pub end_message_id: i64,
    pub display_text: String,
}

/// The vector index partitions: upsert by key, nearest-neighbor query,
/// truncation. Read-after-write visibility within a bounded delay is assumed;
/// nothing stronger.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace records by `(conversation_id, source_key)`.
    async fn upsert(&self, index: IndexKind, records: &[IndexRecord]) -> Result<()>;

    /// Nearest-neighbor query within one conversation's partition, best
    /// first, capped at `limit`.
    async fn query(
        &self,
        index: IndexKind,
        conversation_id: i64,
        query: &[f16],
        limit: usize,
    ) -> Result<Vec<ScoredRecord>>;

    /// Drop all records in the index, or only one conversation's partition.
    async fn delete_all(&self, index: IndexKind, conversation_id: Option<i64>) -> Result<()>;

    /// Number of records currently stored for a conversation.
    async fn count(&self, index: IndexKind, conversation_id: i64) -> Result<usize>;

    /// Windows whose member span encloses the given message id. A membership
    /// lookup, not an embedding search.
    async fn enclosing_windows(
        &self,
        conversation_id: i64,
        message_id: i64,
    ) -> Result<Vec<StoredWindow>>;
}

/// The raw message log. Ordered by message id within a conversation and
/// resumable from any key.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Messages with id strictly greater than `after`, ascending, capped at
    /// `limit`.
    async fn fetch(&self, conversation_id: i64, after: i64, limit: usize) -> Result<Vec<ChatMessage>>;

    /// The last up-to-`limit` messages with id less than or equal to `upto`,
    /// ascending. Used to rebuild dialog context around a resume point.
    async fn fetch_before(
        &self,
        conversation_id: i64,
        upto: i64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>>;

    /// Total messages in a conversation.
    async fn count(&self, conversation_id: i64) -> Result<usize>;

    /// Messages with id strictly greater than `after`.
    async fn count_after(&self, conversation_id: i64, after: i64) -> Result<usize>;

    /// All conversation ids present in the log.
    async fn conversations(&self) -> Result<Vec<i64>>;
}

/// Persisted resume positions, keyed by `(indexer_name, conversation_id)`.
/// A missing entry reads as 0 (start of the log).
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, indexer: &str, conversation_id: i64) -> Result<i64>;

    async fn set(&self, indexer: &str, conversation_id: i64, last_key: i64) -> Result<()>;

    /// Forget the cursor for one conversation, or for all of them.
    async fn reset(&self, indexer: &str, conversation_id: Option<i64>) -> Result<()>;
}

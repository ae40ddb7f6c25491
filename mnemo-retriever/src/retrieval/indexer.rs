//! The two index handlers driven by the orchestrator.
//!
//! Both indexes are kept current by the same machinery: an [`Indexer`]
//! exposes a uniform fetch/render/key surface over its source items, and the
//! orchestrator owns the embed-and-upsert pipeline around it. The message
//! indexer maps the raw log one-to-one into records; the window indexer runs
//! the dialog segmenter over the log and records one entry per window.

use crate::status::IndexerStatus;
use crate::storage::{IndexKind, IndexRecord, MessageSource, VectorStore};
use anyhow::Result;
use async_trait::async_trait;
use half::f16;
use mnemo_dialog::{DialogSegmenter, SegmenterConfig};
use std::sync::Arc;

/// One unit of indexable content produced by an indexer's fetch phase.
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub source_key: i64,
    /// Shown to consumers in hit lists.
    pub display_text: String,
    /// Handed to the embedding provider; usually identical to the display
    /// text.
    pub embed_text: String,
    pub start_message_id: i64,
    pub end_message_id: i64,
    pub size: usize,
}

impl SourceItem {
    /// Build the stored record once the orchestrator has an embedding for
    /// this item.
    pub fn into_record(self, conversation_id: i64, embedding: Vec<f16>) -> IndexRecord {
        IndexRecord {
            conversation_id,
            source_key: self.source_key,
            embedding,
            display_text: self.display_text,
            start_message_id: self.start_message_id,
            end_message_id: self.end_message_id,
            size: self.size,
        }
    }
}

/// A uniform handler over one index partition: fetch items past a cursor,
/// render them for embedding, upsert the embedded records. Implementations
/// must fetch in ascending key order so cursor advancement is meaningful.
#[async_trait]
pub trait Indexer: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> IndexKind;

    /// Items with key strictly greater than `after`, ascending, at most
    /// `limit` of them.
    async fn fetch(&self, conversation_id: i64, after: i64, limit: usize)
    -> Result<Vec<SourceItem>>;

    /// The text handed to the embedding provider for one item.
    fn render(&self, item: &SourceItem) -> String {
        item.embed_text.clone()
    }

    /// The cursor key for one item.
    fn key(&self, item: &SourceItem) -> i64 {
        item.source_key
    }

    /// Insert or replace the embedded records in this indexer's partition.
    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<()>;

    /// Drop this indexer's partition (one conversation, or everything).
    async fn truncate(&self, conversation_id: Option<i64>) -> Result<()>;

    /// Backlog accounting for one conversation given the current cursor.
    async fn status(&self, conversation_id: i64, cursor: i64) -> Result<IndexerStatus>;
}

/// Indexes every substantive message as a single `"author: text"` record.
pub struct MessageIndexer {
    source: Arc<dyn MessageSource>,
    store: Arc<dyn VectorStore>,
}

impl MessageIndexer {
    pub const NAME: &'static str = "messages";

    pub fn new(source: Arc<dyn MessageSource>, store: Arc<dyn VectorStore>) -> Self {
        Self { source, store }
    }
}

#[async_trait]
impl Indexer for MessageIndexer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Message
    }

    async fn fetch(
        &self,
        conversation_id: i64,
        after: i64,
        limit: usize,
    ) -> Result<Vec<SourceItem>> {
        let messages = self.source.fetch(conversation_id, after, limit).await?;
        Ok(messages
            .into_iter()
            .filter(|m| !m.text.trim().is_empty())
            .map(|m| {
                let line = m.render_line();
                SourceItem {
                    source_key: m.message_id,
                    display_text: line.clone(),
                    embed_text: line,
                    start_message_id: m.message_id,
                    end_message_id: m.message_id,
                    size: 1,
                }
            })
            .collect())
    }

    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<()> {
        self.store.upsert(IndexKind::Message, &records).await
    }

    async fn truncate(&self, conversation_id: Option<i64>) -> Result<()> {
        self.store.delete_all(IndexKind::Message, conversation_id).await
    }

    async fn status(&self, conversation_id: i64, _cursor: i64) -> Result<IndexerStatus> {
        let total = self.source.count(conversation_id).await?;
        let indexed = self.store.count(IndexKind::Message, conversation_id).await?;
        Ok(IndexerStatus {
            total,
            indexed,
            pending: total.saturating_sub(indexed),
        })
    }
}

/// Indexes overlapping dialog windows, one record per window center.
///
/// The cursor is the last center id already windowed. Each fetch re-segments
/// a bounded context — up to `2 * max_window_size` messages at or before the
/// cursor plus the post-cursor batch — and keeps only windows whose center
/// lies past the cursor. Dialogs straddling the resume point are therefore
/// re-derived with identical keys, and upsert-by-key absorbs the overlap.
pub struct WindowIndexer {
    source: Arc<dyn MessageSource>,
    store: Arc<dyn VectorStore>,
    segmenter: DialogSegmenter,
}

impl WindowIndexer {
    pub const NAME: &'static str = "windows";

    pub fn new(
        source: Arc<dyn MessageSource>,
        store: Arc<dyn VectorStore>,
        config: SegmenterConfig,
    ) -> Self {
        Self {
            source,
            store,
            segmenter: DialogSegmenter::new(config),
        }
    }

    fn context_lookback(&self) -> usize {
        self.segmenter.config().max_window_size * 2
    }

    fn fresh_fetch_size(&self, limit: usize) -> usize {
        // Enough messages to produce `limit` windows even when every window
        // advances by a full step, plus one window's worth of slack.
        limit * self.segmenter.config().window_step + self.segmenter.config().max_window_size
    }
}

#[async_trait]
impl Indexer for WindowIndexer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Window
    }

    async fn fetch(
        &self,
        conversation_id: i64,
        after: i64,
        limit: usize,
    ) -> Result<Vec<SourceItem>> {
        let fresh = self
            .source
            .fetch(conversation_id, after, self.fresh_fetch_size(limit))
            .await?;
        if fresh.is_empty() {
            return Ok(Vec::new());
        }

        let mut messages = self
            .source
            .fetch_before(conversation_id, after, self.context_lookback())
            .await?;
        messages.extend(fresh);

        let mut items: Vec<SourceItem> = self
            .segmenter
            .windows(&messages)
            .into_iter()
            .filter(|w| w.center_message_id > after)
            .map(|w| SourceItem {
                source_key: w.center_message_id,
                display_text: w.window_text.clone(),
                embed_text: w.window_text,
                start_message_id: w.start_message_id,
                end_message_id: w.end_message_id,
                size: w.size,
            })
            .collect();
        items.truncate(limit);
        Ok(items)
    }

    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<()> {
        self.store.upsert(IndexKind::Window, &records).await
    }

    async fn truncate(&self, conversation_id: Option<i64>) -> Result<()> {
        self.store.delete_all(IndexKind::Window, conversation_id).await
    }

    async fn status(&self, conversation_id: i64, cursor: i64) -> Result<IndexerStatus> {
        // Windows cannot be enumerated ahead of segmentation, so pending is
        // the count of source messages not yet considered for windowing — an
        // upper-bound proxy, good enough for operational visibility.
        let indexed = self.store.count(IndexKind::Window, conversation_id).await?;
        let pending = self.source.count_after(conversation_id, cursor).await?;
        Ok(IndexerStatus {
            total: indexed + pending,
            indexed,
            pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite_store::SqliteStore;
    use chrono::{TimeZone, Utc};
    use mnemo_dialog::ChatMessage;

    fn message(id: i64, text: &str) -> ChatMessage {
        ChatMessage {
            conversation_id: 1,
            message_id: id,
            author_id: 10 + id % 2,
            author_name: format!("user{}", id % 2),
            text: text.to_string(),
            sent_at: Utc.timestamp_opt(1_700_000_000 + id * 60, 0).unwrap(),
        }
    }

    async fn seeded_store(count: i64) -> Result<Arc<SqliteStore>> {
        let store = Arc::new(SqliteStore::open_memory().await?);
        let messages: Vec<ChatMessage> = (1..=count)
            .map(|i| message(i, &format!("substantive message number {i}")))
            .collect();
        store.insert_messages(&messages).await?;
        Ok(store)
    }

    #[tokio::test]
    async fn message_indexer_fetches_past_cursor_and_renders_author_lines() -> Result<()> {
        let store = seeded_store(5).await?;
        let indexer = MessageIndexer::new(store.clone(), store.clone());

        let items = indexer.fetch(1, 2, 10).await?;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].source_key, 3);
        assert_eq!(items[0].display_text, "user1: substantive message number 3");
        assert_eq!(indexer.render(&items[0]), items[0].embed_text);
        assert_eq!(indexer.key(&items[0]), 3);
        Ok(())
    }

    #[tokio::test]
    async fn window_indexer_emits_only_windows_past_cursor() -> Result<()> {
        let store = seeded_store(30).await?;
        let indexer = WindowIndexer::new(store.clone(), store.clone(), SegmenterConfig::default());

        let first = indexer.fetch(1, 0, 10).await?;
        assert!(!first.is_empty());
        for item in &first {
            assert!(item.size >= 3 && item.size <= 12);
        }

        // Resuming from the last center re-derives no already-emitted keys.
        let cursor = first.last().unwrap().source_key;
        let second = indexer.fetch(1, cursor, 10).await?;
        for item in &second {
            assert!(item.source_key > cursor);
        }
        Ok(())
    }

    #[tokio::test]
    async fn window_indexer_is_quiet_when_no_new_messages() -> Result<()> {
        let store = seeded_store(10).await?;
        let indexer = WindowIndexer::new(store.clone(), store.clone(), SegmenterConfig::default());

        let items = indexer.fetch(1, 10, 10).await?;
        assert!(items.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn statuses_account_for_backlog() -> Result<()> {
        let store = seeded_store(8).await?;
        let messages = MessageIndexer::new(store.clone(), store.clone());
        let windows =
            WindowIndexer::new(store.clone(), store.clone(), SegmenterConfig::default());

        let status = messages.status(1, 0).await?;
        assert_eq!(status.total, 8);
        assert_eq!(status.indexed, 0);
        assert_eq!(status.pending, 8);

        let status = windows.status(1, 3).await?;
        assert_eq!(status.indexed, 0);
        assert_eq!(status.pending, 5);
        Ok(())
    }
}

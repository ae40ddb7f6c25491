//! SQLite implementation of the storage traits.
//!
//! One database file holds the raw message log, both vector index partitions,
//! and the indexer cursors. Embeddings are stored as BLOBs of little-endian
//! f16 and compared with an in-memory cosine scan per conversation partition;
//! conversations are small enough that a brute-force scan beats maintaining a
//! vector extension, and the [`VectorStore`] seam leaves room to swap one in.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE messages (
//!     conversation_id INTEGER,
//!     message_id INTEGER,
//!     author_id INTEGER,
//!     author_name TEXT,
//!     text TEXT,
//!     sent_at INTEGER,             -- unix seconds
//!     PRIMARY KEY (conversation_id, message_id)
//! );
//!
//! -- message_records and window_records share one shape; message records
//! -- collapse the span to the message itself.
//! CREATE TABLE message_records (
//!     conversation_id INTEGER,
//!     source_key INTEGER,
//!     display_text TEXT,
//!     embedding BLOB,              -- f16 vector
//!     start_message_id INTEGER,
//!     end_message_id INTEGER,
//!     size INTEGER,
//!     indexed_at TIMESTAMP,
//!     PRIMARY KEY (conversation_id, source_key)
//! );
//!
//! CREATE TABLE cursors (
//!     indexer_name TEXT,
//!     conversation_id INTEGER,
//!     last_key INTEGER,
//!     PRIMARY KEY (indexer_name, conversation_id)
//! );
//! ```

use super::{CursorStore, IndexKind, IndexRecord, MessageSource, ScoredRecord, StoredWindow, VectorStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use half::f16;
use mnemo_dialog::ChatMessage;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;

/// SQLite-backed implementation of [`VectorStore`], [`MessageSource`] and
/// [`CursorStore`]. See module docs for the schema.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn records_table(index: IndexKind) -> &'static str {
    match index {
        IndexKind::Message => "message_records",
        IndexKind::Window => "window_records",
    }
}

/// Cosine similarity over f16 vectors. Embedding providers normalize their
/// output, so for well-behaved inputs this is just the dot product; the norm
/// division guards against records written by a non-normalizing provider.
pub fn cosine_similarity(a: &[f16], b: &[f16]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = x.to_f32();
        let y = y.to_f32();
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

impl SqliteStore {
    /// Open or create the database at `base/mnemo.db`.
    pub async fn open(base: &Path) -> Result<Self> {
        let db_path = base.join("mnemo.db");

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(db_path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .create_if_missing(true)
                .page_size(1 << 16),
        )
        .await?;
        Self::new_with_pool(pool).await
    }

    /// Open an in-memory database, primarily for tests.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::new_with_pool(pool).await
    }

    async fn new_with_pool(pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                conversation_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                author_id INTEGER NOT NULL,
                author_name TEXT NOT NULL,
                text TEXT NOT NULL,
                sent_at INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, message_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        for table in ["message_records", "window_records"] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    conversation_id INTEGER NOT NULL,
                    source_key INTEGER NOT NULL,
                    display_text TEXT NOT NULL,
                    embedding BLOB NOT NULL,
                    start_message_id INTEGER NOT NULL,
                    end_message_id INTEGER NOT NULL,
                    size INTEGER NOT NULL,
                    indexed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                    PRIMARY KEY (conversation_id, source_key)
                )
                "#
            ))
            .execute(pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cursors (
                indexer_name TEXT NOT NULL,
                conversation_id INTEGER NOT NULL,
                last_key INTEGER NOT NULL,
                PRIMARY KEY (indexer_name, conversation_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_sent ON messages(conversation_id, sent_at)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_window_span
             ON window_records(conversation_id, start_message_id, end_message_id)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace raw messages (the ingestion path).
    pub async fn insert_messages(&self, messages: &[ChatMessage]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for m in messages {
            sqlx::query(
                r#"
                INSERT INTO messages (conversation_id, message_id, author_id, author_name, text, sent_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(conversation_id, message_id) DO UPDATE SET
                    author_id = excluded.author_id,
                    author_name = excluded.author_name,
                    text = excluded.text,
                    sent_at = excluded.sent_at
                "#,
            )
            .bind(m.conversation_id)
            .bind(m.message_id)
            .bind(m.author_id)
            .bind(&m.author_name)
            .bind(&m.text)
            .bind(m.sent_at.timestamp())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Apply an author-name correction.
    ///
    /// Updates the raw messages and resets the indexers' cursors for the
    /// conversation so the next orchestrator cycle re-renders and re-embeds
    /// everything the author touched; upsert-by-key absorbs the rewrite.
    pub async fn rename_author(
        &self,
        conversation_id: i64,
        author_id: i64,
        new_name: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET author_name = ?1 WHERE conversation_id = ?2 AND author_id = ?3",
        )
        .bind(new_name)
        .bind(conversation_id)
        .bind(author_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            sqlx::query("DELETE FROM cursors WHERE conversation_id = ?1")
                .bind(conversation_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(result.rows_affected())
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<ChatMessage> {
        let sent_at_secs: i64 = row.get("sent_at");
        let sent_at: DateTime<Utc> = DateTime::from_timestamp(sent_at_secs, 0)
            .with_context(|| format!("message carries invalid timestamp {sent_at_secs}"))?;
        Ok(ChatMessage {
            conversation_id: row.get("conversation_id"),
            message_id: row.get("message_id"),
            author_id: row.get("author_id"),
            author_name: row.get("author_name"),
            text: row.get("text"),
            sent_at,
        })
    }
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert(&self, index: IndexKind, records: &[IndexRecord]) -> Result<()> {
        let table = records_table(index);
        let mut tx = self.pool.begin().await?;

        for record in records {
            let embedding_bytes = bytemuck::cast_slice::<f16, u8>(&record.embedding);
            sqlx::query(&format!(
                r#"
                INSERT INTO {table}
                    (conversation_id, source_key, display_text, embedding,
                     start_message_id, end_message_id, size, indexed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
                ON CONFLICT(conversation_id, source_key) DO UPDATE SET
                    display_text = excluded.display_text,
                    embedding = excluded.embedding,
                    start_message_id = excluded.start_message_id,
                    end_message_id = excluded.end_message_id,
                    size = excluded.size,
                    indexed_at = datetime('now')
                "#
            ))
            .bind(record.conversation_id)
            .bind(record.source_key)
            .bind(&record.display_text)
            .bind(embedding_bytes)
            .bind(record.start_message_id)
            .bind(record.end_message_id)
            .bind(record.size as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        index: IndexKind,
        conversation_id: i64,
        query: &[f16],
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let table = records_table(index);
        let rows = sqlx::query(&format!(
            "SELECT source_key, display_text, embedding FROM {table}
             WHERE conversation_id = ?1 ORDER BY source_key"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<ScoredRecord> = Vec::with_capacity(rows.len());
        for row in rows {
            let embedding_bytes: Vec<u8> = row.get("embedding");
            let embedding: &[f16] = bytemuck::cast_slice::<u8, f16>(&embedding_bytes);
            scored.push(ScoredRecord {
                source_key: row.get("source_key"),
                display_text: row.get("display_text"),
                similarity: cosine_similarity(query, embedding),
            });
        }

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.source_key.cmp(&b.source_key))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn delete_all(&self, index: IndexKind, conversation_id: Option<i64>) -> Result<()> {
        let table = records_table(index);
        match conversation_id {
            Some(conversation) => {
                sqlx::query(&format!("DELETE FROM {table} WHERE conversation_id = ?1"))
                    .bind(conversation)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query(&format!("DELETE FROM {table}"))
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn count(&self, index: IndexKind, conversation_id: i64) -> Result<usize> {
        let table = records_table(index);
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} WHERE conversation_id = ?1"
        ))
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn enclosing_windows(
        &self,
        conversation_id: i64,
        message_id: i64,
    ) -> Result<Vec<StoredWindow>> {
        let rows = sqlx::query(
            "SELECT source_key, start_message_id, end_message_id, display_text
             FROM window_records
             WHERE conversation_id = ?1 AND start_message_id <= ?2 AND end_message_id >= ?2
             ORDER BY size DESC, source_key",
        )
        .bind(conversation_id)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| StoredWindow {
                source_key: row.get("source_key"),
                start_message_id: row.get("start_message_id"),
                end_message_id: row.get("end_message_id"),
                display_text: row.get("display_text"),
            })
            .collect())
    }
}

#[async_trait]
impl MessageSource for SqliteStore {
    async fn fetch(&self, conversation_id: i64, after: i64, limit: usize) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT conversation_id, message_id, author_id, author_name, text, sent_at
             FROM messages WHERE conversation_id = ?1 AND message_id > ?2
             ORDER BY message_id LIMIT ?3",
        )
        .bind(conversation_id)
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_message).collect()
    }

    async fn fetch_before(
        &self,
        conversation_id: i64,
        upto: i64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        // Take the last `limit` ids at or below the cursor, then restore
        // ascending order.
        let rows = sqlx::query(
            "SELECT conversation_id, message_id, author_id, author_name, text, sent_at
             FROM messages WHERE conversation_id = ?1 AND message_id <= ?2
             ORDER BY message_id DESC LIMIT ?3",
        )
        .bind(conversation_id)
        .bind(upto)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<ChatMessage> =
            rows.iter().map(Self::row_to_message).collect::<Result<_>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn count(&self, conversation_id: i64) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = ?1")
                .bind(conversation_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    async fn count_after(&self, conversation_id: i64, after: i64) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND message_id > ?2",
        )
        .bind(conversation_id)
        .bind(after)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn conversations(&self) -> Result<Vec<i64>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT DISTINCT conversation_id FROM messages ORDER BY conversation_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }
}

#[async_trait]
impl CursorStore for SqliteStore {
    async fn get(&self, indexer: &str, conversation_id: i64) -> Result<i64> {
        let cursor: Option<i64> = sqlx::query_scalar(
            "SELECT last_key FROM cursors WHERE indexer_name = ?1 AND conversation_id = ?2",
        )
        .bind(indexer)
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(cursor.unwrap_or(0))
    }

    async fn set(&self, indexer: &str, conversation_id: i64, last_key: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cursors (indexer_name, conversation_id, last_key)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(indexer_name, conversation_id) DO UPDATE SET
                last_key = excluded.last_key
            "#,
        )
        .bind(indexer)
        .bind(conversation_id)
        .bind(last_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset(&self, indexer: &str, conversation_id: Option<i64>) -> Result<()> {
        match conversation_id {
            Some(conversation) => {
                sqlx::query(
                    "DELETE FROM cursors WHERE indexer_name = ?1 AND conversation_id = ?2",
                )
                .bind(indexer)
                .bind(conversation)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM cursors WHERE indexer_name = ?1")
                    .bind(indexer)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(conversation: i64, id: i64, author: i64, text: &str) -> ChatMessage {
        ChatMessage {
            conversation_id: conversation,
            message_id: id,
            author_id: author,
            author_name: format!("user{author}"),
            text: text.to_string(),
            sent_at: Utc.timestamp_opt(1_700_000_000 + id * 60, 0).unwrap(),
        }
    }

    fn record(conversation: i64, key: i64, text: &str, embedding: Vec<f32>) -> IndexRecord {
        IndexRecord {
            conversation_id: conversation,
            source_key: key,
            embedding: embedding.into_iter().map(f16::from_f32).collect(),
            display_text: text.to_string(),
            start_message_id: key,
            end_message_id: key,
            size: 1,
        }
    }

    #[tokio::test]
    async fn message_roundtrip_preserves_order_and_fields() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        store
            .insert_messages(&[
                message(1, 3, 10, "third"),
                message(1, 1, 10, "first"),
                message(1, 2, 11, "second"),
                message(2, 1, 12, "other conversation"),
            ])
            .await?;

        let fetched = store.fetch(1, 0, 10).await?;
        assert_eq!(
            fetched.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(fetched[0].text, "first");
        assert_eq!(fetched[0].author_name, "user10");

        assert_eq!(store.fetch(1, 2, 10).await?.len(), 1);
        assert_eq!(MessageSource::count(&store, 1).await?, 3);
        assert_eq!(store.count_after(1, 2).await?, 1);
        assert_eq!(store.conversations().await?, vec![1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn fetch_before_returns_trailing_context_in_order() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        let messages: Vec<ChatMessage> =
            (1..=10).map(|i| message(1, i, 10, "context")).collect();
        store.insert_messages(&messages).await?;

        let before = store.fetch_before(1, 7, 3).await?;
        assert_eq!(
            before.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![5, 6, 7]
        );
        Ok(())
    }

    #[tokio::test]
    async fn upsert_overwrites_by_key() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        store
            .upsert(
                IndexKind::Message,
                &[record(1, 5, "old text", vec![1.0, 0.0])],
            )
            .await?;
        store
            .upsert(
                IndexKind::Message,
                &[record(1, 5, "new text", vec![0.0, 1.0])],
            )
            .await?;

        assert_eq!(VectorStore::count(&store, IndexKind::Message, 1).await?, 1);
        let hits = store
            .query(
                IndexKind::Message,
                1,
                &[f16::from_f32(0.0), f16::from_f32(1.0)],
                10,
            )
            .await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].display_text, "new text");
        assert!(hits[0].similarity > 0.99);
        Ok(())
    }

    #[tokio::test]
    async fn query_ranks_by_similarity_and_respects_limit() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        store
            .upsert(
                IndexKind::Message,
                &[
                    record(1, 1, "aligned", vec![1.0, 0.0]),
                    record(1, 2, "orthogonal", vec![0.0, 1.0]),
                    record(1, 3, "diagonal", vec![0.7, 0.7]),
                ],
            )
            .await?;

        let query = [f16::from_f32(1.0), f16::from_f32(0.0)];
        let hits = store.query(IndexKind::Message, 1, &query, 2).await?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].display_text, "aligned");
        assert_eq!(hits[1].display_text, "diagonal");

        // Other conversations are invisible.
        assert!(store.query(IndexKind::Message, 2, &query, 10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_all_scopes_to_conversation_when_given() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        store
            .upsert(
                IndexKind::Window,
                &[
                    record(1, 1, "one", vec![1.0, 0.0]),
                    record(2, 1, "two", vec![1.0, 0.0]),
                ],
            )
            .await?;

        store.delete_all(IndexKind::Window, Some(1)).await?;
        assert_eq!(VectorStore::count(&store, IndexKind::Window, 1).await?, 0);
        assert_eq!(VectorStore::count(&store, IndexKind::Window, 2).await?, 1);

        store.delete_all(IndexKind::Window, None).await?;
        assert_eq!(VectorStore::count(&store, IndexKind::Window, 2).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn enclosing_windows_lookup_by_span() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        let mut window = record(1, 10, "a window", vec![1.0, 0.0]);
        window.start_message_id = 7;
        window.end_message_id = 14;
        window.size = 8;
        store.upsert(IndexKind::Window, &[window]).await?;

        let enclosing = store.enclosing_windows(1, 9).await?;
        assert_eq!(enclosing.len(), 1);
        assert_eq!(enclosing[0].source_key, 10);

        assert!(store.enclosing_windows(1, 20).await?.is_empty());
        assert!(store.enclosing_windows(2, 9).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn cursor_roundtrip_and_reset() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        assert_eq!(store.get("messages", 1).await?, 0);

        store.set("messages", 1, 42).await?;
        store.set("messages", 1, 99).await?;
        store.set("windows", 1, 7).await?;
        assert_eq!(store.get("messages", 1).await?, 99);
        assert_eq!(store.get("windows", 1).await?, 7);

        store.reset("messages", Some(1)).await?;
        assert_eq!(store.get("messages", 1).await?, 0);
        assert_eq!(store.get("windows", 1).await?, 7);
        Ok(())
    }

    #[tokio::test]
    async fn rename_author_updates_messages_and_clears_cursors() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        store
            .insert_messages(&[message(1, 1, 10, "hello"), message(1, 2, 11, "hi")])
            .await?;
        store.set("messages", 1, 2).await?;

        let updated = store.rename_author(1, 10, "renamed").await?;
        assert_eq!(updated, 1);

        let fetched = store.fetch(1, 0, 10).await?;
        assert_eq!(fetched[0].author_name, "renamed");
        assert_eq!(fetched[1].author_name, "user11");
        assert_eq!(store.get("messages", 1).await?, 0);

        // Renaming an unknown author is a no-op and keeps cursors intact.
        store.set("messages", 1, 2).await?;
        assert_eq!(store.rename_author(1, 999, "ghost").await?, 0);
        assert_eq!(store.get("messages", 1).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let store = SqliteStore::open(dir.path()).await?;
        store.insert_messages(&[message(1, 1, 10, "persisted")]).await?;
        store.pool().close().await;

        let store = SqliteStore::open(dir.path()).await?;
        let fetched = store.fetch(1, 0, 10).await?;
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].text, "persisted");
        Ok(())
    }

    #[test]
    fn cosine_similarity_basics() {
        let a: Vec<f16> = [1.0f32, 0.0].iter().map(|v| f16::from_f32(*v)).collect();
        let b: Vec<f16> = [0.0f32, 1.0].iter().map(|v| f16::from_f32(*v)).collect();
        assert!(cosine_similarity(&a, &a) > 0.99);
        assert!(cosine_similarity(&a, &b).abs() < 1e-3);
        assert_eq!(cosine_similarity(&a, &[]), 0.0);
    }
}

//! Background indexing orchestrator.
//!
//! One long-lived loop per process keeps every registered [`Indexer`] current
//! against the message log. Each pass over an indexer walks a fixed state
//! sequence — fetch a batch past the cursor, embed the rendered texts, upsert
//! the records, advance the cursor — and the loop wakes on a poll interval,
//! on an explicit command, or immediately again when a batch came back full
//! (adaptive draining).
//!
//! ## Failure policy
//!
//! - Rate limiting pauses the affected indexer until the provider-suggested
//!   (or default) backoff elapses; other indexers keep running.
//! - Any other embedding or storage failure is counted and logged, the
//!   cursor stays put, and the next cycle retries the batch. One bad batch
//!   never halts progress elsewhere.
//! - The cursor advances only after a successful upsert, so a crash or
//!   shutdown mid-batch reprocesses items instead of losing them;
//!   upsert-by-key makes the reprocessing invisible.

use crate::retrieval::indexer::Indexer;
use crate::retrieval::metrics::{MetricsSink, NoopMetrics};
use crate::status::{IndexerReport, IndexerStatus, IndexingReport};
use crate::storage::{CursorStore, MessageSource};
use anyhow::{Context, Result};
use mnemo_embed::EmbeddingProvider;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Phases of one indexing pass, in order. Tracked for logging; the pass
/// itself is a straight-line async function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPhase {
    Idle,
    Fetching,
    Embedding,
    Upserting,
}

/// What a reindex request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexTarget {
    Conversation(i64),
    All,
}

/// Commands accepted by the running orchestrator loop.
#[derive(Debug, Clone, Copy)]
pub enum Command {
    /// Run a cycle now instead of waiting for the poll interval.
    DrainNow,
    /// Truncate and rebuild the targeted index partitions from messages.
    Reindex(ReindexTarget),
}

/// Configuration for the orchestrator loop.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often the loop wakes when nothing else triggers it.
    pub poll_interval: Duration,
    /// Items fetched per indexer pass.
    pub batch_size: usize,
    /// Backoff applied on a rate limit when the provider suggests none.
    pub default_backoff: Duration,
    /// Cap on consecutive adaptive-drain passes per indexer per cycle.
    pub max_drain_passes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 64,
            default_backoff: Duration::from_secs(60),
            max_drain_passes: 100,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_default_backoff(mut self, backoff: Duration) -> Self {
        self.default_backoff = backoff;
        self
    }
}

/// Handle for talking to a running orchestrator from the foreground.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: flume::Sender<Command>,
    shutdown: watch::Sender<bool>,
}

impl OrchestratorHandle {
    /// Ask the loop to run a cycle immediately.
    pub fn drain_now(&self) -> Result<()> {
        self.commands
            .send(Command::DrainNow)
            .map_err(|_| anyhow::anyhow!("orchestrator is no longer running"))
    }

    /// Request a destructive rebuild. Callers are expected to have confirmed
    /// intent (the CLI requires `--yes`).
    pub fn reindex(&self, target: ReindexTarget) -> Result<()> {
        self.commands
            .send(Command::Reindex(target))
            .map_err(|_| anyhow::anyhow!("orchestrator is no longer running"))
    }

    /// Signal the loop to stop after the current pass.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

struct PassOutcome {
    processed: usize,
    full_batch: bool,
}

/// Drives the registered indexers. See module docs for the failure policy.
pub struct IndexingOrchestrator {
    indexers: Vec<Arc<dyn Indexer>>,
    embedder: Arc<dyn EmbeddingProvider>,
    cursors: Arc<dyn CursorStore>,
    source: Arc<dyn MessageSource>,
    metrics: Arc<dyn MetricsSink>,
    config: OrchestratorConfig,
    paused_until: Mutex<HashMap<&'static str, Instant>>,
    commands: flume::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
}

impl IndexingOrchestrator {
    pub fn new(
        indexers: Vec<Arc<dyn Indexer>>,
        embedder: Arc<dyn EmbeddingProvider>,
        cursors: Arc<dyn CursorStore>,
        source: Arc<dyn MessageSource>,
        config: OrchestratorConfig,
    ) -> (Self, OrchestratorHandle) {
        Self::with_metrics(indexers, embedder, cursors, source, config, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        indexers: Vec<Arc<dyn Indexer>>,
        embedder: Arc<dyn EmbeddingProvider>,
        cursors: Arc<dyn CursorStore>,
        source: Arc<dyn MessageSource>,
        config: OrchestratorConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> (Self, OrchestratorHandle) {
        let (command_sender, command_receiver) = flume::unbounded();
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);

        let orchestrator = Self {
            indexers,
            embedder,
            cursors,
            source,
            metrics,
            config,
            paused_until: Mutex::new(HashMap::new()),
            commands: command_receiver,
            shutdown: shutdown_receiver,
        };
        let handle = OrchestratorHandle {
            commands: command_sender,
            shutdown: shutdown_sender,
        };
        (orchestrator, handle)
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run the poll loop until shutdown. Typically spawned as a background
    /// task; foreground retrieval never goes through here.
    pub async fn run(self) {
        info!(
            "indexing orchestrator started ({} indexers, poll every {:?})",
            self.indexers.len(),
            self.config.poll_interval
        );

        let mut shutdown = self.shutdown.clone();
        let commands = self.commands.clone();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                command = commands.recv_async() => {
                    match command {
                        Ok(Command::DrainNow) => {
                            if let Err(e) = self.run_cycle().await {
                                warn!("indexing cycle failed: {e:#}");
                            }
                        }
                        Ok(Command::Reindex(target)) => {
                            if let Err(e) = self.reindex(target).await {
                                warn!("reindex failed: {e:#}");
                            }
                        }
                        Err(_) => break,
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_cycle().await {
                        warn!("indexing cycle failed: {e:#}");
                    }
                }
            }
        }

        info!("indexing orchestrator stopped");
    }

    /// One full cycle: every indexer over every conversation, draining full
    /// batches as they appear. Indexers run concurrently with each other
    /// (their partitions are disjoint); each indexer's own passes stay
    /// sequential so cursor advancement is single-writer.
    pub async fn run_cycle(&self) -> Result<usize> {
        let conversations = self.source.conversations().await?;
        if conversations.is_empty() {
            return Ok(0);
        }

        let passes = self.indexers.iter().map(|indexer| {
            let conversations = conversations.clone();
            async move {
                let mut processed = 0;
                for &conversation in &conversations {
                    processed += self.drain_conversation(indexer.as_ref(), conversation).await;
                    if self.is_shutdown() {
                        break;
                    }
                }
                processed
            }
        });

        let totals = futures::future::join_all(passes).await;
        Ok(totals.into_iter().sum())
    }

    /// Keep passing over one (indexer, conversation) pair while batches come
    /// back full.
    async fn drain_conversation(&self, indexer: &dyn Indexer, conversation_id: i64) -> usize {
        let mut processed = 0;
        for _ in 0..self.config.max_drain_passes {
            if self.is_shutdown() {
                break;
            }
            match self.run_pass(indexer, conversation_id).await {
                Ok(outcome) => {
                    processed += outcome.processed;
                    if !outcome.full_batch {
                        break;
                    }
                    debug!(
                        "{}: full batch for conversation {conversation_id}, draining again",
                        indexer.name()
                    );
                }
                Err(e) => {
                    warn!(
                        "{}: pass failed for conversation {conversation_id}: {e:#}",
                        indexer.name()
                    );
                    break;
                }
            }
        }
        processed
    }

    /// One pass of one indexer: Fetching → Embedding → Upserting, advancing
    /// the cursor only after the upsert lands.
    async fn run_pass(&self, indexer: &dyn Indexer, conversation_id: i64) -> Result<PassOutcome> {
        let name = indexer.name();
        let none = PassOutcome {
            processed: 0,
            full_batch: false,
        };

        {
            let paused = self.paused_until.lock().await;
            if let Some(&until) = paused.get(name) {
                if Instant::now() < until {
                    debug!("{name}: paused for backoff, skipping pass");
                    return Ok(none);
                }
            }
        }

        let phase = PassPhase::Fetching;
        let cursor = self.cursors.get(name, conversation_id).await?;
        let items = indexer
            .fetch(conversation_id, cursor, self.config.batch_size)
            .await
            .with_context(|| format!("{name}: fetch failed in phase {phase:?}"))?;
        if items.is_empty() {
            return Ok(none);
        }
        let full_batch = items.len() == self.config.batch_size;
        let last_key = items.last().map(|item| indexer.key(item)).unwrap_or(cursor);

        if self.is_shutdown() {
            // Cancelled mid-batch: leave the cursor so the items are
            // reprocessed, never skipped.
            return Ok(none);
        }

        let phase = PassPhase::Embedding;
        let texts: Vec<String> = items.iter().map(|item| indexer.render(item)).collect();
        let embeddings = match self.embedder.embed_texts(&texts).await {
            Ok(result) => result,
            Err(e) if e.is_rate_limit() => {
                let backoff = e.retry_after().unwrap_or(self.config.default_backoff);
                warn!("{name}: rate limited, pausing for {backoff:?}");
                self.metrics.backoff(name);
                let mut paused = self.paused_until.lock().await;
                paused.insert(name, Instant::now() + backoff);
                return Ok(none);
            }
            Err(e) => {
                self.metrics.items_failed(name, items.len());
                return Err(anyhow::anyhow!("embedding failed in phase {phase:?}: {e}"));
            }
        };
        if embeddings.len() != items.len() {
            // A structurally broken response would fail identically on every
            // retry, so count it and move past the batch.
            warn!(
                "{name}: provider returned {} embeddings for {} texts, skipping batch",
                embeddings.len(),
                items.len()
            );
            self.metrics.items_failed(name, items.len());
            self.cursors.set(name, conversation_id, last_key).await?;
            return Ok(PassOutcome {
                processed: 0,
                full_batch,
            });
        }

        if self.is_shutdown() {
            return Ok(none);
        }

        let phase = PassPhase::Upserting;
        let count = items.len();
        let records = items
            .into_iter()
            .zip(embeddings.embeddings)
            .map(|(item, embedding)| item.into_record(conversation_id, embedding))
            .collect();
        if let Err(e) = indexer.upsert(records).await {
            self.metrics.items_failed(name, count);
            return Err(anyhow::anyhow!("upsert failed in phase {phase:?}: {e}"));
        }

        // The batch is durable; only now is it safe to move the cursor.
        self.cursors.set(name, conversation_id, last_key).await?;
        self.metrics.items_processed(name, count);
        debug!("{name}: indexed {count} items for conversation {conversation_id}");

        Ok(PassOutcome {
            processed: count,
            full_batch,
        })
    }

    /// Drop and rebuild the targeted partitions. Destructive: record
    /// partitions are truncated and cursors reset, then a cycle rebuilds from
    /// the message log.
    pub async fn reindex(&self, target: ReindexTarget) -> Result<()> {
        let conversation_id = match target {
            ReindexTarget::Conversation(id) => Some(id),
            ReindexTarget::All => None,
        };
        info!("reindexing {:?}", target);

        for indexer in &self.indexers {
            indexer.truncate(conversation_id).await?;
            self.cursors.reset(indexer.name(), conversation_id).await?;
        }
        self.run_cycle().await?;
        Ok(())
    }

    /// Per-indexer backlog accounting, aggregated across conversations.
    pub async fn status(&self) -> Result<IndexingReport> {
        let conversations = self.source.conversations().await?;
        let mut indexers = Vec::with_capacity(self.indexers.len());

        for indexer in &self.indexers {
            let mut status = IndexerStatus::default();
            for &conversation in &conversations {
                let cursor = self.cursors.get(indexer.name(), conversation).await?;
                status.merge(indexer.status(conversation, cursor).await?);
            }
            indexers.push(IndexerReport {
                name: indexer.name().to_string(),
                status,
            });
        }

        Ok(IndexingReport {
            conversations: conversations.len(),
            indexers,
        })
    }

    /// Run cycles until no indexer makes progress; used by the CLI and tests
    /// instead of the timed loop.
    pub async fn drain(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let processed = self.run_cycle().await?;
            total += processed;
            if processed == 0 {
                return Ok(total);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::indexer::{MessageIndexer, WindowIndexer};
    use crate::retrieval::metrics::RecordingMetrics;
    use crate::storage::sqlite_store::SqliteStore;
    use crate::storage::{CursorStore, IndexKind, IndexRecord, VectorStore};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use mnemo_dialog::{ChatMessage, SegmenterConfig};
    use mnemo_embed::{EmbedError, EmbeddingResult, HashEmbedder};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    fn message(id: i64, text: &str) -> ChatMessage {
        ChatMessage {
            conversation_id: 1,
            message_id: id,
            author_id: 10,
            author_name: "alice".to_string(),
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

    fn orchestrator_over(
        store: Arc<SqliteStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: OrchestratorConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> (IndexingOrchestrator, OrchestratorHandle) {
        let indexers: Vec<Arc<dyn Indexer>> = vec![
            Arc::new(MessageIndexer::new(store.clone(), store.clone())),
            Arc::new(WindowIndexer::new(
                store.clone(),
                store.clone(),
                SegmenterConfig::default(),
            )),
        ];
        IndexingOrchestrator::with_metrics(
            indexers,
            embedder,
            store.clone(),
            store,
            config,
            metrics,
        )
    }

    /// Rate-limits the first `failures` calls, then delegates to a
    /// [`HashEmbedder`].
    struct FlakyEmbedder {
        inner: HashEmbedder,
        remaining_failures: AtomicUsize,
    }

    impl FlakyEmbedder {
        fn new(failures: usize) -> Self {
            Self {
                inner: HashEmbedder::default(),
                remaining_failures: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        async fn embed_text(&self, text: &str) -> mnemo_embed::Result<Vec<half::f16>> {
            self.inner.embed_text(text).await
        }

        async fn embed_texts(&self, texts: &[String]) -> mnemo_embed::Result<EmbeddingResult> {
            if self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EmbedError::rate_limited(Some(Duration::from_millis(20))));
            }
            self.inner.embed_texts(texts).await
        }

        fn embedding_dimension(&self) -> usize {
            self.inner.embedding_dimension()
        }

        fn provider_name(&self) -> &str {
            "flaky"
        }
    }

    /// Forwards to SqliteStore but fails every upsert.
    struct BrokenUpsertStore {
        inner: Arc<SqliteStore>,
    }

    #[async_trait]
    impl VectorStore for BrokenUpsertStore {
        async fn upsert(&self, _index: IndexKind, _records: &[IndexRecord]) -> Result<()> {
            Err(anyhow::anyhow!("disk full"))
        }

        async fn query(
            &self,
            index: IndexKind,
            conversation_id: i64,
            query: &[half::f16],
            limit: usize,
        ) -> Result<Vec<crate::storage::ScoredRecord>> {
            self.inner.query(index, conversation_id, query, limit).await
        }

        async fn delete_all(&self, index: IndexKind, conversation_id: Option<i64>) -> Result<()> {
            self.inner.delete_all(index, conversation_id).await
        }

        async fn count(&self, index: IndexKind, conversation_id: i64) -> Result<usize> {
            VectorStore::count(self.inner.as_ref(), index, conversation_id).await
        }

        async fn enclosing_windows(
            &self,
            conversation_id: i64,
            message_id: i64,
        ) -> Result<Vec<crate::storage::StoredWindow>> {
            self.inner.enclosing_windows(conversation_id, message_id).await
        }
    }

    #[tokio::test]
    async fn drain_indexes_everything_and_advances_cursors() -> Result<()> {
        let store = seeded_store(150).await?;
        let metrics = Arc::new(RecordingMetrics::new());
        let config = OrchestratorConfig::default().with_batch_size(64);
        let (orchestrator, _handle) = orchestrator_over(
            store.clone(),
            Arc::new(HashEmbedder::default()),
            config,
            metrics.clone(),
        );

        orchestrator.drain().await?;

        // 150 messages need three passes at batch 64; adaptive draining does
        // them all inside one drain call.
        assert_eq!(VectorStore::count(store.as_ref(), IndexKind::Message, 1).await?, 150);
        assert!(VectorStore::count(store.as_ref(), IndexKind::Window, 1).await? > 0);
        assert_eq!(CursorStore::get(store.as_ref(), "messages", 1).await?, 150);
        assert_eq!(metrics.snapshot("messages").processed, 150);

        // A second drain is a no-op.
        assert_eq!(orchestrator.drain().await?, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rate_limit_pauses_then_recovers_without_crashing() -> Result<()> {
        let store = seeded_store(10).await?;
        let metrics = Arc::new(RecordingMetrics::new());
        let config = OrchestratorConfig::default().with_default_backoff(Duration::from_millis(20));
        let indexers: Vec<Arc<dyn Indexer>> =
            vec![Arc::new(MessageIndexer::new(store.clone(), store.clone()))];
        let (orchestrator, _handle) = IndexingOrchestrator::with_metrics(
            indexers,
            Arc::new(FlakyEmbedder::new(1)),
            store.clone(),
            store.clone(),
            config,
            metrics.clone(),
        );

        // First cycle hits the rate limit mid-batch: a backoff event is
        // recorded, nothing is indexed, nothing crashes.
        orchestrator.run_cycle().await?;
        assert_eq!(metrics.snapshot("messages").backoffs, 1);
        assert_eq!(VectorStore::count(store.as_ref(), IndexKind::Message, 1).await?, 0);
        assert_eq!(CursorStore::get(store.as_ref(), "messages", 1).await?, 0);
        assert!(logs_contain("rate limited"));

        // After the backoff elapses the next cycle succeeds.
        tokio::time::sleep(Duration::from_millis(40)).await;
        orchestrator.run_cycle().await?;
        assert_eq!(VectorStore::count(store.as_ref(), IndexKind::Message, 1).await?, 10);
        assert_eq!(metrics.snapshot("messages").processed, 10);
        Ok(())
    }

    #[tokio::test]
    async fn failed_upsert_leaves_cursor_unadvanced() -> Result<()> {
        let store = seeded_store(5).await?;
        let broken = Arc::new(BrokenUpsertStore {
            inner: store.clone(),
        });
        let metrics = Arc::new(RecordingMetrics::new());
        let indexers: Vec<Arc<dyn Indexer>> =
            vec![Arc::new(MessageIndexer::new(store.clone(), broken))];
        let (orchestrator, _handle) = IndexingOrchestrator::with_metrics(
            indexers,
            Arc::new(HashEmbedder::default()),
            store.clone(),
            store.clone(),
            OrchestratorConfig::default(),
            metrics.clone(),
        );

        orchestrator.run_cycle().await?;

        assert_eq!(CursorStore::get(store.as_ref(), "messages", 1).await?, 0);
        assert_eq!(metrics.snapshot("messages").failed, 5);
        assert_eq!(metrics.snapshot("messages").processed, 0);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_mid_cycle_never_advances_cursors_past_done_work() -> Result<()> {
        let store = seeded_store(20).await?;
        let (orchestrator, handle) = orchestrator_over(
            store.clone(),
            Arc::new(HashEmbedder::default()),
            OrchestratorConfig::default(),
            Arc::new(RecordingMetrics::new()),
        );

        handle.shutdown();
        // Shutdown observed before any batch work: nothing indexed, nothing
        // advanced.
        orchestrator.run_cycle().await?;
        let cursor = CursorStore::get(store.as_ref(), "messages", 1).await?;
        let indexed = VectorStore::count(store.as_ref(), IndexKind::Message, 1).await?;
        assert_eq!(cursor as usize, indexed);
        Ok(())
    }

    #[tokio::test]
    async fn background_loop_drains_on_command_and_stops_on_shutdown() -> Result<()> {
        let store = seeded_store(6).await?;
        let (orchestrator, handle) = orchestrator_over(
            store.clone(),
            Arc::new(HashEmbedder::default()),
            OrchestratorConfig::default().with_poll_interval(Duration::from_secs(3600)),
            Arc::new(RecordingMetrics::new()),
        );

        let background = tokio::spawn(orchestrator.run());
        handle.drain_now()?;

        let mut attempts = 0;
        while VectorStore::count(store.as_ref(), IndexKind::Message, 1).await? < 6 {
            attempts += 1;
            assert!(attempts < 100, "timed out waiting for background indexing");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        handle.shutdown();
        background.await?;
        Ok(())
    }

    #[tokio::test]
    async fn reindex_truncates_and_rebuilds() -> Result<()> {
        let store = seeded_store(8).await?;
        let (orchestrator, _handle) = orchestrator_over(
            store.clone(),
            Arc::new(HashEmbedder::default()),
            OrchestratorConfig::default(),
            Arc::new(RecordingMetrics::new()),
        );

        orchestrator.drain().await?;
        assert_eq!(VectorStore::count(store.as_ref(), IndexKind::Message, 1).await?, 8);

        orchestrator.reindex(ReindexTarget::All).await?;
        assert_eq!(VectorStore::count(store.as_ref(), IndexKind::Message, 1).await?, 8);
        assert_eq!(CursorStore::get(store.as_ref(), "messages", 1).await?, 8);
        Ok(())
    }
}

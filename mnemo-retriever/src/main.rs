use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use mnemo_dialog::ChatMessage;
use mnemo_embed::{EmbeddingProvider, FastEmbedProvider, HashEmbedder};
use mnemo_retriever::config::MnemoConfig;
use mnemo_retriever::retrieval::hybrid::HybridRetriever;
use mnemo_retriever::retrieval::indexer::{Indexer, MessageIndexer, WindowIndexer};
use mnemo_retriever::retrieval::orchestrator::{
    IndexingOrchestrator, OrchestratorHandle, ReindexTarget,
};
use mnemo_retriever::storage::sqlite_store::SqliteStore;
use std::io::BufRead;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// A CLI tool to ingest, index, and search a group-conversation memory.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base directory containing the mnemo.db database file
    #[arg(short, long, default_value = ".")]
    base_dir: PathBuf,

    /// Optional TOML configuration file (defaults apply when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the deterministic hashing embedder instead of loading a model
    #[arg(long)]
    hash_embedder: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load messages (one ChatMessage JSON object per line) into the store
    Ingest {
        /// Path to the JSONL file
        file: PathBuf,
    },
    /// Run indexing passes until both indexes are drained
    Index {
        /// Keep running and poll for new messages until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// Search the conversation memory
    Search {
        /// Conversation to search in
        #[arg(short = 'n', long)]
        conversation: i64,
        /// The question to ground
        question: String,
        /// Alternate phrasings to fuse alongside the question
        #[arg(short, long)]
        variant: Vec<String>,
        /// Show hits as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Show per-indexer backlog status
    Status {
        /// Show status as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Drop and rebuild the indexes from the message log. Destructive.
    Reindex {
        /// Limit the rebuild to one conversation
        #[arg(short = 'n', long)]
        conversation: Option<i64>,
        /// Confirm the destructive rebuild
        #[arg(long)]
        yes: bool,
    },
    /// Correct an author's display name and queue affected records for
    /// re-indexing
    RenameAuthor {
        #[arg(short = 'n', long)]
        conversation: i64,
        #[arg(long)]
        author: i64,
        name: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn embedder_for(args: &Args, config: &MnemoConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    if args.hash_embedder {
        Ok(Arc::new(HashEmbedder::default()))
    } else {
        Ok(Arc::new(
            FastEmbedProvider::create(config.embedding.clone()).await?,
        ))
    }
}

fn orchestrator_for(
    store: &Arc<SqliteStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: &MnemoConfig,
) -> (IndexingOrchestrator, OrchestratorHandle) {
    let indexers: Vec<Arc<dyn Indexer>> = vec![
        Arc::new(MessageIndexer::new(store.clone(), store.clone())),
        Arc::new(WindowIndexer::new(
            store.clone(),
            store.clone(),
            config.segmenter.clone(),
        )),
    ];
    IndexingOrchestrator::new(
        indexers,
        embedder,
        store.clone(),
        store.clone(),
        config.orchestrator.to_config(),
    )
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => MnemoConfig::load(path)?,
        None => MnemoConfig::default(),
    };
    let store = Arc::new(SqliteStore::open(&args.base_dir).await?);

    match &args.command {
        Commands::Ingest { file } => {
            let raw = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let mut messages = Vec::new();
            for (line_no, line) in raw.as_bytes().lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let message: ChatMessage = serde_json::from_str(&line)
                    .with_context(|| format!("{}:{}", file.display(), line_no + 1))?;
                messages.push(message);
            }
            store.insert_messages(&messages).await?;
            println!("ingested {} messages", messages.len());
        }

        Commands::Index { watch } => {
            let embedder = embedder_for(&args, &config).await?;
            let (orchestrator, handle) = orchestrator_for(&store, embedder, &config);
            let processed = orchestrator.drain().await?;
            println!("indexed {processed} items");

            if *watch {
                let background = tokio::spawn(orchestrator.run());
                tokio::signal::ctrl_c().await?;
                handle.shutdown();
                let _ = background.await;
            }
        }

        Commands::Search {
            conversation,
            question,
            variant,
            json,
        } => {
            let embedder = embedder_for(&args, &config).await?;
            let mut options = config.retrieval.to_options();
            options.variants = variant.clone();
            let retriever = HybridRetriever::new(embedder, store.clone())
                .with_rrf_k(config.retrieval.rrf_k)
                .with_confidence_thresholds(config.confidence);

            let outcome = retriever.retrieve(*conversation, question, &options).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!(
                    "confidence: {} ({})",
                    outcome.confidence.level, outcome.confidence.reason
                );
                for (rank, hit) in outcome.hits.iter().enumerate() {
                    println!(
                        "{:2}. [{:.4}] ({}) {}",
                        rank + 1,
                        hit.fused_score,
                        hit.origin_index,
                        hit.display_text.replace('\n', " | ")
                    );
                }
            }
        }

        Commands::Status { json } => {
            let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::default());
            let (orchestrator, _handle) = orchestrator_for(&store, embedder, &config);
            let report = orchestrator.status().await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{} conversations", report.conversations);
                for indexer in &report.indexers {
                    println!(
                        "{:>10}: {} indexed, {} pending (of {})",
                        indexer.name,
                        indexer.status.indexed,
                        indexer.status.pending,
                        indexer.status.total
                    );
                }
            }
        }

        Commands::Reindex { conversation, yes } => {
            if !yes {
                bail!("reindex drops existing index data; re-run with --yes to confirm");
            }
            let embedder = embedder_for(&args, &config).await?;
            let (orchestrator, _handle) = orchestrator_for(&store, embedder, &config);
            let target = match conversation {
                Some(id) => ReindexTarget::Conversation(*id),
                None => ReindexTarget::All,
            };
            orchestrator.reindex(target).await?;
            println!("reindex complete");
        }

        Commands::RenameAuthor {
            conversation,
            author,
            name,
        } => {
            let updated = store.rename_author(*conversation, *author, name).await?;
            println!("updated {updated} messages; affected records re-index on the next pass");
        }
    }

    Ok(())
}

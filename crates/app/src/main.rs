use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use paper_reader_core::{
    AnalysisReport, AnswerResult, CharacterNgramEmbedder, ChatCompletionsGenerator, Coordinator,
    Embedder, EmbeddingProviderKind, HistoryRecord, HttpEmbedder, InMemoryVectorStore,
    JsonHistoryStore, PipelineConfig, Providers, QdrantStore, SourceSnippet, VectorIndex,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "paper-reader", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Chat-completions base URL (OpenAI compatible)
    #[arg(long, env = "PAPER_READER_API_BASE", default_value = "https://api.deepseek.com/v1")]
    api_base: String,

    /// API key for the generation backend
    #[arg(long, env = "PAPER_READER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Generation model name
    #[arg(long, env = "PAPER_READER_MODEL", default_value = "deepseek-chat")]
    model: String,

    /// Timeout for every remote call, in seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    /// Embedding backend
    #[arg(long, value_enum, env = "PAPER_READER_EMBEDDINGS", default_value = "local")]
    embeddings: EmbeddingBackend,

    /// Embeddings base URL when --embeddings=http
    #[arg(long, env = "PAPER_READER_EMBEDDING_API_BASE", default_value = "https://api.openai.com/v1")]
    embedding_api_base: String,

    /// API key for the embedding backend
    #[arg(long, env = "PAPER_READER_EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    /// Embedding model when --embeddings=http
    #[arg(long, default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// Embedding dimensionality
    #[arg(long, default_value = "384")]
    embedding_dimensions: usize,

    /// Qdrant base URL; vectors stay in memory when omitted
    #[arg(long, env = "PAPER_READER_QDRANT_URL")]
    qdrant_url: Option<String>,

    /// Qdrant collection
    #[arg(long, default_value = "paper_chunks")]
    qdrant_collection: String,

    /// Directory holding analysis history records
    #[arg(long, env = "PAPER_READER_HISTORY_DIR", default_value = "./history")]
    history_dir: PathBuf,

    /// Words per chunk
    #[arg(long, default_value = "500")]
    chunk_size: usize,

    /// Words shared by neighbouring chunks
    #[arg(long, default_value = "100")]
    overlap: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum EmbeddingBackend {
    Local,
    Http,
}

#[derive(Subcommand)]
enum Command {
    /// Parse, index and summarize a paper, then store it in history.
    Analyze {
        /// PDF, DOCX, TXT or Markdown file
        #[arg(long)]
        file: PathBuf,
        /// Override the format inferred from the file name
        #[arg(long)]
        format: Option<String>,
    },
    /// Ask one question about a stored analysis.
    Ask {
        /// History record id
        #[arg(long)]
        history_id: String,
        #[arg(long)]
        question: String,
        /// Number of passages to retrieve
        #[arg(long)]
        top_k: Option<usize>,
        /// Print the answer while it is generated
        #[arg(long, default_value_t = false)]
        stream: bool,
    },
    /// Interactive question loop over a new file or a stored analysis.
    Chat {
        #[arg(long, conflicts_with = "history_id", required_unless_present = "history_id")]
        file: Option<PathBuf>,
        #[arg(long)]
        history_id: Option<String>,
    },
    /// Manage stored analyses.
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    List,
    Show {
        id: String,
        /// Also print the conversation
        #[arg(long, default_value_t = false)]
        turns: bool,
    },
    Delete {
        id: String,
    },
}

fn pipeline_config(cli: &Cli) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.chunking.chunk_size = cli.chunk_size;
    config.chunking.overlap = cli.overlap;
    config.generation.api_base = cli.api_base.clone();
    config.generation.api_key = cli.api_key.clone();
    config.generation.model = cli.model.clone();
    config.generation.timeout_secs = cli.timeout_secs;
    config.embedding.provider = match cli.embeddings {
        EmbeddingBackend::Local => EmbeddingProviderKind::Local,
        EmbeddingBackend::Http => EmbeddingProviderKind::Http,
    };
    config.embedding.api_base = cli.embedding_api_base.clone();
    config.embedding.api_key = cli.embedding_api_key.clone();
    config.embedding.model = cli.embedding_model.clone();
    config.embedding.dimensions = cli.embedding_dimensions;
    config.embedding.timeout_secs = cli.timeout_secs;
    config.history_dir = cli.history_dir.clone();
    config
}

async fn build_coordinator(cli: &Cli, config: &PipelineConfig) -> anyhow::Result<Coordinator> {
    let embedder: Arc<dyn Embedder> = match config.embedding.provider {
        EmbeddingProviderKind::Local => Arc::new(CharacterNgramEmbedder {
            dimensions: config.embedding.dimensions,
        }),
        EmbeddingProviderKind::Http => Arc::new(HttpEmbedder::new(&config.embedding)?),
    };

    let vectors: Arc<dyn VectorIndex> = match &cli.qdrant_url {
        Some(url) => {
            let store = QdrantStore::new(
                url,
                &cli.qdrant_collection,
                embedder.dimensions(),
                cli.timeout_secs,
            )?;
            store
                .ensure_collection()
                .await
                .with_context(|| format!("qdrant collection {} at {url}", cli.qdrant_collection))?;
            Arc::new(store)
        }
        None => Arc::new(InMemoryVectorStore::new()),
    };

    let history = JsonHistoryStore::open(&config.history_dir)
        .await
        .with_context(|| format!("history dir {}", config.history_dir.display()))?;

    let coordinator = Coordinator::new(
        config,
        Providers {
            embedder,
            vectors,
            generator: Arc::new(ChatCompletionsGenerator::new(&config.generation)?),
            history: Arc::new(history),
        },
    )?;
    Ok(coordinator)
}

async fn analyze_file(
    coordinator: &Coordinator,
    path: &Path,
    format: Option<String>,
) -> anyhow::Result<AnalysisReport> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let declared = format.unwrap_or_else(|| {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    Ok(coordinator.analyze(bytes, &declared).await?)
}

fn print_report(report: &AnalysisReport) {
    println!("document_id: {}", report.document_id);
    println!("history_id: {}", HistoryRecord::record_id_for(&report.document_id));
    println!("keywords: {}", report.keywords);
    println!("\n# Structure\n{}", report.structure);
    println!("\n# Analysis\n{}", report.summary);
    if !report.missing_sections.is_empty() {
        let missing: Vec<&str> = report.missing_sections.iter().map(|section| section.heading()).collect();
        println!("\n(missing sections: {})", missing.join(", "));
    }
    for (stage, elapsed_ms) in &report.stage_timings_ms {
        println!("timing: {stage}={elapsed_ms}ms");
    }
}

fn print_sources(sources: &[SourceSnippet]) {
    for (rank, source) in sources.iter().enumerate() {
        println!(
            "  [{}] chunk={} score={:.4}\n      {}",
            rank + 1,
            source.position,
            source.score,
            source.text.replace('\n', " ")
        );
    }
}

fn print_answer(result: &AnswerResult) {
    println!("{}", result.answer);
    println!("\nsources ({} context tokens):", result.context_tokens);
    print_sources(&result.sources);
}

async fn stream_answer(coordinator: &Coordinator, question: &str, top_k: Option<usize>) -> anyhow::Result<()> {
    let mut answer = coordinator.ask_stream(question, top_k).await?;
    let mut stdout = std::io::stdout();
    while let Some(fragment) = answer.next().await {
        write!(stdout, "{}", fragment?)?;
        stdout.flush()?;
    }
    println!("\n\nsources ({} context tokens):", answer.context_tokens);
    print_sources(&answer.sources);
    Ok(())
}

async fn chat_loop(coordinator: &Coordinator) -> anyhow::Result<()> {
    if let Some(document) = coordinator.get_active_document().await {
        println!("chatting about: {} ({})", document.title, document.filename);
    }
    println!("suggested questions:");
    for question in coordinator.suggested_questions().await {
        println!("  - {question}");
    }
    println!("commands: /clear (forget conversation), /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                coordinator.clear_conversation().await?;
                println!("conversation cleared");
            }
            question => {
                if let Err(error) = stream_answer(coordinator, question, None).await {
                    eprintln!("error: {error}");
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = pipeline_config(&cli);
    let coordinator = build_coordinator(&cli, &config).await?;
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        history_dir = %config.history_dir.display(),
        "paper-reader boot"
    );

    match cli.command {
        Command::Analyze { file, format } => {
            let report = analyze_file(&coordinator, &file, format).await?;
            print_report(&report);
        }
        Command::Ask {
            history_id,
            question,
            top_k,
            stream,
        } => {
            coordinator.load_history(&history_id).await?;
            if stream {
                stream_answer(&coordinator, &question, top_k).await?;
            } else {
                let result = coordinator.ask(&question, top_k).await?;
                print_answer(&result);
            }
        }
        Command::Chat { file, history_id } => {
            match (file, history_id) {
                (Some(file), _) => {
                    let report = analyze_file(&coordinator, &file, None).await?;
                    print_report(&report);
                }
                (None, Some(id)) => coordinator.load_history(&id).await?,
                (None, None) => anyhow::bail!("pass --file or --history-id"),
            }
            chat_loop(&coordinator).await?;
        }
        Command::History { action } => match action {
            HistoryAction::List => {
                let summaries = coordinator.list_history().await?;
                if summaries.is_empty() {
                    println!("no stored analyses in {}", config.history_dir.display());
                }
                for summary in summaries {
                    println!(
                        "{}  {}  {} [{}] pages={} words={} turns={}",
                        summary.id,
                        summary.analyzed_at.to_rfc3339(),
                        summary.title,
                        summary.format,
                        summary.page_count,
                        summary.word_count,
                        summary.turn_count
                    );
                }
            }
            HistoryAction::Show { id, turns } => {
                let record = coordinator.get_history(&id).await?;
                println!("{} ({})", record.document.title, record.document.filename);
                print_report(&record.report);
                if turns {
                    for turn in &record.turns {
                        println!("\n[{} #{}] {}", turn.timestamp.to_rfc3339(), turn.ordinal, turn.content);
                    }
                }
            }
            HistoryAction::Delete { id } => {
                coordinator.delete_history(&id).await?;
                println!("deleted {id}");
            }
        },
    }

    Ok(())
}

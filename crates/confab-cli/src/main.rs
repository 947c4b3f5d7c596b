use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use confab_core::Mode;
use confab_memory::{ChatStore, EmbeddingBackend, OpenAiEmbeddingBackend, StubEmbedding};
use confab_schema::{load_config, ConfabConfig};
use confab_trace::EventLog;

/// Run one agent-to-agent communication and print the conclusion.
#[derive(Debug, Parser)]
#[command(name = "confab", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config/confab.yaml")]
    config: PathBuf,

    /// Master raising the task (the instructor side)
    #[arg(long)]
    sender: String,

    /// Master answering the task (the assistant side)
    #[arg(long)]
    receiver: String,

    /// The task to solve
    #[arg(long)]
    task: String,

    /// Record agent messages only in the event log, not the chat store
    #[arg(long)]
    offline: bool,
}

/// Tracing goes to a daily-rolled plain-text file next to the CSV event log.
/// The returned guard must stay alive for the process lifetime.
fn init_tracing(config: &ConfabConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender =
        tracing_appender::rolling::daily("logs", format!("{}.log", config.logging.logname));
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    guard
}

fn open_event_log(config: &ConfabConfig) -> Result<EventLog> {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let path = PathBuf::from("logs").join(format!("{}_{stamp}_llm.csv", config.logging.logname));
    EventLog::open(&path)
}

fn build_embedder(config: &ConfabConfig) -> Arc<dyn EmbeddingBackend> {
    if config.backend.provider == "stub" || config.backend.api_key.is_empty() {
        Arc::new(StubEmbedding::new(config.backend.embedding_dimensions))
    } else {
        Arc::new(OpenAiEmbeddingBackend::new(
            config.backend.api_key.clone(),
            config.backend.embedding_model.clone(),
            config.backend.embedding_dimensions,
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    let _tracing_guard = init_tracing(&config);

    let log = open_event_log(&config)?;
    tracing::info!(path = ?log.path(), "event log opened");

    let store = ChatStore::open(&config.database.path, log.clone())?;
    let backend = confab_provider::create_backend(
        &config.backend,
        config.agent.max_query_retry_times,
    )?;
    let embedder = build_embedder(&config);

    let mode = Mode::new(&config, store, backend, embedder, log)?;
    let mut communication = mode
        .build_communication(&cli.sender, &cli.receiver, &cli.task, cli.offline)
        .await?;

    let conclusion = communication.run().await?;
    println!("{conclusion}");
    Ok(())
}

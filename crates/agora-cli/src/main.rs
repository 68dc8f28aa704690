//! CLI entry point for the Agora backend: wiring of config, adapters and the index
//! lifecycle, plus a few operator commands.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use agora_core::chunks::CHUNK_INDEX_KEY;
use agora_core::config::default_config_path;
use agora_core::openai::OpenAiChat;
use agora_core::persist::artifacts_present;
use agora_core::{
    app_data_dir, embedder_from_config, load_config, read_corpus, save_config, status, Assistant,
    AssistantError, ChatError, Config, ConfigError, DocumentSource, DriveStore, EmbedError,
    EmbeddingGateway, HistoryStore, IndexLifecycle, LifecycleError, ReadyIndex, RemoteError,
    RemoteStore, Retriever, Secrets,
};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const PREVIEW_CHARS: usize = 160;

#[derive(Serialize)]
struct AskResponse<'a> {
    answer: &'a str,
    sources: &'a [String],
}

#[derive(Parser)]
#[command(name = "agora")]
#[command(about = "Agora: retrieval-augmented chat over a remote text corpus")]
struct Cli {
    /// Config file to use instead of the one in the app data directory.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show backend status and what is on disk.
    Status,
    /// Show where Agora stores its config, cache, index and history.
    DataDir,
    /// Print the effective configuration.
    Config {
        /// Write a default config file if none exists yet.
        #[arg(long)]
        init: bool,
    },
    /// Download corpus documents that are not cached yet.
    Sync,
    /// Load, fetch or rebuild the index and report which path was taken.
    Build {
        /// Skip the local and remote checks and rebuild from the corpus.
        #[arg(long)]
        rebuild: bool,
    },
    /// Upload the local index to the remote index folder.
    PushIndex,
    /// Show the passages nearest to a query.
    Query {
        text: String,
        /// Number of passages (defaults to the configured top_k).
        #[arg(short, long)]
        k: Option<usize>,
        /// Print the hits as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Ask a question within a chat session.
    Ask {
        #[arg(long, default_value = "default")]
        session: String,
        question: String,
        /// Print `{"answer": ..., "sources": [...]}` instead of plain text.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_path = cli.config.as_deref();
    match cli.command.unwrap_or(Commands::Status) {
        Commands::Status => print_status(config_path),
        Commands::DataDir => match app_data_dir() {
            Some(p) => println!("{}", p.display()),
            None => return Err(ConfigError::NoDataDir.into()),
        },
        Commands::Config { init } => {
            if init {
                let target = config_path.map(Path::to_path_buf).or_else(default_config_path);
                match target {
                    Some(path) if path.exists() => println!("Config already exists at {}", path.display()),
                    _ => {
                        let path = save_config(&Config::default(), config_path)?;
                        println!("Wrote default config to {}", path.display());
                    }
                }
            } else {
                let config = load_config(config_path)?;
                print!("{}", toml::to_string_pretty(&config).map_err(ConfigError::Serialize)?);
            }
        }
        Commands::Sync => {
            let config = load_config(config_path)?;
            let source = document_source(&config, &Secrets::from_env())?;
            let report = source.sync_documents().await?;
            println!(
                "{} downloaded, {} already cached, {} failed",
                report.downloaded.len(),
                report.cached.len(),
                report.failed.len()
            );
            for (name, reason) in &report.failed {
                println!("  failed: {name}: {reason}");
            }
        }
        Commands::Build { rebuild } => {
            let config = load_config(config_path)?;
            let secrets = Secrets::from_env();
            let mut lifecycle = lifecycle(&config, &secrets)?;
            if rebuild {
                let index = lifecycle.rebuild().await?;
                println!("Rebuilt index with {} entries in {}", index.len(), config.local_index_dir.display());
            } else {
                let ready = lifecycle.run().await?;
                let path: Vec<String> = lifecycle.visited().iter().map(|s| s.to_string()).collect();
                println!("Index ready ({}): {} entries", ready.origin, ready.index.len());
                println!("  path: {}", path.join(" -> "));
            }
        }
        Commands::PushIndex => {
            let config = load_config(config_path)?;
            let source = document_source(&config, &Secrets::from_env())?;
            source.push_index_artifacts(&config.local_index_dir).await?;
            println!("Pushed index from {}", config.local_index_dir.display());
        }
        Commands::Query { text, k, json } => {
            let config = load_config(config_path)?;
            let secrets = Secrets::from_env();
            let retriever = retriever(&config, &secrets).await?;
            let hits = retriever.retrieve_k(&text, k.unwrap_or(config.top_k)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
                return Ok(());
            }
            if hits.is_empty() {
                println!("No matches.");
            }
            for (rank, hit) in hits.iter().enumerate() {
                let position = hit.chunk.metadata.get(CHUNK_INDEX_KEY).map_or("?", String::as_str);
                println!(
                    "{}. [{:.3}] {} #{}",
                    rank + 1,
                    hit.score,
                    hit.chunk.source().unwrap_or("?"),
                    position
                );
                println!("   {}", preview(&hit.chunk.text));
            }
        }
        Commands::Ask { session, question, json } => {
            let config = load_config(config_path)?;
            let secrets = Secrets::from_env();
            let chat = OpenAiChat::new(secrets.openai_key()?, config.request_timeout())?
                .with_model(&config.chat_model)
                .with_temperature(config.chat_temperature)
                .with_max_tokens(config.chat_max_tokens);
            let assistant = Assistant::new(
                retriever(&config, &secrets).await?,
                Arc::new(chat),
                HistoryStore::new(&config.history_dir),
            );
            let answer = assistant.ask(&session, &question).await?;
            if json {
                let body = AskResponse {
                    answer: &answer.text,
                    sources: &answer.sources,
                };
                println!("{}", serde_json::to_string_pretty(&body)?);
                return Ok(());
            }
            println!("{}", answer.text);
            if !answer.sources.is_empty() {
                println!();
                println!("Sources: {}", answer.sources.join(", "));
            }
        }
    }
    Ok(())
}

fn print_status(config_path: Option<&Path>) {
    println!("Agora backend");
    println!("  core: {}", status());
    match load_config(config_path) {
        Ok(config) => {
            let cached = if config.local_cache_dir.is_dir() {
                read_corpus(&config.local_cache_dir).map(|d| d.len()).unwrap_or(0)
            } else {
                0
            };
            let index = if artifacts_present(&config.local_index_dir) { "present" } else { "absent" };
            println!("  remote folder: {}", config.remote_root_folder_id);
            println!("  cached documents: {cached} ({})", config.local_cache_dir.display());
            println!("  local index: {index} ({})", config.local_index_dir.display());
            println!("  embeddings: {:?} {} ({}d)", config.embedding_provider, config.embedding_model, config.embedding_dimensions);
        }
        Err(e) => println!("  config: {e}"),
    }
}

fn document_source(config: &Config, secrets: &Secrets) -> Result<DocumentSource, CliError> {
    let store = DriveStore::from_credentials_json(secrets.google_credentials()?, config.request_timeout())?;
    let store: Arc<dyn RemoteStore> = Arc::new(store);
    Ok(DocumentSource::new(store, config))
}

fn gateway(config: &Config, secrets: &Secrets) -> Result<EmbeddingGateway, CliError> {
    let embedder = embedder_from_config(config, secrets)?;
    Ok(EmbeddingGateway::new(embedder, config.embedding_batch_size))
}

fn lifecycle(config: &Config, secrets: &Secrets) -> Result<IndexLifecycle, CliError> {
    Ok(IndexLifecycle::new(
        config,
        document_source(config, secrets)?,
        gateway(config, secrets)?,
    ))
}

async fn retriever(config: &Config, secrets: &Secrets) -> Result<Retriever, CliError> {
    let ReadyIndex { index, origin } = lifecycle(config, secrets)?.run().await?;
    tracing::debug!(%origin, "serving index");
    Ok(Retriever::new(index, gateway(config, secrets)?, config.top_k))
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error(transparent)]
    Assistant(#[from] AssistantError),
    #[error("cannot encode output: {0}")]
    Json(#[from] serde_json::Error),
}

mod server;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use ragline_core::{
    content_type_for, ingest_folder, ChunkStore, EndpointSettings, ExtractRequest, FileSource, FsObjectStore,
    Overrides, Pipeline, PipelineConfig, ProviderRegistry, ProviderSettings, QueryRequest, SearchFilter,
    SqliteChunkStore,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ragline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// SQLite database holding documents, chunks, jobs and sessions.
    #[arg(long, env = "RAGLINE_DATABASE", default_value = "ragline.db")]
    database: PathBuf,

    /// Directory that `fileRef` values are resolved against.
    #[arg(long, env = "RAGLINE_OBJECT_ROOT")]
    object_root: Option<PathBuf>,

    #[command(flatten)]
    pipeline: PipelineArgs,

    #[command(flatten)]
    providers: ProviderArgs,
}

#[derive(Args)]
struct PipelineArgs {
    /// OCR provider used when a request names none.
    #[arg(long, env = "RAGLINE_OCR_PROVIDER")]
    ocr_provider: Option<String>,

    #[arg(long, env = "RAGLINE_EMBEDDING_PROVIDER", default_value = "ngram")]
    embedding_provider: String,

    #[arg(long, env = "RAGLINE_GENERATION_PROVIDER", default_value = "openai")]
    generation_provider: String,

    /// Tried once when the generation provider fails.
    #[arg(long, env = "RAGLINE_FALLBACK_GENERATION_PROVIDER")]
    fallback_generation_provider: Option<String>,

    #[arg(long, env = "RAGLINE_CHUNK_SIZE", default_value = "1000")]
    chunk_size: usize,

    #[arg(long, env = "RAGLINE_CHUNK_OVERLAP", default_value = "200")]
    chunk_overlap: usize,

    #[arg(long, env = "RAGLINE_SIMILARITY_THRESHOLD", default_value = "0.5")]
    similarity_threshold: f64,

    #[arg(long, env = "RAGLINE_TOP_K", default_value = "4")]
    top_k: usize,

    #[arg(long, env = "RAGLINE_EMBEDDING_BATCH_SIZE", default_value = "16")]
    embedding_batch_size: usize,

    #[arg(long, env = "RAGLINE_OCR_TIMEOUT_SECS", default_value = "180")]
    ocr_timeout_secs: u64,

    #[arg(long, env = "RAGLINE_EMBEDDING_TIMEOUT_SECS", default_value = "30")]
    embedding_timeout_secs: u64,

    #[arg(long, env = "RAGLINE_GENERATION_TIMEOUT_SECS", default_value = "60")]
    generation_timeout_secs: u64,
}

impl PipelineArgs {
    fn to_config(&self) -> PipelineConfig {
        PipelineConfig {
            default_ocr_provider: self.ocr_provider.clone(),
            default_embedding_provider: self.embedding_provider.clone(),
            default_generation_provider: self.generation_provider.clone(),
            fallback_generation_provider: self.fallback_generation_provider.clone(),
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            similarity_threshold: self.similarity_threshold,
            top_k: self.top_k,
            embedding_batch_size: self.embedding_batch_size,
            ocr_timeout_secs: self.ocr_timeout_secs,
            embedding_timeout_secs: self.embedding_timeout_secs,
            generation_timeout_secs: self.generation_timeout_secs,
            ..PipelineConfig::default()
        }
    }
}

#[derive(Args)]
struct ProviderArgs {
    #[arg(long, env = "RAGLINE_PADDLEOCR_URL")]
    paddleocr_url: Option<String>,

    #[arg(long, env = "RAGLINE_PADDLEOCR_API_KEY", hide_env_values = true)]
    paddleocr_api_key: Option<String>,

    #[arg(long, env = "RAGLINE_EASYOCR_URL")]
    easyocr_url: Option<String>,

    #[arg(long, env = "RAGLINE_EASYOCR_API_KEY", hide_env_values = true)]
    easyocr_api_key: Option<String>,

    #[arg(long, env = "RAGLINE_DOTS_OCR_URL")]
    dots_ocr_url: Option<String>,

    #[arg(long, env = "RAGLINE_DOTS_OCR_API_KEY", hide_env_values = true)]
    dots_ocr_api_key: Option<String>,

    #[arg(long, env = "RAGLINE_DEEPSEEK_OCR_URL")]
    deepseek_ocr_url: Option<String>,

    /// OpenAI-compatible base URL, e.g. `https://api.openai.com/v1`.
    #[arg(long, env = "RAGLINE_OPENAI_URL")]
    openai_url: Option<String>,

    #[arg(long, env = "RAGLINE_OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[arg(long, env = "RAGLINE_OPENAI_MODEL")]
    openai_model: Option<String>,

    #[arg(long, env = "RAGLINE_OLLAMA_URL")]
    ollama_url: Option<String>,

    #[arg(long, env = "RAGLINE_OLLAMA_MODEL")]
    ollama_model: Option<String>,

    #[arg(long, env = "RAGLINE_ANTHROPIC_URL")]
    anthropic_url: Option<String>,

    #[arg(long, env = "RAGLINE_ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_api_key: Option<String>,

    #[arg(long, env = "RAGLINE_ANTHROPIC_MODEL")]
    anthropic_model: Option<String>,

    /// Vector width of the local `ngram` embedder.
    #[arg(long, env = "RAGLINE_NGRAM_DIMENSIONS")]
    ngram_dimensions: Option<usize>,

    #[arg(long, env = "RAGLINE_OPENAI_EMBEDDING_MODEL")]
    openai_embedding_model: Option<String>,

    /// Requested OpenAI vector width, the model's native width when omitted.
    #[arg(long, env = "RAGLINE_OPENAI_EMBEDDING_DIMENSIONS")]
    openai_embedding_dimensions: Option<usize>,

    #[arg(long, env = "RAGLINE_OLLAMA_EMBEDDING_MODEL")]
    ollama_embedding_model: Option<String>,

    #[arg(long, env = "RAGLINE_OLLAMA_EMBEDDING_DIMENSIONS")]
    ollama_embedding_dimensions: Option<usize>,
}

impl ProviderArgs {
    fn to_settings(&self) -> ProviderSettings {
        let endpoint = |endpoint: &Option<String>, api_key: &Option<String>, model: &Option<String>| EndpointSettings {
            endpoint: endpoint.clone(),
            api_key: api_key.clone(),
            model: model.clone(),
        };
        ProviderSettings {
            paddleocr: endpoint(&self.paddleocr_url, &self.paddleocr_api_key, &None),
            easyocr: endpoint(&self.easyocr_url, &self.easyocr_api_key, &None),
            dots_ocr: endpoint(&self.dots_ocr_url, &self.dots_ocr_api_key, &None),
            deepseek_ocr: endpoint(&self.deepseek_ocr_url, &None, &None),
            openai: endpoint(&self.openai_url, &self.openai_api_key, &self.openai_model),
            ollama: endpoint(&self.ollama_url, &None, &self.ollama_model),
            anthropic: endpoint(&self.anthropic_url, &self.anthropic_api_key, &self.anthropic_model),
            ngram_dimensions: self.ngram_dimensions,
            openai_embedding_model: self.openai_embedding_model.clone(),
            openai_embedding_dimensions: self.openai_embedding_dimensions,
            ollama_embedding_model: self.ollama_embedding_model.clone(),
            ollama_embedding_dimensions: self.ollama_embedding_dimensions,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        #[arg(long, env = "RAGLINE_BIND", default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },
    /// Extract, chunk, embed and index a file or every supported file in a folder.
    Ingest {
        /// Single file to ingest.
        #[arg(conflicts_with = "folder", required_unless_present = "folder")]
        file: Option<PathBuf>,
        /// Folder ingested recursively.
        #[arg(long)]
        folder: Option<PathBuf>,
        /// Content type, guessed from the extension when omitted.
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Ask a question about the indexed documents.
    Query {
        question: String,
        #[arg(long)]
        document_id: Option<String>,
        /// Only search the document ingested under exactly this name.
        #[arg(long)]
        filename: Option<String>,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Print the most recent question/answer sessions.
    History {
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = cli.pipeline.to_config();
    config.validate().map_err(|error| anyhow::anyhow!(error.user_message()))?;
    let registry = ProviderRegistry::from_settings(&config, &cli.providers.to_settings())
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;
    let store = SqliteChunkStore::open(&cli.database)
        .await
        .with_context(|| format!("opening database {}", cli.database.display()))?;
    let store: Arc<dyn ChunkStore> = Arc::new(store);

    let mut pipeline = Pipeline::new(config, registry, store.clone());
    if let Some(root) = &cli.object_root {
        pipeline = pipeline.with_object_store(Arc::new(FsObjectStore::new(root)));
    }

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        database = %cli.database.display(),
        "ragline boot"
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    match cli.command {
        Command::Serve { bind } => server::run_server(Arc::new(pipeline), bind).await?,
        Command::Ingest {
            file,
            folder,
            content_type,
        } => {
            if let Some(folder) = folder {
                let report = ingest_folder(&pipeline, &folder, &Overrides::default(), &cancel)
                    .await
                    .map_err(|error| anyhow::anyhow!(error.user_message()))?;
                for skipped in &report.skipped {
                    warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
                }
                let chunks: usize = report
                    .ingested
                    .iter()
                    .map(|(_, outcome)| outcome.extraction.chunks.len())
                    .sum();
                println!(
                    "{} files ingested ({} chunks), {} skipped at {}",
                    report.ingested.len(),
                    chunks,
                    report.skipped.len(),
                    Utc::now().to_rfc3339()
                );
            } else if let Some(file) = file {
                ingest_file(&pipeline, &file, content_type, &cancel).await?;
            }
        }
        Command::Query {
            question,
            document_id,
            filename,
            top_k,
            threshold,
        } => {
            let result = pipeline
                .query(
                    QueryRequest {
                        question,
                        filter: SearchFilter {
                            document_id,
                            filename_exact: filename,
                        },
                        overrides: Overrides {
                            top_k,
                            similarity_threshold: threshold,
                            ..Overrides::default()
                        },
                    },
                    &cancel,
                )
                .await
                .map_err(|error| anyhow::anyhow!(error.user_message()))?;

            let answer = result.answer;
            println!("{}", answer.text);
            if answer.citations.is_empty() {
                println!("({})", ragline_core::explain_empty(&answer.diagnostics));
            }
            for (rank, citation) in answer.citations.iter().enumerate() {
                println!(
                    "[{}] score={:.4} source={} chunk={}",
                    rank + 1,
                    citation.score,
                    citation.source_ref,
                    citation.chunk_index
                );
            }
        }
        Command::History { limit } => {
            let sessions = store
                .recent_sessions(limit)
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            for session in sessions {
                println!("{} {}", session.created_at.to_rfc3339(), session.question);
                println!("  {}", session.answer);
            }
        }
    }

    Ok(())
}

async fn ingest_file(
    pipeline: &Pipeline,
    path: &Path,
    content_type: Option<String>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let content_type = content_type
        .or_else(|| content_type_for(path).map(str::to_string))
        .with_context(|| format!("cannot guess a content type for {}, pass --content-type", path.display()))?;
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    let outcome = pipeline
        .ingest(
            ExtractRequest {
                source: FileSource::Inline(bytes),
                content_type,
                source_ref: Some(path.to_string_lossy().to_string()),
                overrides: Overrides::default(),
            },
            cancel,
        )
        .await
        .map_err(|error| anyhow::anyhow!(error.user_message()))?;

    let extraction = &outcome.extraction;
    println!(
        "document={} job={} provider={} chunks={}",
        extraction.document_id,
        extraction.job_id,
        extraction.metadata.provider_used,
        extraction.chunks.len()
    );
    if let Some(index) = &outcome.index {
        println!(
            "embedded={} failed={} pending={:?}",
            index.chunks_embedded, index.chunks_failed, index.pending_indices
        );
    }
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod audio;
mod cache;
mod checkpoint;
mod chunk;
mod config;
mod db;
mod pipeline;
mod pool;
mod strategy;
mod transcribe;

use audio::WavDecoder;
use checkpoint::CheckpointStore;
use config::AppConfig;
use db::{KvStore, MemoryKv, SqliteKv};
use pipeline::{ProcessOptions, ProcessOutcome, Processor, ProgressEvent};
use pool::CancelToken;
use strategy::StrategyKind;
use transcribe::{HttpEngine, TranscriptionHints};

#[derive(Parser)]
#[command(
    name = "longscribe",
    version,
    about = "Transcribe audio files of any length by chunking them across parallel API calls"
)]
struct Cli {
    /// JSON config file layered over the built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Transcribe an audio file
    Process {
        /// Audio file to transcribe
        file: PathBuf,
        /// Force a strategy (direct, smart_split, streaming_parallel,
        /// full_streaming) instead of deriving one from file size
        #[arg(long, value_parser = parse_strategy)]
        strategy: Option<StrategyKind>,
        /// Language hint forwarded to the transcription API
        #[arg(long)]
        language: Option<String>,
        /// Prompt hint forwarded to the transcription API
        #[arg(long)]
        prompt: Option<String>,
        /// Transcription model, overriding the configured one
        #[arg(long)]
        model: Option<String>,
        /// Resume the newest unfinished session for this file
        #[arg(long)]
        resume: bool,
        /// Abort the whole run when one chunk exhausts its retries
        #[arg(long)]
        stop_on_error: bool,
        /// Print the full outcome as JSON instead of plain text
        #[arg(long)]
        json: bool,
    },
    /// List stored sessions
    Sessions,
    /// Delete finished sessions older than the retention window
    Prune,
}

fn parse_strategy(s: &str) -> Result<StrategyKind, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Process {
            file,
            strategy,
            language,
            prompt,
            model,
            resume,
            stop_on_error,
            json,
        } => {
            run_process(
                config,
                file,
                ProcessFlags {
                    strategy,
                    language,
                    prompt,
                    model,
                    resume,
                    stop_on_error,
                    json,
                },
            )
            .await
        }
        Command::Sessions => run_sessions().await,
        Command::Prune => run_prune(config).await,
    }
}

struct ProcessFlags {
    strategy: Option<StrategyKind>,
    language: Option<String>,
    prompt: Option<String>,
    model: Option<String>,
    resume: bool,
    stop_on_error: bool,
    json: bool,
}

async fn run_process(
    mut config: AppConfig,
    file: PathBuf,
    flags: ProcessFlags,
) -> anyhow::Result<()> {
    if let Some(model) = flags.model {
        config.engine.model = model;
    }

    let api_key = std::env::var("OPENAI_API_KEY").ok();
    if api_key.is_none() {
        warn!("OPENAI_API_KEY not set; transcription requests will be unauthenticated");
    }
    let engine =
        HttpEngine::new(&config.engine, api_key).context("Failed to build transcription client")?;

    let kv = open_kv().await?;
    let processor = Processor::new(config, Arc::new(engine), Arc::new(WavDecoder), kv).await;

    // Ctrl-C pauses the session instead of killing the process, so the
    // run can be picked up later with --resume.
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, pausing after in-flight chunks settle");
                cancel.cancel();
            }
        });
    }

    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let bar = spawn_progress_bar(progress_rx);

    let options = ProcessOptions {
        strategy_override: flags.strategy,
        hints: TranscriptionHints {
            language: flags.language,
            prompt: flags.prompt,
            temperature: None,
        },
        resume: flags.resume,
        stop_on_error: flags.stop_on_error,
        cancel,
        progress: Some(progress_tx),
    };

    let result = processor.process(&file, options).await;
    let _ = bar.await;
    let outcome = result?;

    if flags.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        report(&outcome);
    }
    Ok(())
}

fn report(outcome: &ProcessOutcome) {
    info!(
        "Session {}: {} strategy, {} result cache hits, {} misses",
        outcome.session_id,
        outcome.strategy_used,
        outcome.result_cache.hits,
        outcome.result_cache.misses
    );
    if outcome.precision_loss {
        warn!("Audio could not be decoded; segment timestamps are chunk-relative estimates");
    }
    if !outcome.failed_chunks.is_empty() {
        warn!(
            "Chunks {:?} failed; their audio is missing from the transcript",
            outcome.failed_chunks
        );
    }
    println!("{}", outcome.transcript.text);
}

async fn run_sessions() -> anyhow::Result<()> {
    let store = CheckpointStore::new(open_kv().await?);
    let sessions = store.list().await?;
    if sessions.is_empty() {
        println!("No stored sessions.");
        return Ok(());
    }
    for session in sessions {
        println!(
            "{}  {:<10}  {:>5.1}%  {} ({} bytes)  updated {}",
            session.id,
            session.status,
            session.progress.overall_percent,
            session.file_name,
            session.file_size,
            session.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

async fn run_prune(config: AppConfig) -> anyhow::Result<()> {
    let store = CheckpointStore::new(open_kv().await?);
    let days = config.checkpoint.retention_days.max(0) as u64;
    let pruned = store
        .prune_older_than(Duration::from_secs(days * 86_400))
        .await?;
    println!("Pruned {} finished sessions older than {} days.", pruned, days);
    Ok(())
}

/// SQLite when DATABASE_URL is set, otherwise a process-local store.
async fn open_kv() -> anyhow::Result<Arc<dyn KvStore>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = db::init_db(&url)
                .await
                .context("Failed to initialize database")?;
            info!("Database initialized successfully");
            Ok(Arc::new(SqliteKv::new(pool)))
        }
        Err(_) => {
            warn!("DATABASE_URL not set; sessions and caches will not survive this process");
            Ok(Arc::new(MemoryKv::new()))
        }
    }
}

/// Render progress events on stderr. The bar tracks overall percent;
/// per-chunk activity scrolls through the message slot.
fn spawn_progress_bar(
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::hidden();
        while let Some(event) = rx.recv().await {
            match event {
                ProgressEvent::StrategySelected {
                    strategy,
                    total_chunks,
                } => {
                    bar.set_style(
                        ProgressStyle::with_template("[{bar:40.cyan/blue}] {pos:>3}% {msg}")
                            .unwrap()
                            .progress_chars("=> "),
                    );
                    bar.set_length(100);
                    bar.set_draw_target(ProgressDrawTarget::stderr());
                    bar.set_message(format!("{} ({} chunks)", strategy.kind, total_chunks));
                }
                ProgressEvent::ChunkStarted { .. } => {}
                ProgressEvent::ChunkCompleted {
                    chunk_index,
                    from_cache,
                    overall_percent,
                } => {
                    bar.set_position(overall_percent as u64);
                    let suffix = if from_cache { " (cached)" } else { "" };
                    bar.set_message(format!("chunk {} done{}", chunk_index, suffix));
                }
                ProgressEvent::ChunkFailed {
                    chunk_index,
                    overall_percent,
                    ..
                } => {
                    bar.set_position(overall_percent as u64);
                    bar.set_message(format!("chunk {} failed", chunk_index));
                }
                ProgressEvent::Cancelled => {
                    bar.abandon_with_message("cancelled");
                }
                ProgressEvent::Finished {
                    overall_percent,
                    failed_chunks,
                } => {
                    bar.set_position(overall_percent as u64);
                    if failed_chunks == 0 {
                        bar.finish_with_message("done");
                    } else {
                        bar.finish_with_message(format!("done, {} chunks failed", failed_chunks));
                    }
                }
            }
        }
    })
}

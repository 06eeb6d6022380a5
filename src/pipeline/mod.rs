//! End-to-end processing of one audio file: strategy selection,
//! chunk planning, parallel transcription over the worker pool, and
//! ordered reassembly, checkpointed so an interrupted run resumes
//! where it stopped.

mod merge;
mod progress;

pub use merge::{MergedTranscript, merge_outputs};
pub use progress::ProgressEvent;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::audio::{AudioDecoder, SourceFile};
use crate::cache::{
    AUDIO_NAMESPACE, CacheStatsSnapshot, CacheStore, TRANSCRIPT_NAMESPACE, transcript_key,
};
use crate::checkpoint::{
    CheckpointError, CheckpointStore, SessionStatus, fingerprint, spawn_autosave,
};
use crate::chunk::{AudioChunk, ChunkPlan, plan_byte_chunks, plan_direct, plan_time_chunks};
use crate::config::{AppConfig, RetryConfig, WorkerConfig};
use crate::db::KvStore;
use crate::pool::{CancelToken, PoolStats, TaskFuture, TaskSpec, TaskStatus, WorkerPool};
use crate::strategy::{
    Strategy, StrategyKind, StrategyParams, read_system_memory, select_strategy,
};
use crate::transcribe::{EngineOutput, TranscriptionEngine, TranscriptionHints};
use progress::ProgressTracker;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is empty", .0.display())]
    EmptyFile(PathBuf),
    #[error("processing cancelled; session {session_id} can be resumed")]
    Cancelled { session_id: String },
    #[error("chunk {chunk_index} failed after {attempts} attempts: {error}")]
    ChunkFailed {
        chunk_index: usize,
        attempts: u32,
        error: String,
    },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Per-run knobs. The defaults process a file from scratch with no
/// progress reporting.
#[derive(Default)]
pub struct ProcessOptions {
    pub strategy_override: Option<StrategyKind>,
    pub hints: TranscriptionHints,
    /// Resume the newest matching non-terminal session instead of
    /// starting over.
    pub resume: bool,
    /// Abort the whole run when one chunk exhausts its retries.
    pub stop_on_error: bool,
    pub cancel: CancelToken,
    pub progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

/// Everything a finished run reports back.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub transcript: MergedTranscript,
    pub strategy_used: StrategyKind,
    /// Chunk indexes that exhausted their retries; their audio is
    /// missing from the transcript.
    pub failed_chunks: Vec<usize>,
    /// True when decode failed and the file was split by byte ranges,
    /// leaving chunk-relative timestamps.
    pub precision_loss: bool,
    pub session_id: String,
    pub audio_cache: CacheStatsSnapshot,
    pub result_cache: CacheStatsSnapshot,
    pub pool: PoolStats,
}

/// Shared state the per-chunk drivers run against.
struct ChunkContext {
    engine: Arc<dyn TranscriptionEngine>,
    audio_cache: Arc<CacheStore>,
    result_cache: Arc<CacheStore>,
    pool: WorkerPool<EngineOutput>,
    retry: RetryConfig,
    cancel: CancelToken,
    hints: TranscriptionHints,
}

enum ChunkOutcome {
    Completed {
        chunk_index: usize,
        output: EngineOutput,
        from_cache: bool,
    },
    Failed {
        chunk_index: usize,
        attempts: u32,
        error: String,
    },
    Cancelled {
        chunk_index: usize,
    },
}

pub struct Processor {
    config: AppConfig,
    engine: Arc<dyn TranscriptionEngine>,
    decoder: Arc<dyn AudioDecoder>,
    audio_cache: Arc<CacheStore>,
    result_cache: Arc<CacheStore>,
    checkpoints: CheckpointStore,
}

impl Processor {
    pub async fn new(
        config: AppConfig,
        engine: Arc<dyn TranscriptionEngine>,
        decoder: Arc<dyn AudioDecoder>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        let audio_cache =
            Arc::new(CacheStore::open(&config.cache, Arc::clone(&kv), AUDIO_NAMESPACE).await);
        let result_cache =
            Arc::new(CacheStore::open(&config.cache, Arc::clone(&kv), TRANSCRIPT_NAMESPACE).await);
        let checkpoints = CheckpointStore::new(kv);
        Self {
            config,
            engine,
            decoder,
            audio_cache,
            result_cache,
            checkpoints,
        }
    }

    /// Transcribe one file end to end.
    pub async fn process(
        &self,
        path: &Path,
        options: ProcessOptions,
    ) -> Result<ProcessOutcome, PipelineError> {
        let source = SourceFile::from_path(path).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if source.size_bytes == 0 {
            return Err(PipelineError::EmptyFile(path.to_path_buf()));
        }
        info!("Processing {} ({} bytes)", source.name, source.size_bytes);

        // TTL sweeps ride on job start rather than a background timer.
        self.audio_cache.sweep_expired().await;
        self.result_cache.sweep_expired().await;

        let bytes = tokio::fs::read(&source.path)
            .await
            .map_err(|source| PipelineError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let file_fingerprint = fingerprint(&source.name, source.size_bytes, &bytes);

        let (mut session, resumed) = self
            .checkpoints
            .create_or_resume(
                &file_fingerprint,
                &source.name,
                source.size_bytes,
                options.resume,
            )
            .await?;

        let strategy = select_strategy(
            source.size_bytes,
            source.mime_type.as_deref(),
            read_system_memory(),
            options.strategy_override,
            &self.config,
        );
        let plan = Arc::new(self.plan_chunks(strategy, source.size_bytes, bytes).await);

        // A resumed session whose chunk list no longer lines up with
        // the current plan cannot reuse its per-chunk progress.
        if resumed
            && session.metadata.total_chunks != 0
            && session.metadata.total_chunks != plan.chunks.len()
        {
            warn!(
                "Session {} recorded {} chunks but the current plan has {}; restarting chunk progress",
                session.id,
                session.metadata.total_chunks,
                plan.chunks.len()
            );
            session.progress.completed_chunks.clear();
            session.progress.failed_chunks.clear();
            session.results.clear();
        }
        session.metadata.total_chunks = plan.chunks.len();
        session.metadata.total_duration_secs = plan.total_duration_secs;
        session.metadata.strategy = Some(strategy.kind.to_string());
        if session.status != SessionStatus::Processing {
            session.transition_to(SessionStatus::Processing)?;
        }
        self.checkpoints.save(&session).await?;

        let mut outputs: Vec<Option<EngineOutput>> = vec![None; plan.chunks.len()];
        for result in &session.results {
            if let Some(slot) = outputs.get_mut(result.chunk_index) {
                *slot = Some(result.output.clone());
            }
        }

        let mut tracker = ProgressTracker::new(plan.chunks.len(), options.progress.clone());
        for &index in &session.progress.completed_chunks {
            tracker.prime_completed(index);
        }
        tracker.strategy_selected(strategy);
        if resumed {
            info!(
                "Resuming session {}: {} of {} chunks already complete",
                session.id,
                session.progress.completed_chunks.len(),
                plan.chunks.len()
            );
        }

        let pool: WorkerPool<EngineOutput> = WorkerPool::new(&self.pool_config(&strategy.params));
        let run_cancel = CancelToken::new();
        let watcher = {
            let user = options.cancel.clone();
            let run = run_cancel.clone();
            let pool = pool.clone();
            tokio::spawn(async move {
                user.cancelled().await;
                run.cancel();
                let _ = pool.cancel_all().await;
            })
        };
        let autosave = spawn_autosave(
            self.checkpoints.clone(),
            self.config.checkpoint.autosave_interval(),
        );

        let ctx = Arc::new(ChunkContext {
            engine: Arc::clone(&self.engine),
            audio_cache: Arc::clone(&self.audio_cache),
            result_cache: Arc::clone(&self.result_cache),
            pool: pool.clone(),
            retry: self.config.retry.clone(),
            cancel: run_cancel.clone(),
            hints: options.hints.clone(),
        });

        let pending: Vec<usize> = (0..plan.chunks.len())
            .filter(|&i| !session.is_chunk_completed(i))
            .collect();
        let mut stop_error: Option<(usize, u32, String)> = None;

        for window in submission_windows(pending, &strategy) {
            let mut drivers = JoinSet::new();
            for index in window {
                tracker.mark_running(index);
                let chunk = plan.chunks[index].clone();
                drivers.spawn(run_chunk(Arc::clone(&ctx), Arc::clone(&plan), chunk));
            }

            while let Some(joined) = drivers.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("Chunk driver aborted: {}", e);
                        continue;
                    }
                };
                match outcome {
                    ChunkOutcome::Completed {
                        chunk_index,
                        output,
                        from_cache,
                    } => {
                        if let Some(slot) = outputs.get_mut(chunk_index) {
                            *slot = Some(output.clone());
                        }
                        session.mark_chunk_completed(chunk_index, output);
                        tracker.mark_completed(chunk_index, from_cache);
                        session.set_overall_percent(tracker.overall_percent() as f64);
                        if let Err(e) = self.checkpoints.save(&session).await {
                            warn!("Checkpoint write failed: {}", e);
                        }
                        autosave.update(&session);
                    }
                    ChunkOutcome::Failed {
                        chunk_index,
                        attempts,
                        error,
                    } => {
                        warn!(
                            "Chunk {} permanently failed after {} attempts: {}",
                            chunk_index, attempts, error
                        );
                        session.mark_chunk_failed(chunk_index);
                        tracker.mark_failed(chunk_index, &error);
                        session.set_overall_percent(tracker.overall_percent() as f64);
                        autosave.update(&session);
                        if options.stop_on_error && stop_error.is_none() {
                            stop_error = Some((chunk_index, attempts, error));
                            run_cancel.cancel();
                            let _ = pool.cancel_all().await;
                        }
                    }
                    ChunkOutcome::Cancelled { .. } => {}
                }
            }

            // Window barrier: progress is on disk before more work starts.
            if let Err(e) = self.checkpoints.save(&session).await {
                warn!("Checkpoint write failed at window barrier: {}", e);
            }

            if stop_error.is_some() || options.cancel.is_cancelled() {
                break;
            }
        }

        watcher.abort();
        let pool_stats = pool.stats().await.unwrap_or_default();
        let _ = pool.terminate().await;

        if options.cancel.is_cancelled() {
            tracker.cancelled();
            session.transition_to(SessionStatus::Paused)?;
            self.checkpoints.save(&session).await?;
            autosave.shutdown().await;
            info!("Processing cancelled; session {} can be resumed", session.id);
            return Err(PipelineError::Cancelled {
                session_id: session.id.clone(),
            });
        }

        if let Some((chunk_index, attempts, error)) = stop_error {
            session.transition_to(SessionStatus::Failed)?;
            self.checkpoints.save(&session).await?;
            autosave.shutdown().await;
            return Err(PipelineError::ChunkFailed {
                chunk_index,
                attempts,
                error,
            });
        }

        // A driver that panicked leaves its chunk unresolved.
        for index in tracker.unresolved() {
            warn!("Chunk {} never reported a result, marking it failed", index);
            session.mark_chunk_failed(index);
            tracker.mark_failed(index, "chunk driver aborted");
        }

        session.set_overall_percent(tracker.overall_percent() as f64);
        session.transition_to(SessionStatus::Completed)?;
        self.checkpoints.save(&session).await?;
        autosave.shutdown().await;

        let mut failed_chunks = session.progress.failed_chunks.clone();
        failed_chunks.sort_unstable();
        tracker.finished(failed_chunks.len());

        let transcript = merge_outputs(&plan, &outputs);
        info!(
            "Completed {}: {} strategy, {} chunks, {} failed, {} transcript chars",
            source.name,
            strategy.kind,
            plan.chunks.len(),
            failed_chunks.len(),
            transcript.text.len()
        );

        Ok(ProcessOutcome {
            transcript,
            strategy_used: strategy.kind,
            failed_chunks,
            precision_loss: plan.precision_loss,
            session_id: session.id,
            audio_cache: self.audio_cache.stats(),
            result_cache: self.result_cache.stats(),
            pool: pool_stats,
        })
    }

    /// Build the chunk plan for the chosen strategy. Decode happens on
    /// a blocking thread; when it fails the file is split by byte
    /// ranges instead so processing still proceeds.
    async fn plan_chunks(&self, strategy: Strategy, file_size: u64, bytes: Vec<u8>) -> ChunkPlan {
        let raw = Arc::new(bytes);
        if !strategy.kind.is_chunked() {
            return plan_direct(raw);
        }

        let decoder = Arc::clone(&self.decoder);
        let decode_input = Arc::clone(&raw);
        let decoded = tokio::task::spawn_blocking(move || decoder.decode(&decode_input)).await;

        match decoded {
            Ok(Ok(audio)) => plan_time_chunks(
                Arc::new(audio),
                file_size,
                &strategy.params,
                &self.config.chunking,
            ),
            Ok(Err(e)) => {
                warn!(
                    "Audio decode failed ({}), splitting by byte ranges; chunk timestamps will be unreliable",
                    e
                );
                plan_byte_chunks(raw, strategy.params.chunk_size_bytes)
            }
            Err(e) => {
                warn!(
                    "Decoder panicked ({}), splitting by byte ranges; chunk timestamps will be unreliable",
                    e
                );
                plan_byte_chunks(raw, strategy.params.chunk_size_bytes)
            }
        }
    }

    fn pool_config(&self, params: &StrategyParams) -> WorkerConfig {
        let mut workers = self.config.workers.clone();
        workers.max_workers = params.worker_count.max(1);
        workers.min_workers = workers.min_workers.min(workers.max_workers);
        workers
    }
}

/// Chunk indexes grouped into submission windows. Full streaming keeps
/// a bounded window in flight so only that much audio is materialized;
/// every other strategy submits everything at once.
fn submission_windows(pending: Vec<usize>, strategy: &Strategy) -> Vec<Vec<usize>> {
    match strategy.kind {
        StrategyKind::FullStreaming => {
            let window = (strategy.params.worker_count * 2).max(1);
            pending.chunks(window).map(|w| w.to_vec()).collect()
        }
        _ if pending.is_empty() => Vec::new(),
        _ => vec![pending],
    }
}

/// Drive one chunk to a terminal outcome: serve it from the result
/// cache, or encode its audio (through the audio cache) and submit it
/// to the pool with retries and backoff until it completes, exhausts
/// its attempts, or the run is cancelled.
async fn run_chunk(ctx: Arc<ChunkContext>, plan: Arc<ChunkPlan>, chunk: AudioChunk) -> ChunkOutcome {
    let chunk_index = chunk.index;
    if ctx.cancel.is_cancelled() {
        return ChunkOutcome::Cancelled { chunk_index };
    }

    let Some(payload) = plan.payload(&chunk) else {
        return ChunkOutcome::Failed {
            chunk_index,
            attempts: 0,
            error: "chunk audio could not be materialized".to_string(),
        };
    };

    let audio_hash = payload.content_hash();
    let key = transcript_key(
        &audio_hash,
        ctx.engine.model_id(),
        ctx.hints.language.as_deref(),
    );

    if let Some(cached) = ctx.result_cache.get(&key).await {
        match serde_json::from_slice::<EngineOutput>(&cached) {
            Ok(output) => {
                debug!("Chunk {} served from result cache", chunk_index);
                return ChunkOutcome::Completed {
                    chunk_index,
                    output,
                    from_cache: true,
                };
            }
            Err(e) => warn!(
                "Discarding unreadable cached result for chunk {}: {}",
                chunk_index, e
            ),
        }
    }

    // The encoded audio is shared by every attempt; later runs over the
    // same content (a resumed session, different hints) skip the encode
    // entirely.
    let wav = match ctx.audio_cache.get(&audio_hash).await {
        Some(wav) => {
            debug!("Chunk {} audio served from cache", chunk_index);
            wav
        }
        None => {
            debug!(
                "Chunk {} cache miss ({} bytes of audio)",
                chunk_index,
                payload.size_bytes()
            );
            let wav = Arc::new(payload.to_wav_bytes());
            ctx.audio_cache.put(&audio_hash, Arc::clone(&wav)).await;
            wav
        }
    };
    drop(payload);

    let max_attempts = ctx.retry.max_retries + 1;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        if ctx.cancel.is_cancelled() {
            return ChunkOutcome::Cancelled { chunk_index };
        }

        let engine = Arc::clone(&ctx.engine);
        let hints = ctx.hints.clone();
        let wav = Arc::clone(&wav);
        let work: TaskFuture<EngineOutput> =
            Box::pin(async move { Ok(engine.transcribe(&wav, &hints).await?) });
        let spec = TaskSpec::new(format!("chunk-{}-attempt-{}", chunk_index, attempt), work);

        let Ok(handle) = ctx.pool.submit(spec) else {
            return ChunkOutcome::Cancelled { chunk_index };
        };
        let Ok(result) = handle.wait().await else {
            return ChunkOutcome::Cancelled { chunk_index };
        };

        match result.status {
            TaskStatus::Completed(output) => {
                if let Ok(bytes) = serde_json::to_vec(&output) {
                    ctx.result_cache.put(&key, Arc::new(bytes)).await;
                }
                return ChunkOutcome::Completed {
                    chunk_index,
                    output,
                    from_cache: false,
                };
            }
            TaskStatus::Cancelled => return ChunkOutcome::Cancelled { chunk_index },
            TaskStatus::Failed { error } => last_error = error,
            TaskStatus::TimedOut => {
                last_error = format!("attempt timed out after {:?}", result.execution_time)
            }
        }

        if attempt < max_attempts {
            let backoff = ctx.retry.backoff() * attempt;
            debug!(
                "Chunk {} attempt {}/{} failed ({}), retrying in {:?}",
                chunk_index, attempt, max_attempts, last_error, backoff
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = ctx.cancel.cancelled() => return ChunkOutcome::Cancelled { chunk_index },
            }
        }
    }

    ChunkOutcome::Failed {
        chunk_index,
        attempts: max_attempts,
        error: last_error,
    }
}

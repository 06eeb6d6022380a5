use tokio::sync::mpsc;

use crate::strategy::Strategy;

/// Events published to the caller's channel as a job advances. The
/// channel replaces callback registries; drop the receiver to ignore
/// progress entirely.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    StrategySelected {
        strategy: Strategy,
        total_chunks: usize,
    },
    ChunkStarted {
        chunk_index: usize,
    },
    ChunkCompleted {
        chunk_index: usize,
        from_cache: bool,
        overall_percent: u8,
    },
    ChunkFailed {
        chunk_index: usize,
        error: String,
        overall_percent: u8,
    },
    Cancelled,
    Finished {
        overall_percent: u8,
        failed_chunks: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Pending,
    Running,
    Completed,
    Failed,
}

struct ChunkProgress {
    state: ChunkState,
    percent: u8,
}

/// Per-chunk status map owned by the processing loop. Aggregate
/// progress is the mean over all chunks: completed counts 100, failed
/// 0, running its last reported percent.
pub struct ProgressTracker {
    chunks: Vec<ChunkProgress>,
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressTracker {
    pub fn new(total_chunks: usize, tx: Option<mpsc::UnboundedSender<ProgressEvent>>) -> Self {
        let chunks = (0..total_chunks)
            .map(|_| ChunkProgress {
                state: ChunkState::Pending,
                percent: 0,
            })
            .collect();
        Self { chunks, tx }
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// Record a chunk already completed in an earlier run, without
    /// emitting an event.
    pub fn prime_completed(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.state = ChunkState::Completed;
            chunk.percent = 100;
        }
    }

    pub fn strategy_selected(&self, strategy: Strategy) {
        self.emit(ProgressEvent::StrategySelected {
            strategy,
            total_chunks: self.chunks.len(),
        });
    }

    pub fn mark_running(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.state = ChunkState::Running;
        }
        self.emit(ProgressEvent::ChunkStarted { chunk_index: index });
    }

    pub fn mark_completed(&mut self, index: usize, from_cache: bool) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.state = ChunkState::Completed;
            chunk.percent = 100;
        }
        self.emit(ProgressEvent::ChunkCompleted {
            chunk_index: index,
            from_cache,
            overall_percent: self.overall_percent(),
        });
    }

    pub fn mark_failed(&mut self, index: usize, error: &str) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.state = ChunkState::Failed;
            chunk.percent = 0;
        }
        self.emit(ProgressEvent::ChunkFailed {
            chunk_index: index,
            error: error.to_string(),
            overall_percent: self.overall_percent(),
        });
    }

    pub fn cancelled(&self) {
        self.emit(ProgressEvent::Cancelled);
    }

    pub fn finished(&self, failed_chunks: usize) {
        self.emit(ProgressEvent::Finished {
            overall_percent: self.overall_percent(),
            failed_chunks,
        });
    }

    pub fn overall_percent(&self) -> u8 {
        if self.chunks.is_empty() {
            return 100;
        }
        let sum: u32 = self
            .chunks
            .iter()
            .map(|c| match c.state {
                ChunkState::Completed => 100,
                ChunkState::Failed => 0,
                ChunkState::Running | ChunkState::Pending => c.percent as u32,
            })
            .sum();
        (sum / self.chunks.len() as u32).min(100) as u8
    }

    /// Indexes still pending or running, in order. Used to catch
    /// chunks whose driver never reported back.
    pub fn unresolved(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c.state, ChunkState::Pending | ChunkState::Running))
            .map(|(i, _)| i)
            .collect()
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{CheckpointError, ProcessingSession};
use crate::db::KvStore;

pub const SESSION_NAMESPACE: &str = "sessions";

/// Session persistence over the key/value store.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn KvStore>,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn save(&self, session: &ProcessingSession) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec(session)?;
        self.store
            .put(SESSION_NAMESPACE, &session.id, &bytes)
            .await?;
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<Option<ProcessingSession>, CheckpointError> {
        match self.store.get(SESSION_NAMESPACE, id).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<(), CheckpointError> {
        self.store.delete(SESSION_NAMESPACE, id).await?;
        Ok(())
    }

    /// Resume the most recently updated non-terminal session matching
    /// `fingerprint`, or create a fresh `initialized` one. The bool is
    /// true when an existing session was resumed.
    pub async fn create_or_resume(
        &self,
        fingerprint: &str,
        file_name: &str,
        file_size: u64,
        resume: bool,
    ) -> Result<(ProcessingSession, bool), CheckpointError> {
        if resume {
            let mut candidates: Vec<ProcessingSession> = self
                .list()
                .await?
                .into_iter()
                .filter(|s| s.file_fingerprint == fingerprint && !s.status.is_terminal())
                .collect();
            candidates.sort_by_key(|s| s.updated_at);

            if let Some(session) = candidates.pop() {
                // The fingerprint spot-checks content rather than
                // hashing all of it, so same-name same-size files can
                // collide here.
                debug!("Matched session {} by sampled fingerprint", session.id);
                info!(
                    "Resuming session {} ({} of {} chunks complete)",
                    session.id,
                    session.progress.completed_chunks.len(),
                    session.metadata.total_chunks
                );
                return Ok((session, true));
            }
        }

        let session = ProcessingSession::new(
            new_session_id(fingerprint),
            fingerprint.to_string(),
            file_name.to_string(),
            file_size,
        );
        self.save(&session).await?;
        info!("Created session {} for {}", session.id, file_name);
        Ok((session, false))
    }

    /// All stored sessions, newest first. Malformed records are
    /// skipped with a warning.
    pub async fn list(&self) -> Result<Vec<ProcessingSession>, CheckpointError> {
        let rows = self.store.scan(SESSION_NAMESPACE).await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for (key, bytes) in rows {
            match serde_json::from_slice::<ProcessingSession>(&bytes) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Skipping malformed session record {}: {}", key, e),
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// Delete terminal sessions idle past the retention window.
    pub async fn prune_older_than(&self, retention: Duration) -> Result<usize, CheckpointError> {
        let Some(cutoff) = TimeDelta::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            // A retention too large to represent keeps everything.
            return Ok(0);
        };

        let mut pruned = 0;
        for session in self.list().await? {
            if session.status.is_terminal() && session.updated_at < cutoff {
                self.delete(&session.id).await?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!("Pruned {} finished sessions", pruned);
        }
        Ok(pruned)
    }
}

fn new_session_id(fingerprint: &str) -> String {
    let prefix: String = fingerprint.chars().take(12).collect();
    format!("{}_{}", prefix, Utc::now().format("%Y%m%d_%H%M%S"))
}

enum AutosaveMessage {
    Snapshot(Box<ProcessingSession>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the autosave writer task.
pub struct AutosaveHandle {
    tx: mpsc::UnboundedSender<AutosaveMessage>,
}

impl AutosaveHandle {
    /// Queue the latest session snapshot. Snapshots are coalesced;
    /// only the newest is written each interval.
    pub fn update(&self, session: &ProcessingSession) {
        let _ = self
            .tx
            .send(AutosaveMessage::Snapshot(Box::new(session.clone())));
    }

    /// Flush any pending snapshot and stop the writer.
    pub async fn shutdown(self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(AutosaveMessage::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawn the periodic session writer. A crash loses at most one
/// interval of progress.
pub fn spawn_autosave(store: CheckpointStore, interval: Duration) -> AutosaveHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_autosave(store, rx, interval));
    AutosaveHandle { tx }
}

async fn run_autosave(
    store: CheckpointStore,
    mut rx: mpsc::UnboundedReceiver<AutosaveMessage>,
    interval: Duration,
) {
    let mut pending: Option<Box<ProcessingSession>> = None;

    loop {
        match tokio::time::timeout(interval, rx.recv()).await {
            Ok(Some(AutosaveMessage::Snapshot(session))) => pending = Some(session),
            Ok(Some(AutosaveMessage::Shutdown(ack))) => {
                flush_pending(&store, &mut pending).await;
                let _ = ack.send(());
                break;
            }
            Ok(None) => {
                flush_pending(&store, &mut pending).await;
                break;
            }
            Err(_) => flush_pending(&store, &mut pending).await,
        }
    }

    debug!("Autosave writer stopped");
}

async fn flush_pending(store: &CheckpointStore, pending: &mut Option<Box<ProcessingSession>>) {
    if let Some(session) = pending.take() {
        if let Err(e) = store.save(&session).await {
            warn!("Autosave failed for session {}: {}", session.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::SessionStatus;
    use crate::db::MemoryKv;

    fn store() -> CheckpointStore {
        CheckpointStore::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn test_save_load_delete_roundtrip() {
        let store = store();
        let (session, resumed) = store.create_or_resume("fp1", "a.wav", 100, false).await.unwrap();
        assert!(!resumed);
        assert_eq!(session.status, SessionStatus::Initialized);

        let loaded = store.load(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.file_name, "a.wav");

        store.delete(&session.id).await.unwrap();
        assert!(store.load(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_finds_non_terminal_session() {
        let store = store();
        let (mut session, _) = store.create_or_resume("fp1", "a.wav", 100, true).await.unwrap();
        session.transition_to(SessionStatus::Processing).unwrap();
        session.mark_chunk_completed(
            0,
            crate::transcribe::EngineOutput {
                text: "hello".to_string(),
                segments: Vec::new(),
                language: None,
            },
        );
        store.save(&session).await.unwrap();

        let (resumed, was_resumed) = store.create_or_resume("fp1", "a.wav", 100, true).await.unwrap();
        assert!(was_resumed);
        assert_eq!(resumed.id, session.id);
        assert!(resumed.is_chunk_completed(0));
    }

    #[tokio::test]
    async fn test_terminal_session_is_not_resumed() {
        let store = store();
        let (mut session, _) = store.create_or_resume("fp1", "a.wav", 100, false).await.unwrap();
        session.transition_to(SessionStatus::Processing).unwrap();
        session.transition_to(SessionStatus::Completed).unwrap();
        store.save(&session).await.unwrap();

        let (fresh, was_resumed) = store.create_or_resume("fp1", "a.wav", 100, true).await.unwrap();
        assert!(!was_resumed);
        assert_ne!(fresh.id, session.id);
    }

    #[tokio::test]
    async fn test_resume_without_flag_creates_new() {
        let store = store();
        let (first, _) = store.create_or_resume("fp1", "a.wav", 100, false).await.unwrap();
        let (second, was_resumed) = store.create_or_resume("fp1", "a.wav", 100, false).await.unwrap();
        assert!(!was_resumed);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_prune_removes_only_old_terminal_sessions() {
        let store = store();

        let (mut old_done, _) = store.create_or_resume("fp1", "a.wav", 100, false).await.unwrap();
        old_done.transition_to(SessionStatus::Processing).unwrap();
        old_done.transition_to(SessionStatus::Completed).unwrap();
        old_done.updated_at = Utc::now() - TimeDelta::days(60);
        store.save(&old_done).await.unwrap();

        let (mut old_active, _) = store.create_or_resume("fp2", "b.wav", 100, false).await.unwrap();
        old_active.transition_to(SessionStatus::Processing).unwrap();
        old_active.updated_at = Utc::now() - TimeDelta::days(60);
        store.save(&old_active).await.unwrap();

        let (mut fresh_done, _) = store.create_or_resume("fp3", "c.wav", 100, false).await.unwrap();
        fresh_done.transition_to(SessionStatus::Processing).unwrap();
        fresh_done.transition_to(SessionStatus::Completed).unwrap();
        store.save(&fresh_done).await.unwrap();

        let pruned = store
            .prune_older_than(Duration::from_secs(30 * 86400))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.load(&old_done.id).await.unwrap().is_none());
        assert!(store.load(&old_active.id).await.unwrap().is_some());
        assert!(store.load(&fresh_done.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_session_id_prefix() {
        let store = store();
        let fingerprint = "0123456789abcdef0123456789abcdef";
        let (session, _) = store
            .create_or_resume(fingerprint, "a.wav", 100, false)
            .await
            .unwrap();
        assert!(session.id.starts_with("0123456789ab_"));
    }

    #[tokio::test]
    async fn test_autosave_flushes_on_shutdown() {
        let store = store();
        let (mut session, _) = store.create_or_resume("fp1", "a.wav", 100, false).await.unwrap();
        session.transition_to(SessionStatus::Processing).unwrap();

        // Interval far too long to fire; shutdown must flush.
        let handle = spawn_autosave(store.clone(), Duration::from_secs(3600));
        handle.update(&session);
        handle.shutdown().await;

        let loaded = store.load(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Processing);
    }

    #[tokio::test]
    async fn test_autosave_writes_each_interval() {
        let store = store();
        let (mut session, _) = store.create_or_resume("fp1", "a.wav", 100, false).await.unwrap();
        session.transition_to(SessionStatus::Processing).unwrap();

        let handle = spawn_autosave(store.clone(), Duration::from_millis(20));
        handle.update(&session);
        tokio::time::sleep(Duration::from_millis(120)).await;

        let loaded = store.load(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Processing);
        handle.shutdown().await;
    }
}

use super::state::{wait_done, Session, SessionState, SessionStatus, ANONYMOUS_OWNER};
use super::store::{SessionRecord, SessionStore};
use crate::audio::{encode_component, AudioBuffer, RetentionPolicy};
use crate::config::{SessionConfig, StorageConfig};
use crate::dispatch::ChunkResult;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session store failed: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Outcome of merging a finished session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Transcript {
    pub text: String,
    /// Seconds from session start to completion
    pub duration: f64,
    pub chunk_count: u32,
}

/// Owns every live session and the merge barrier of each
///
/// The registry is a concurrent map; each session has its own lock, so
/// unrelated sessions never contend.
pub struct SessionManager {
    sessions: DashMap<String, Arc<SessionState>>,
    store: Arc<dyn SessionStore>,
    retention: RetentionPolicy,
    temp_dir: PathBuf,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        storage: &StorageConfig,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            store,
            retention: RetentionPolicy::new(
                storage.recordings_dir(),
                storage.max_audio_files_per_user,
            ),
            temp_dir: storage.temp_dir(),
            config,
        }
    }

    fn state(&self, id: &str) -> Option<Arc<SessionState>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Create a session, or reuse the live one registered under `id`.
    ///
    /// An empty `id` gets a fresh UUID, an empty `owner` becomes
    /// [`ANONYMOUS_OWNER`]. A finished session with the same id is replaced.
    pub async fn create_session(&self, id: &str, owner: &str) -> Session {
        let id = if id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            id.to_string()
        };
        let owner = if owner.is_empty() {
            ANONYMOUS_OWNER.to_string()
        } else {
            owner.to_string()
        };

        let previous = self.state(&id);
        if let Some(existing) = &previous {
            let mut inner = existing.inner.lock().await;
            if inner.session.status != SessionStatus::Done {
                inner.touch();
                info!("Reusing live session {}", id);
                return inner.session.clone();
            }
        }

        let audio = match AudioBuffer::create(&self.temp_dir, &buffer_name(&id)) {
            Ok(buffer) => Some(buffer),
            Err(e) => {
                error!("Audio capture disabled for session {}: {:#}", id, e);
                None
            }
        };

        let session = Session::new(id.clone(), owner);
        let state = Arc::new(SessionState::new(session.clone(), audio));

        // Registration decides races between concurrent starts of one id
        let winner = match self.sessions.entry(id.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&state));
                None
            }
            Entry::Occupied(mut occupied) => {
                let replaceable = previous
                    .as_ref()
                    .is_some_and(|prev| Arc::ptr_eq(prev, occupied.get()));
                if replaceable {
                    occupied.insert(Arc::clone(&state));
                    None
                } else {
                    Some(Arc::clone(occupied.get()))
                }
            }
        };

        if let Some(winner) = winner {
            discard_audio(&state).await;
            let inner = winner.inner.lock().await;
            return inner.session.clone();
        }

        if let Err(e) = self.store.create(&SessionRecord::from(&session)).await {
            error!("Failed to persist session {}: {:#}", id, e);
        }

        info!("Session {} started for {}", session.id, session.owner);
        session
    }

    /// Snapshot of a live session
    pub async fn get_session(&self, id: &str) -> Option<Session> {
        let state = self.state(id)?;
        let inner = state.inner.lock().await;
        Some(inner.session.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Chunks submitted but unresolved
    pub async fn pending(&self, id: &str) -> Option<usize> {
        let state = self.state(id)?;
        let inner = state.inner.lock().await;
        Some(inner.pending)
    }

    /// Account for one accepted chunk and append its audio.
    ///
    /// Returns false if the session is unknown. A chunk index that is
    /// already pending is not counted twice against the barrier.
    pub async fn add_chunk(&self, id: &str, index: u32, payload: &[u8]) -> bool {
        let Some(state) = self.state(id) else {
            return false;
        };
        let mut inner = state.inner.lock().await;

        inner.session.chunk_count += 1;
        if inner.session.completed.insert(index, false) != Some(false) {
            inner.pending += 1;
        }
        inner.touch();

        if let Some(audio) = inner.audio.as_mut() {
            if let Err(e) = audio.append(payload) {
                error!("Failed to buffer audio for session {}: {:#}", id, e);
            }
        }

        true
    }

    /// Record the result of one chunk.
    ///
    /// Returns false if the session or chunk is unknown. Repeated results for
    /// an index overwrite the text without touching the barrier; results for
    /// indices that were never accepted are dropped.
    pub async fn set_result(&self, id: &str, index: u32, text: &str, err: Option<&str>) -> bool {
        let Some(state) = self.state(id) else {
            return false;
        };
        let mut inner = state.inner.lock().await;

        if !inner.session.completed.contains_key(&index) {
            warn!("Ignoring result for unknown chunk {} of session {}", index, id);
            return false;
        }

        inner.session.results.insert(index, text.to_string());
        match err {
            Some(err) => {
                debug!("Chunk {} of session {} failed: {}", index, id, err);
                inner.session.errors.insert(index, err.to_string());
            }
            None => {
                inner.session.errors.remove(&index);
            }
        }

        if inner.session.completed.insert(index, true) == Some(false) {
            inner.pending -= 1;
        }
        inner.touch();

        debug!(
            "Chunk {} of session {} resolved ({} pending)",
            index, id, inner.pending
        );

        if state.maybe_complete(&mut inner) {
            debug!("All chunks of session {} resolved", id);
        }

        true
    }

    pub async fn apply_result(&self, id: &str, result: &ChunkResult) -> bool {
        self.set_result(id, result.chunk_index, &result.text, result.error.as_deref())
            .await
    }

    /// Finish a session: wait for outstanding chunks (bounded by the merge
    /// timeout), merge results by chunk index, save the recording and
    /// persist the final record.
    ///
    /// Unknown sessions yield an empty transcript. A session that is already
    /// done returns its stored transcript.
    pub async fn wait_and_merge(&self, id: &str) -> Transcript {
        let Some(state) = self.state(id) else {
            warn!("Cannot finish unknown session {}", id);
            return Transcript::default();
        };

        let signal = state.done_signal();
        let pending = {
            let mut inner = state.inner.lock().await;
            if inner.session.status == SessionStatus::Done {
                return transcript_of(&inner.session);
            }
            inner.session.status = SessionStatus::Finishing;
            inner.touch();
            debug!(
                "Finishing session {}: {} chunks, {} results, {} pending",
                id,
                inner.session.chunk_count,
                inner.session.results.len(),
                inner.pending
            );
            inner.pending
        };

        if pending > 0 {
            let timeout = self.config.merge_timeout();
            match tokio::time::timeout(timeout, wait_done(signal)).await {
                Ok(()) => debug!("All chunks of session {} arrived", id),
                Err(_) => warn!(
                    "Session {} still waiting on chunks after {:?}, merging partial results",
                    id, timeout
                ),
            }
        }

        let mut inner = state.inner.lock().await;
        if inner.session.status == SessionStatus::Done {
            return transcript_of(&inner.session);
        }

        let final_text = inner.session.merged_text();

        let audio_path = match inner.audio.take() {
            Some(buffer) => self.save_recording(buffer, &inner.session).await,
            None => None,
        };

        let now = Utc::now();
        inner.session.final_text = final_text;
        inner.session.audio_path = audio_path;
        inner.session.completed_at = Some(now);
        inner.session.duration =
            (now - inner.session.created_at).num_milliseconds() as f64 / 1000.0;
        inner.session.status = SessionStatus::Done;

        info!(
            "Session {} merged: {} chars from {} chunks",
            id,
            inner.session.final_text.chars().count(),
            inner.session.chunk_count
        );

        let record = SessionRecord::from(&inner.session);
        let transcript = transcript_of(&inner.session);
        drop(inner);

        if let Err(e) = self.store.update(&record).await {
            error!("Failed to persist result of session {}: {:#}", id, e);
        }

        transcript
    }

    /// Turn the raw buffer into `<recordings>/<owner>/<id>.wav` and apply
    /// the per-user retention cap.
    async fn save_recording(&self, buffer: AudioBuffer, session: &Session) -> Option<String> {
        let dest = self
            .retention
            .user_dir(&session.owner)
            .join(format!("{}.wav", encode_component(&session.id)));
        let retention = self.retention.clone();
        let owner = session.owner.clone();

        let saved = tokio::task::spawn_blocking(move || {
            let path = buffer.finalize(&dest)?;
            retention.enforce(&owner);
            anyhow::Ok(path)
        })
        .await;

        match saved {
            Ok(Ok(path)) => Some(path.display().to_string()),
            Ok(Err(e)) => {
                error!("Failed to save recording of session {}: {:#}", session.id, e);
                None
            }
            Err(e) => {
                error!("Recording task for session {} panicked: {}", session.id, e);
                None
            }
        }
    }

    /// Forget a session and delete its durable record
    pub async fn delete_session(&self, id: &str) -> Result<(), SessionError> {
        if let Some((_, state)) = self.sessions.remove(id) {
            discard_audio(&state).await;
        }

        if self.store.delete(id).await? {
            info!("Session {} deleted", id);
            Ok(())
        } else {
            Err(SessionError::NotFound(id.to_string()))
        }
    }

    /// Durable record of a session, live or not
    pub async fn record(&self, id: &str) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<SessionRecord>, SessionError> {
        Ok(self.store.history(limit).await?)
    }

    /// Evict sessions that have been idle longer than the inactivity timeout.
    ///
    /// Done sessions are never evicted; finishing ones only when configured.
    /// Durable records are left untouched.
    pub async fn sweep_expired(&self) -> usize {
        let timeout = self.config.inactivity_timeout();
        let now = Instant::now();

        let candidates: Vec<(String, Arc<SessionState>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut evicted = 0;
        for (id, state) in candidates {
            let expired = {
                let inner = state.inner.lock().await;
                let evictable = match inner.session.status {
                    SessionStatus::Recording => true,
                    SessionStatus::Finishing => self.config.evict_finishing,
                    SessionStatus::Done => false,
                };
                evictable && now.saturating_duration_since(inner.last_active) > timeout
            };

            if expired
                && self
                    .sessions
                    .remove_if(&id, |_, current| Arc::ptr_eq(current, &state))
                    .is_some()
            {
                warn!("Evicted idle session {}", id);
                discard_audio(&state).await;
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!("Cleaned up {} expired sessions", evicted);
        }
        evicted
    }

    /// Run the inactivity sweep on its interval until `shutdown` fires
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval());
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Session sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        manager.sweep_expired().await;
                    }
                }
            }
        })
    }
}

fn transcript_of(session: &Session) -> Transcript {
    Transcript {
        text: session.final_text.clone(),
        duration: session.duration,
        chunk_count: session.chunk_count,
    }
}

/// Temporary buffer name, unique per session incarnation
fn buffer_name(id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", id, &suffix[..8])
}

async fn discard_audio(state: &SessionState) {
    let buffer = state.inner.lock().await.audio.take();
    if let Some(buffer) = buffer {
        if let Err(e) = buffer.discard() {
            warn!("Failed to remove audio buffer: {:#}", e);
        }
    }
}

use crate::audio::AudioBuffer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Instant;
use tokio::sync::{watch, Mutex};

/// Owner assigned when the client does not identify itself
pub const ANONYMOUS_OWNER: &str = "anonymous";

/// Lifecycle of a session: `recording -> finishing -> done`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Recording,
    Finishing,
    Done,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Recording => "recording",
            SessionStatus::Finishing => "finishing",
            SessionStatus::Done => "done",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audio-capture-to-transcript unit of work
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub owner: String,
    pub status: SessionStatus,
    /// Chunks accepted so far; only ever increases
    pub chunk_count: u32,
    /// Recognized text per chunk index
    pub results: HashMap<u32, String>,
    /// Whether each accepted chunk index has a result yet
    pub completed: HashMap<u32, bool>,
    /// Recognition errors per chunk index
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<u32, String>,
    pub final_text: String,
    /// Seconds from creation to completion
    pub duration: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub audio_path: Option<String>,
}

impl Session {
    pub fn new(id: String, owner: String) -> Self {
        Self {
            id,
            owner,
            status: SessionStatus::Recording,
            chunk_count: 0,
            results: HashMap::new(),
            completed: HashMap::new(),
            errors: BTreeMap::new(),
            final_text: String::new(),
            duration: 0.0,
            created_at: Utc::now(),
            completed_at: None,
            audio_path: None,
        }
    }

    /// Concatenate chunk texts in ascending index order. Missing indices are
    /// skipped.
    pub fn merged_text(&self) -> String {
        let mut indices: Vec<u32> = self.results.keys().copied().collect();
        indices.sort_unstable();

        indices
            .iter()
            .filter_map(|idx| self.results.get(idx))
            .map(String::as_str)
            .collect()
    }
}

/// Control wrapper around a [`Session`]
pub(crate) struct SessionState {
    pub(crate) inner: Mutex<StateInner>,
    done: watch::Sender<bool>,
}

pub(crate) struct StateInner {
    pub(crate) session: Session,
    /// Chunks submitted but not yet resolved
    pub(crate) pending: usize,
    pub(crate) last_active: Instant,
    pub(crate) audio: Option<AudioBuffer>,
    done_fired: bool,
}

impl SessionState {
    pub(crate) fn new(session: Session, audio: Option<AudioBuffer>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Mutex::new(StateInner {
                session,
                pending: 0,
                last_active: Instant::now(),
                audio,
                done_fired: false,
            }),
            done,
        }
    }

    /// Fire the completion signal if the barrier is satisfied. Fires at most
    /// once per session.
    pub(crate) fn maybe_complete(&self, inner: &mut StateInner) -> bool {
        if inner.done_fired
            || inner.pending > 0
            || inner.session.status != SessionStatus::Finishing
        {
            return false;
        }

        inner.done_fired = true;
        self.done.send_replace(true);
        true
    }

    pub(crate) fn done_signal(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }
}

/// Wait until the completion signal has fired
pub(crate) async fn wait_done(mut signal: watch::Receiver<bool>) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}

impl StateInner {
    pub(crate) fn touch(&mut self) {
        self.last_active = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_orders_by_index_and_skips_gaps() {
        let mut session = Session::new("s1".into(), ANONYMOUS_OWNER.into());
        session.results.insert(2, "c".into());
        session.results.insert(0, "a".into());
        session.results.insert(10, "k".into());
        assert_eq!(session.merged_text(), "ack");
    }

    #[test]
    fn completion_fires_once() {
        let state = SessionState::new(Session::new("s1".into(), "u1".into()), None);
        let mut inner = state.inner.try_lock().unwrap();

        // Still recording
        assert!(!state.maybe_complete(&mut inner));

        inner.session.status = SessionStatus::Finishing;
        assert!(state.maybe_complete(&mut inner));
        assert!(!state.maybe_complete(&mut inner));
        assert!(*state.done_signal().borrow());
    }
}

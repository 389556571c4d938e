//! Transcription session lifecycle
//!
//! A session accumulates audio chunks while `recording`, waits for every
//! outstanding chunk result while `finishing`, and holds the merged
//! transcript once `done`. Records of each session are persisted through a
//! [`SessionStore`].

mod manager;
mod state;
mod store;

pub use manager::{SessionError, SessionManager, Transcript};
pub use state::{Session, SessionStatus, ANONYMOUS_OWNER};
pub use store::{FileSessionStore, MemorySessionStore, SessionRecord, SessionStore};

pub mod audio;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod health;
pub mod http;
pub mod nats;
pub mod recognizer;
pub mod session;

pub use audio::{AudioBuffer, RetentionPolicy};
pub use config::{BackendKind, Config};
pub use correlator::{MemoryResultBus, ResultCorrelator, ResultSource, ResultSubscription};
pub use dispatch::{
    ChunkDispatcher, ChunkResult, ChunkTask, DispatchError, DispatcherFactory, MemoryQueue,
    QueueDispatcher, WorkerPool,
};
pub use health::{HeartbeatSource, StaticHeartbeats, WorkerHealthMonitor};
pub use http::{create_router, AppState};
pub use nats::{NatsClient, ResultMessage, TaskMessage};
pub use recognizer::{HttpRecognizer, Recognition, Recognizer};
pub use session::{
    FileSessionStore, MemorySessionStore, Session, SessionError, SessionManager, SessionRecord,
    SessionStatus, SessionStore, Transcript,
};

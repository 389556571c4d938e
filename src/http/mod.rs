//! HTTP and WebSocket surface
//!
//! - GET /ws/asr - Streaming transcription session (admission controlled)
//! - GET /api/v1/health - Gateway and worker health
//! - GET /api/v1/history - Most recent session records
//! - GET /api/v1/session/:id - Live or stored session
//! - DELETE /api/v1/session/:id - Delete a session
//! - GET /api/v1/asr/queue/status, GET /api/v1/stats - Engine pass-through

mod admission;
mod handlers;
mod messages;
mod routes;
mod state;
mod ws;

pub use messages::{ClientMessage, ServerMessage};
pub use routes::create_router;
pub use state::{AppState, ConnectionLimiter, EngineProxy};

use crate::dispatch::ChunkResult;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Task appended to the task log for external workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// "stream" for live session chunks
    #[serde(rename = "type")]
    pub kind: String,
    /// Session ID for stream tasks
    pub task_id: String,
    pub payload: TaskPayload,
    /// Unix milliseconds
    pub timestamp: i64,
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub chunk_index: u32,
    pub audio_data: String,  // Base64-encoded audio bytes
}

impl TaskMessage {
    pub fn stream_chunk(session_id: &str, chunk_index: u32, audio: &[u8], origin: &str) -> Self {
        Self {
            kind: "stream".to_string(),
            task_id: session_id.to_string(),
            payload: TaskPayload {
                chunk_index,
                audio_data: base64::engine::general_purpose::STANDARD.encode(audio),
            },
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin: origin.to_string(),
        }
    }
}

/// Result published by a worker on the session's result topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub chunk_index: u32,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub duration: f64,
    /// Empty or absent on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultMessage {
    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

impl From<ResultMessage> for ChunkResult {
    fn from(msg: ResultMessage) -> Self {
        ChunkResult {
            chunk_index: msg.chunk_index,
            text: msg.text,
            duration: msg.duration,
            error: msg.error.filter(|e| !e.is_empty()),
        }
    }
}

use crate::dispatch::ChunkResult;
use crate::session::Transcript;
use serde::{Deserialize, Serialize};

/// Message sent by a streaming client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientMessage {
    Start {
        #[serde(default)]
        session_id: String,
        #[serde(default)]
        user_id: String,
    },
    Chunk {
        #[serde(default)]
        session_id: String,
        #[serde(default)]
        chunk_index: u32,
        /// Base64-encoded audio
        #[serde(default)]
        audio_data: String,
    },
    Finish {
        #[serde(default)]
        session_id: String,
    },
}

/// Message pushed to a streaming client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// ack, chunk_result, final_result or error
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServerMessage {
    pub fn session_started(session_id: &str) -> Self {
        Self {
            kind: "ack".to_string(),
            session_id: Some(session_id.to_string()),
            status: Some("session_started".to_string()),
            ..Default::default()
        }
    }

    pub fn chunk_received(session_id: &str, chunk_index: u32) -> Self {
        Self {
            kind: "ack".to_string(),
            session_id: Some(session_id.to_string()),
            chunk_index: Some(chunk_index),
            status: Some("received".to_string()),
            ..Default::default()
        }
    }

    pub fn chunk_result(session_id: &str, result: &ChunkResult) -> Self {
        let status = if result.is_error() { "error" } else { "done" };
        Self {
            kind: "chunk_result".to_string(),
            session_id: Some(session_id.to_string()),
            chunk_index: Some(result.chunk_index),
            status: Some(status.to_string()),
            text: Some(result.text.clone()),
            duration: Some(result.duration),
            message: result.error.clone(),
            ..Default::default()
        }
    }

    pub fn final_result(session_id: &str, transcript: &Transcript) -> Self {
        Self {
            kind: "final_result".to_string(),
            session_id: Some(session_id.to_string()),
            text: Some(transcript.text.clone()),
            duration: Some(transcript.duration),
            chunk_count: Some(transcript.chunk_count),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

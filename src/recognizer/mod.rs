mod http;

pub use http::{is_webm, normalize_base_url, HttpRecognizer, SubmitResponse, TaskResult};

use anyhow::Result;

/// Text recognized for one chunk
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub duration: f64,
}

/// Speech recognition engine called by the in-process worker pool
#[async_trait::async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, audio: &[u8]) -> Result<Recognition>;
}

use super::{Recognition, Recognizer};
use crate::audio::pcm_to_wav_bytes;
use crate::config::RecognizerConfig;
use anyhow::{bail, Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// EBML magic at the start of every WebM container
const WEBM_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Response to an audio submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: String,
    pub status: String,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub estimated_wait: i64,
}

/// Task state reported while polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub processing_time: f64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Client for the recognition engine's submit-and-poll HTTP API
pub struct HttpRecognizer {
    base_url: String,
    client: reqwest::Client,
    poll_interval: Duration,
    timeout: Duration,
}

impl HttpRecognizer {
    pub fn new(config: &RecognizerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: normalize_base_url(&config.base_url),
            client,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Submit WAV audio for recognition
    pub async fn submit_audio(&self, wav: Vec<u8>, filename: &str) -> Result<SubmitResponse> {
        let part = Part::bytes(wav)
            .file_name(filename.to_string())
            .mime_str("audio/wav")
            .context("Invalid audio MIME type")?;
        let form = Form::new().part("audio", part);

        let resp = self
            .client
            .post(format!("{}/api/v1/asr/submit", self.base_url))
            .multipart(form)
            .send()
            .await
            .context("Submit request failed")?;

        if resp.status() != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            bail!("Submit failed: {}", body);
        }

        resp.json::<SubmitResponse>()
            .await
            .context("Failed to decode submit response")
    }

    /// Fetch the current state of a task
    pub async fn get_result(&self, task_id: &str) -> Result<TaskResult> {
        let resp = self
            .client
            .get(format!("{}/api/v1/asr/result/{}", self.base_url, task_id))
            .send()
            .await
            .context("Result request failed")?;

        if resp.status() == StatusCode::NOT_FOUND {
            bail!("Task not found: {}", task_id);
        }

        resp.json::<TaskResult>()
            .await
            .context("Failed to decode task result")
    }

    /// Poll until the task is done or failed, bounded by the configured timeout
    pub async fn wait_for_result(&self, task_id: &str) -> Result<TaskResult> {
        let deadline = tokio::time::Instant::now() + self.timeout;

        while tokio::time::Instant::now() < deadline {
            let result = self.get_result(task_id).await?;
            match result.status.as_str() {
                "done" => return Ok(result),
                "failed" => bail!(
                    "Recognition failed: {}",
                    result.error.unwrap_or_default()
                ),
                // queued or processing
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }

        bail!("Timed out waiting for task {}", task_id)
    }

    /// Check the engine's health endpoint
    pub async fn is_ready(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/v1/health", self.base_url))
            .send()
            .await
        {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(e) => {
                debug!("Recognizer health check failed: {}", e);
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl Recognizer for HttpRecognizer {
    async fn recognize(&self, audio: &[u8]) -> Result<Recognition> {
        let wav = if is_webm(audio) {
            convert_webm_to_wav(audio).await?
        } else {
            pcm_to_wav_bytes(audio)?
        };

        let submitted = self.submit_audio(wav, "chunk.wav").await?;
        debug!(
            "Submitted chunk as task {} (position={})",
            submitted.task_id, submitted.position
        );

        let result = self.wait_for_result(&submitted.task_id).await?;
        Ok(Recognition {
            text: result.text,
            duration: result.duration,
        })
    }
}

/// Accept addresses with or without scheme, without trailing slash
pub fn normalize_base_url(raw: &str) -> String {
    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };
    with_scheme.trim_end_matches('/').to_string()
}

pub fn is_webm(data: &[u8]) -> bool {
    data.starts_with(&WEBM_MAGIC)
}

/// Transcode WebM to 16 kHz mono 16-bit WAV through ffmpeg pipes
async fn convert_webm_to_wav(webm: &[u8]) -> Result<Vec<u8>> {
    let mut child = Command::new("ffmpeg")
        .args([
            "-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-ar", "16000", "-ac", "1",
            "-sample_fmt", "s16", "-f", "wav", "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to spawn ffmpeg")?;

    let mut stdin = child.stdin.take().context("ffmpeg stdin unavailable")?;
    let input = webm.to_vec();
    let feeder = tokio::spawn(async move {
        if let Err(e) = stdin.write_all(&input).await {
            warn!("Failed to feed ffmpeg: {}", e);
        }
    });

    let output = child
        .wait_with_output()
        .await
        .context("ffmpeg did not complete")?;
    let _ = feeder.await;

    if !output.status.success() {
        bail!(
            "ffmpeg failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(output.stdout)
}

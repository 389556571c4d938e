use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub dispatch: DispatchConfig,
    pub recognizer: RecognizerConfig,
    pub nats: NatsConfig,
    pub session: SessionConfig,
    pub health: HealthConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Concurrent WebSocket connections accepted before admission returns 503
    pub max_connections: usize,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1000,
            log_level: "info".to_string(),
        }
    }
}

/// Which processing backend receives chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process worker pool calling the recognition engine over HTTP
    Pool,
    /// JetStream task log consumed by external workers
    Queue,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub backend: BackendKind,
    pub pool_size: usize,
    /// Queue depth above which submissions are rejected as overload
    pub queue_ceiling: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Queue,
            pool_size: 200,
            queue_ceiling: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    pub base_url: String,
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            poll_interval_ms: 500,
            timeout_secs: 300,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    pub task_stream: String,
    pub task_subject: String,
    pub max_stream_len: i64,
    pub result_subject_prefix: String,
    pub result_stream: String,
    pub result_retention_secs: u64,
    pub heartbeat_bucket: String,
    pub heartbeat_ttl_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            task_stream: "ASR_TASKS".to_string(),
            task_subject: "asr.tasks".to_string(),
            max_stream_len: 10000,
            result_subject_prefix: "asr.result".to_string(),
            result_stream: "ASR_RESULTS".to_string(),
            result_retention_secs: 60,
            heartbeat_bucket: "asr-workers".to_string(),
            heartbeat_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on how long a finish waits for outstanding chunks
    pub merge_timeout_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Whether the sweep may evict sessions that are waiting on their final merge
    pub evict_finishing: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            merge_timeout_secs: 60,
            inactivity_timeout_secs: 600,
            sweep_interval_secs: 60,
            evict_finishing: false,
        }
    }
}

impl SessionConfig {
    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    pub min_workers: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 15,
            min_workers: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    /// Recordings kept per user; zero or less disables retention
    pub max_audio_files_per_user: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("storage"),
            max_audio_files_per_user: 10,
        }
    }
}

impl StorageConfig {
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.root.join("recordings")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }
}

impl Config {
    /// Load configuration from an optional file layered under `ASR_GATEWAY__*`
    /// environment variables.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("ASR_GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        let cfg: Self = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings under which backpressure could never trigger
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.backend == BackendKind::Queue
            && self.nats.max_stream_len > 0
            && self.dispatch.queue_ceiling >= self.nats.max_stream_len as u64
        {
            bail!(
                "dispatch.queue_ceiling ({}) must be below nats.max_stream_len ({})",
                self.dispatch.queue_ceiling,
                self.nats.max_stream_len
            );
        }
        Ok(())
    }
}

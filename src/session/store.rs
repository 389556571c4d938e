use super::state::{Session, SessionStatus};
use crate::audio::encode_component;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::warn;

/// Durable view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub owner: String,
    pub status: SessionStatus,
    pub final_text: String,
    pub chunk_count: u32,
    /// Seconds
    pub total_duration: f64,
    pub audio_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Session> for SessionRecord {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            owner: session.owner.clone(),
            status: session.status,
            final_text: session.final_text.clone(),
            chunk_count: session.chunk_count,
            total_duration: session.duration,
            audio_path: session.audio_path.clone(),
            created_at: session.created_at,
            completed_at: session.completed_at,
        }
    }
}

/// Persistent storage of session records
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace a record
    async fn create(&self, record: &SessionRecord) -> Result<()>;

    async fn update(&self, record: &SessionRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>>;

    /// Remove a record; false if none existed
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Most recent records first
    async fn history(&self, limit: usize) -> Result<Vec<SessionRecord>>;
}

/// One JSON document per session in a directory
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create session directory {:?}", dir))?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_component(id)))
    }

    async fn write(&self, record: &SessionRecord) -> Result<()> {
        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record)?;

        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {:?}", path))
    }
}

async fn read_record(path: &Path) -> Result<Option<SessionRecord>> {
    match tokio::fs::read(path).await {
        Ok(body) => Ok(Some(
            serde_json::from_slice(&body)
                .with_context(|| format!("Corrupt session record {:?}", path))?,
        )),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", path)),
    }
}

#[async_trait::async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self, record: &SessionRecord) -> Result<()> {
        self.write(record).await
    }

    async fn update(&self, record: &SessionRecord) -> Result<()> {
        self.write(record).await
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        read_record(&self.record_path(id)).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context("Failed to delete session record"),
        }
    }

    async fn history(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list {:?}", self.dir))?;

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("Skipping session record: {:#}", e),
            }
        }

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}

/// Records kept in memory only
#[derive(Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, record: &SessionRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &SessionRecord) -> Result<()> {
        self.create(record).await
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn history(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}

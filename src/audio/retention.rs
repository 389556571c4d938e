use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

/// Caps the number of recordings kept per user
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    recordings_dir: PathBuf,
    max_files_per_user: i64,
}

impl RetentionPolicy {
    pub fn new(recordings_dir: impl Into<PathBuf>, max_files_per_user: i64) -> Self {
        Self {
            recordings_dir: recordings_dir.into(),
            max_files_per_user,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_files_per_user > 0
    }

    /// Directory holding one user's recordings
    pub fn user_dir(&self, owner: &str) -> PathBuf {
        self.recordings_dir
            .join(super::buffer::encode_component(owner))
    }

    /// Delete the oldest recordings of `owner` beyond the cap.
    ///
    /// Returns the paths that were removed. Failures are logged and skipped.
    pub fn enforce(&self, owner: &str) -> Vec<PathBuf> {
        if !self.is_enabled() {
            return Vec::new();
        }

        let dir = self.user_dir(owner);
        let mut recordings = match list_recordings(&dir) {
            Some(recordings) => recordings,
            None => return Vec::new(),
        };

        let keep = self.max_files_per_user as usize;
        if recordings.len() <= keep {
            return Vec::new();
        }

        // Newest first
        recordings.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = Vec::new();
        for (path, _) in recordings.into_iter().skip(keep) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!("Deleted expired recording {}", path.display());
                    removed.push(path);
                }
                Err(e) => warn!("Failed to delete expired recording {}: {}", path.display(), e),
            }
        }

        removed
    }
}

fn list_recordings(dir: &Path) -> Option<Vec<(PathBuf, SystemTime)>> {
    let entries = fs::read_dir(dir).ok()?;

    let recordings = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "wav"))
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            Some((entry.path(), meta.modified().ok()?))
        })
        .collect();

    Some(recordings)
}

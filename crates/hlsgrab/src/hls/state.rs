//! Per-job progress file.
//!
//! The state file is a whole-file JSON snapshot keyed by segment index. Every
//! update rewrites it to a temporary path and renames it over the previous
//! snapshot while holding the manager's lock, so a reader only ever observes a
//! complete snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::STATE_FILE_NAME;
use crate::error::JobError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    #[default]
    Pending,
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentState {
    pub status: SegmentStatus,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// On-disk shape of the state file.
pub type JobState = BTreeMap<usize, SegmentState>;

pub struct StateManager {
    path: PathBuf,
    temp_path: PathBuf,
    segments: Mutex<JobState>,
}

impl StateManager {
    /// Open the state file in `dir`, or start empty if there is none.
    ///
    /// Entries from an interrupted run are normalised: a `completed` entry
    /// whose file is gone or empty is downloaded again, and `downloading` or
    /// `failed` entries get a fresh retry budget.
    pub async fn load(dir: &Path) -> Result<Self, JobError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(STATE_FILE_NAME);
        let temp_path = path.with_extension("tmp");

        let mut segments = match tokio::fs::read(&path).await {
            Ok(content) => match serde_json::from_slice::<JobState>(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable state file");
                    JobState::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => JobState::new(),
            Err(e) => return Err(JobError::state(path.display().to_string(), e)),
        };

        let mut demoted = 0usize;
        for state in segments.values_mut() {
            match state.status {
                SegmentStatus::Completed => {
                    if !Self::file_present(state.path.as_deref()).await {
                        *state = SegmentState::default();
                        demoted += 1;
                    }
                }
                SegmentStatus::Downloading | SegmentStatus::Failed => {
                    *state = SegmentState::default();
                }
                SegmentStatus::Pending => {}
            }
        }

        let completed = segments
            .values()
            .filter(|s| s.status == SegmentStatus::Completed)
            .count();
        if !segments.is_empty() {
            info!(
                path = %path.display(),
                completed,
                demoted,
                total = segments.len(),
                "Loaded job state"
            );
        }

        Ok(Self {
            path,
            temp_path,
            segments: Mutex::new(segments),
        })
    }

    async fn file_present(path: Option<&Path>) -> bool {
        match path {
            Some(path) => tokio::fs::metadata(path)
                .await
                .map(|m| m.is_file() && m.len() > 0)
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, index: usize) -> Option<SegmentState> {
        self.segments.lock().await.get(&index).cloned()
    }

    pub async fn get_status(&self, index: usize) -> SegmentStatus {
        self.segments
            .lock()
            .await
            .get(&index)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// A previous run left at least one completed segment behind.
    pub async fn is_resumable(&self) -> bool {
        self.segments
            .lock()
            .await
            .values()
            .any(|s| s.status == SegmentStatus::Completed)
    }

    pub async fn snapshot(&self) -> JobState {
        self.segments.lock().await.clone()
    }

    pub async fn set_status(
        &self,
        index: usize,
        status: SegmentStatus,
        error: Option<String>,
    ) -> Result<(), JobError> {
        self.update(index, |state| {
            state.status = status;
            state.error = error;
        })
        .await
    }

    pub async fn set_completed(&self, index: usize, path: PathBuf) -> Result<(), JobError> {
        self.update(index, |state| {
            state.status = SegmentStatus::Completed;
            state.error = None;
            state.path = Some(path);
        })
        .await
    }

    /// Count one more attempt and remember why the last one failed.
    pub async fn record_retry(&self, index: usize, error: String) -> Result<(), JobError> {
        self.update(index, |state| {
            state.retries += 1;
            state.error = Some(error);
        })
        .await
    }

    /// Register every index of the playlist so the snapshot is complete from the start.
    pub async fn ensure_segments(&self, indices: impl IntoIterator<Item = usize>) -> Result<(), JobError> {
        let mut segments = self.segments.lock().await;
        for index in indices {
            segments.entry(index).or_default();
        }
        self.persist(&segments).await
    }

    async fn update(
        &self,
        index: usize,
        apply: impl FnOnce(&mut SegmentState),
    ) -> Result<(), JobError> {
        let mut segments = self.segments.lock().await;
        apply(segments.entry(index).or_default());
        self.persist(&segments).await
    }

    async fn persist(&self, segments: &JobState) -> Result<(), JobError> {
        let json = serde_json::to_vec_pretty(segments)
            .map_err(|e| JobError::state(self.path.display().to_string(), e))?;

        // Write atomically using a temp file
        tokio::fs::write(&self.temp_path, &json)
            .await
            .map_err(|e| JobError::state(self.temp_path.display().to_string(), e))?;
        tokio::fs::rename(&self.temp_path, &self.path)
            .await
            .map_err(|e| JobError::state(self.path.display().to_string(), e))?;
        Ok(())
    }

    /// Delete the state file once the job no longer needs it.
    pub async fn remove(&self) -> Result<(), JobError> {
        let _guard = self.segments.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Removed state file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JobError::state(self.path.display().to_string(), e)),
        }
    }
}

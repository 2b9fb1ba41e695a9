//! Batch report: per-job results plus aggregate counts, written as JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BatchConfig;
use crate::error::JobError;
use crate::hls::job::JobOutcome;
use crate::manifest::ManifestEntry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Outcome of one batch entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoJobResult {
    /// Position in the batch manifest.
    pub index: usize,
    pub url: String,
    pub domain: String,
    #[serde(default)]
    pub page_title: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_file: Option<PathBuf>,
    #[serde(default)]
    pub missing_segments: Vec<usize>,
    #[serde(default)]
    pub segments_total: Option<usize>,
    #[serde(default)]
    pub start_time: Option<DateTime<Local>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Local>>,
    /// Seconds from start to end.
    #[serde(default)]
    pub duration: Option<f64>,
}

impl VideoJobResult {
    pub fn pending(index: usize, entry: &ManifestEntry) -> Self {
        Self {
            index,
            url: entry.url.clone(),
            domain: entry.domain(),
            page_title: entry.page_title.clone(),
            status: JobStatus::Pending,
            error: None,
            output_dir: None,
            output_file: None,
            missing_segments: Vec::new(),
            segments_total: None,
            start_time: None,
            end_time: None,
            duration: None,
        }
    }

    pub fn start(&mut self, output_dir: PathBuf) {
        self.status = JobStatus::Running;
        self.output_dir = Some(output_dir);
        self.start_time = Some(Local::now());
    }

    /// Terminal transition. End time and duration are recorded here.
    pub fn finish(&mut self, result: Result<JobOutcome, JobError>) {
        let end = Local::now();
        self.end_time = Some(end);
        self.duration = self
            .start_time
            .map(|start| (end - start).to_std().unwrap_or(Duration::ZERO).as_secs_f64());

        match result {
            Ok(outcome) => {
                self.status = JobStatus::Completed;
                self.output_dir = Some(outcome.work_dir);
                self.output_file = Some(outcome.output_file);
                self.missing_segments = outcome.missing_segments;
                self.segments_total = Some(outcome.segments_total);
            }
            Err(e) => {
                self.status = JobStatus::Failed;
                self.error = Some(e.to_string());
            }
        }
    }
}

/// Settings echoed into the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSettings {
    pub max_concurrent_videos: usize,
    pub max_workers_per_video: usize,
    pub max_retries: u32,
    pub retry_delay: f64,
    pub keep_segments: bool,
    pub abort_on_error: bool,
    pub output_dir: PathBuf,
}

impl From<&BatchConfig> for ReportSettings {
    fn from(config: &BatchConfig) -> Self {
        Self {
            max_concurrent_videos: config.job_concurrency,
            max_workers_per_video: config.job.segment_concurrency,
            max_retries: config.job.max_retries,
            retry_delay: config.job.retry_delay.as_secs_f64(),
            keep_segments: config.job.keep_segments,
            abort_on_error: config.job.abort_on_error,
            output_dir: config.output_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub timestamp: DateTime<Local>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Wall-clock seconds of the whole batch.
    pub total_duration: f64,
    /// `total_duration` divided by the number of succeeded jobs (at least 1).
    pub average_duration: f64,
    pub settings: ReportSettings,
    /// In batch manifest order.
    pub results: Vec<VideoJobResult>,
}

impl BatchReport {
    pub fn new(results: Vec<VideoJobResult>, settings: ReportSettings, elapsed: Duration) -> Self {
        let succeeded = results
            .iter()
            .filter(|r| r.status == JobStatus::Completed)
            .count();
        let failed = results
            .iter()
            .filter(|r| r.status == JobStatus::Failed)
            .count();
        let total_duration = elapsed.as_secs_f64();
        Self {
            timestamp: Local::now(),
            total: results.len(),
            succeeded,
            failed,
            total_duration,
            average_duration: total_duration / succeeded.max(1) as f64,
            settings,
            results,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.succeeded == self.total
    }

    pub fn file_name(&self) -> String {
        format!(
            "download_report_{}.json",
            self.timestamp.format("%Y%m%d_%H%M%S")
        )
    }

    /// Write the report into `dir` and return its path.
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf, JobError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(self.file_name());
        let json = serde_json::to_vec_pretty(self).map_err(|e| JobError::Internal {
            reason: format!("failed to serialize report: {e}"),
        })?;
        tokio::fs::write(&path, json).await?;
        info!(path = %path.display(), "Download report saved");
        Ok(path)
    }

    pub fn log_summary(&self) {
        info!(
            total = self.total,
            succeeded = self.succeeded,
            failed = self.failed,
            total_duration_secs = self.total_duration,
            "Batch finished"
        );
        for result in &self.results {
            match result.status {
                JobStatus::Completed => info!(
                    index = result.index,
                    domain = %result.domain,
                    output = ?result.output_file,
                    missing = result.missing_segments.len(),
                    "Completed"
                ),
                _ => warn!(
                    index = result.index,
                    domain = %result.domain,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Failed"
                ),
            }
        }
    }
}

//! One download job: manifest in, merged file out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use url::Url;

use crate::config::JobConfig;
use crate::error::JobError;
use crate::headers::HeaderProfile;
use crate::hls::decryption::KeyResolver;
use crate::hls::fetcher::SegmentPool;
use crate::hls::merger::Reassembler;
use crate::hls::playlist::PlaylistLoader;
use crate::hls::state::StateManager;
use crate::manifest::ManifestEntry;

/// Hex digest of the manifest URL. Stable across runs, so a re-run of the
/// same URL finds the previous working directory.
pub fn url_digest(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Working directory name of a job: the first 32 hex chars of [`url_digest`].
pub fn job_dir_name(url: &str) -> String {
    url_digest(url)[..32].to_string()
}

/// `{host}_{YYYYmmdd_HHMMSS}_{hash8}.mp4`, dots in the host replaced by `_`.
pub fn output_file_name(url: &Url, now: DateTime<Local>) -> String {
    let host = url.host_str().unwrap_or("unknown").replace('.', "_");
    let digest = url_digest(url.as_str());
    format!("{host}_{}_{}.mp4", now.format("%Y%m%d_%H%M%S"), &digest[..8])
}

/// Result of a job that produced an output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub work_dir: PathBuf,
    pub output_file: PathBuf,
    /// Indices left out of the output, ascending. Empty for a complete download.
    pub missing_segments: Vec<usize>,
    pub segments_total: usize,
    pub fetched: usize,
    pub skipped: usize,
}

pub struct HlsJob {
    entry: ManifestEntry,
    client: Client,
    config: Arc<JobConfig>,
    output_dir: PathBuf,
    token: CancellationToken,
}

impl HlsJob {
    pub fn new(
        entry: ManifestEntry,
        client: Client,
        config: Arc<JobConfig>,
        output_dir: impl Into<PathBuf>,
        token: CancellationToken,
    ) -> Self {
        Self {
            entry,
            client,
            config,
            output_dir: output_dir.into(),
            token,
        }
    }

    pub fn work_dir(&self) -> PathBuf {
        work_dir_for(&self.output_dir, &self.entry.url)
    }

    fn parse_url(&self) -> Result<Url, JobError> {
        let url = Url::parse(self.entry.url.trim())
            .map_err(|e| JobError::invalid_url(&self.entry.url, e))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(JobError::invalid_url(
                &self.entry.url,
                format!("unsupported scheme `{other}`"),
            )),
        }
    }

    #[instrument(skip(self), fields(url = %self.entry.url))]
    pub async fn run(&self) -> Result<JobOutcome, JobError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(JobError::Cancelled),
            result = self.run_pipeline() => result,
        }
    }

    async fn run_pipeline(&self) -> Result<JobOutcome, JobError> {
        let url = self.parse_url()?;
        let config = &self.config;
        let profile = Arc::new(HeaderProfile::resolve(Some(&self.entry), &config.headers));
        let work_dir = self.work_dir();
        tokio::fs::create_dir_all(&work_dir).await?;

        let playlist = PlaylistLoader::new(
            self.client.clone(),
            profile.clone(),
            config.http.manifest_timeout,
        )
        .load(&url)
        .await?;
        let segments_total = playlist.segments.len();

        let keys = KeyResolver::new(
            self.client.clone(),
            profile.clone(),
            config.http.manifest_timeout,
            self.token.clone(),
        )
        .resolve_all(&playlist)
        .await?;

        // Resolve the merge tool before downloading anything.
        let reassembler = Reassembler::from_tool(&config.merge_tool)?;

        let state = Arc::new(StateManager::load(&work_dir).await?);
        if state.is_resumable().await {
            info!(work_dir = %work_dir.display(), "Resuming previous download");
        }
        state
            .ensure_segments(playlist.segments.iter().map(|s| s.index))
            .await?;

        let pool = Arc::new(SegmentPool::new(
            self.client.clone(),
            profile,
            Arc::new(keys),
            state.clone(),
            work_dir.clone(),
            config.clone(),
            self.token.clone(),
        ));
        let outcome = pool.run(&playlist.segments).await?;

        if config.abort_on_error && !outcome.missing.is_empty() {
            return Err(JobError::SegmentsFailed {
                failed: outcome.missing.len(),
                total: segments_total,
            });
        }
        if outcome.completed.is_empty() {
            return Err(JobError::NoSegments {
                total: segments_total,
            });
        }
        if !outcome.missing.is_empty() {
            warn!(
                missing = ?outcome.missing,
                "Merging without {} of {} segments",
                outcome.missing.len(),
                segments_total
            );
        }

        let output_file = work_dir.join(output_file_name(&url, Local::now()));
        reassembler
            .merge(&work_dir, &outcome.completed, &output_file)
            .await?;

        if !config.keep_segments {
            if outcome.missing.is_empty() {
                reassembler.cleanup(&work_dir, &outcome.completed).await;
                state.remove().await?;
            } else {
                info!("Keeping segments and state file for a later resume");
            }
        }

        Ok(JobOutcome {
            work_dir,
            output_file,
            missing_segments: outcome.missing,
            segments_total,
            fetched: outcome.fetched,
            skipped: outcome.skipped,
        })
    }
}

/// Output directory of a job for `url` under `output_dir`.
pub fn work_dir_for(output_dir: &Path, url: &str) -> PathBuf {
    output_dir.join(job_dir_name(url))
}

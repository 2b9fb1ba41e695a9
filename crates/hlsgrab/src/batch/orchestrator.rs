//! Runs every entry of a batch manifest as an independent job under a
//! bounded pool and collects the results in input order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use reqwest::Client;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::build_client;
use crate::config::{BatchConfig, JobConfig};
use crate::error::JobError;
use crate::hls::job::HlsJob;
use crate::manifest::BatchManifest;

use super::report::{BatchReport, JobStatus, ReportSettings, VideoJobResult};

pub struct BatchOrchestrator {
    config: BatchConfig,
    job_config: Arc<JobConfig>,
    client: Client,
    token: CancellationToken,
}

impl BatchOrchestrator {
    pub fn new(config: BatchConfig) -> Result<Self, JobError> {
        let client = build_client(&config.job.http)?;
        Ok(Self::with_client(config, client))
    }

    /// Share an existing client across the batch.
    pub fn with_client(config: BatchConfig, client: Client) -> Self {
        Self {
            job_config: Arc::new(config.job.clone()),
            config,
            client,
            token: CancellationToken::new(),
        }
    }

    /// Cancelling `token` stops every job of the batch cooperatively.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Download a single URL with the default header profile.
    pub async fn run_single(&self, url: &str) -> BatchReport {
        self.run(BatchManifest::single(url)).await
    }

    /// Run every entry to a terminal state and assemble the report.
    ///
    /// Job failures never escape this call; they end up as failed results.
    #[instrument(skip_all, fields(entries = manifest.links.len()))]
    pub async fn run(&self, manifest: BatchManifest) -> BatchReport {
        let started = Instant::now();
        let total = manifest.links.len();
        let width = self.config.job_concurrency.max(1);
        info!(
            total,
            concurrency = width,
            workers_per_video = self.job_config.segment_concurrency,
            output_dir = %self.config.output_dir.display(),
            "Starting batch download"
        );

        let mut results: Vec<VideoJobResult> = manifest
            .links
            .iter()
            .enumerate()
            .map(|(index, entry)| VideoJobResult::pending(index, entry))
            .collect();

        let semaphore = Arc::new(Semaphore::new(width));
        // Entries with the same URL share a working directory and run one
        // after another.
        let mut dir_locks: HashMap<PathBuf, Arc<Mutex<()>>> = HashMap::new();
        let mut tasks = JoinSet::new();
        for (index, entry) in manifest.links.into_iter().enumerate() {
            let result = results[index].clone();
            let semaphore = semaphore.clone();
            let job = HlsJob::new(
                entry,
                self.client.clone(),
                self.job_config.clone(),
                self.config.output_dir.clone(),
                self.token.clone(),
            );
            let work_dir = job.work_dir();
            if dir_locks.contains_key(&work_dir) {
                debug!(index, url = %result.url, "Duplicate entry, queued behind the earlier one");
            }
            let dir_lock = dir_locks.entry(work_dir).or_default().clone();
            let token = self.token.clone();
            tasks.spawn(run_job(job, result, total, dir_lock, semaphore, token));
        }

        let mut finished = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    finished += 1;
                    info!(
                        finished,
                        total,
                        index = result.index,
                        status = ?result.status,
                        "Job finished"
                    );
                    let slot = result.index;
                    results[slot] = result;
                }
                Err(join_err) => error!(error = ?join_err, "Job task panicked"),
            }
        }

        // A job whose task panicked never reported back.
        for result in results.iter_mut().filter(|r| !r.status.is_terminal()) {
            result.finish(Err(JobError::Internal {
                reason: "job task ended without a result".to_string(),
            }));
        }

        let report = BatchReport::new(
            results,
            ReportSettings::from(&self.config),
            started.elapsed(),
        );
        report.log_summary();
        report
    }
}

async fn run_job(
    job: HlsJob,
    mut result: VideoJobResult,
    total: usize,
    dir_lock: Arc<Mutex<()>>,
    semaphore: Arc<Semaphore>,
    token: CancellationToken,
) -> VideoJobResult {
    // A duplicate waiting here holds no pool permit.
    let _dir_guard = tokio::select! {
        biased;
        _ = token.cancelled() => {
            result.finish(Err(JobError::Cancelled));
            return result;
        }
        guard = dir_lock.lock_owned() => guard,
    };

    let _permit = tokio::select! {
        biased;
        _ = token.cancelled() => {
            result.finish(Err(JobError::Cancelled));
            return result;
        }
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(e) => {
                result.finish(Err(JobError::Internal {
                    reason: format!("job semaphore closed: {e}"),
                }));
                return result;
            }
        },
    };

    info!(
        "[{}/{}] Starting {} ({})",
        result.index + 1,
        total,
        result.domain,
        result.url
    );
    result.start(job.work_dir());
    let outcome = job.run().await;
    if let Err(e) = &outcome {
        warn!(index = result.index, domain = %result.domain, error = %e, "Job failed");
    }
    result.finish(outcome);
    result
}

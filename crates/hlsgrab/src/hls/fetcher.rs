// HLS Segment Pool: downloads, decrypts and stores every segment of one job
// through a bounded set of concurrent tasks.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::Client;
use reqwest::header::RANGE;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::JobConfig;
use crate::error::JobError;
use crate::headers::HeaderProfile;
use crate::hls::decryption::{Decryptor, KeySet};
use crate::hls::playlist::Segment;
use crate::hls::retry::{RetryAction, RetryPolicy, retry_with_delay};
use crate::hls::state::{SegmentStatus, StateManager};

const KNOWN_EXTENSIONS: &[&str] = &["ts", "m4s", "mp4", "aac", "m4a", "mp3", "wav", "webm", "ogg"];

/// `segment_00042.ts`: zero-padded index plus the extension of the remote
/// file when it is a known media type.
pub fn segment_file_name(segment: &Segment) -> String {
    let ext = Path::new(segment.uri.path())
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|e| KNOWN_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or_else(|| "ts".to_string());
    format!("segment_{:05}.{ext}", segment.index)
}

/// What the pool achieved for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolOutcome {
    /// Completed segment files in index order.
    pub completed: Vec<(usize, PathBuf)>,
    /// Indices without a completed file, ascending.
    pub missing: Vec<usize>,
    /// Scheduling stopped early because a segment failed under abort-on-error.
    pub aborted: bool,
    /// Segments downloaded in this run.
    pub fetched: usize,
    /// Segments already completed by an earlier run.
    pub skipped: usize,
}

pub struct SegmentPool {
    client: Client,
    profile: Arc<HeaderProfile>,
    keys: Arc<KeySet>,
    decryptor: Decryptor,
    state: Arc<StateManager>,
    work_dir: PathBuf,
    config: Arc<JobConfig>,
    retry: RetryPolicy,
    token: CancellationToken,
    /// Indices whose injected failure has already fired.
    injected: Mutex<HashSet<usize>>,
}

impl SegmentPool {
    pub fn new(
        client: Client,
        profile: Arc<HeaderProfile>,
        keys: Arc<KeySet>,
        state: Arc<StateManager>,
        work_dir: PathBuf,
        config: Arc<JobConfig>,
        token: CancellationToken,
    ) -> Self {
        Self {
            client,
            profile,
            keys,
            decryptor: Decryptor::new(config.offload_decryption),
            state,
            work_dir,
            retry: RetryPolicy::from_config(&config),
            config,
            token,
            injected: Mutex::new(HashSet::new()),
        }
    }

    /// Run every segment through the pool.
    ///
    /// Per-segment failures are recorded in the state file and reported as
    /// missing indices. Decryption, local I/O and state errors end the job.
    pub async fn run(self: Arc<Self>, segments: &[Segment]) -> Result<PoolOutcome, JobError> {
        let width = self.config.segment_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(width));
        // Cancelled on abort-on-error or a job-fatal error; stops scheduling only.
        let abort = self.token.child_token();
        let mut tasks = JoinSet::new();

        let mut completed: BTreeMap<usize, PathBuf> = BTreeMap::new();
        let mut outcome = PoolOutcome::default();
        let mut fatal: Option<JobError> = None;

        info!(
            segments = segments.len(),
            workers = width,
            "Starting segment downloads"
        );

        for segment in segments {
            if let Some(existing) = self.state.get(segment.index).await
                && existing.status == SegmentStatus::Completed
                && let Some(path) = existing.path
            {
                debug!(index = segment.index, "Segment already completed, skipping");
                completed.insert(segment.index, path);
                outcome.skipped += 1;
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = abort.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit.map_err(|e| JobError::Internal {
                    reason: format!("segment semaphore closed: {e}"),
                })?,
            };

            while let Some(joined) = tasks.try_join_next() {
                self.collect(joined, &abort, &mut completed, &mut outcome, &mut fatal);
            }
            if abort.is_cancelled() {
                break;
            }

            let pool = self.clone();
            let segment = segment.clone();
            let abort = abort.clone();
            tasks.spawn(async move {
                let index = segment.index;
                let result = pool.process_segment(segment, &abort).await;
                drop(permit);
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            self.collect(joined, &abort, &mut completed, &mut outcome, &mut fatal);
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if self.token.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        outcome.missing = segments
            .iter()
            .map(|s| s.index)
            .filter(|i| !completed.contains_key(i))
            .collect();
        outcome.completed = completed.into_iter().collect();

        info!(
            completed = outcome.completed.len(),
            fetched = outcome.fetched,
            skipped = outcome.skipped,
            missing = outcome.missing.len(),
            aborted = outcome.aborted,
            "Segment downloads finished"
        );
        Ok(outcome)
    }

    fn collect(
        &self,
        joined: Result<(usize, Result<PathBuf, JobError>), tokio::task::JoinError>,
        abort: &CancellationToken,
        completed: &mut BTreeMap<usize, PathBuf>,
        outcome: &mut PoolOutcome,
        fatal: &mut Option<JobError>,
    ) {
        match joined {
            Ok((index, Ok(path))) => {
                completed.insert(index, path);
                outcome.fetched += 1;
            }
            Ok((_, Err(JobError::Cancelled))) => {}
            Ok((index, Err(e))) if !e.is_job_fatal() => {
                if self.config.abort_on_error {
                    warn!(index, "Aborting remaining segments after permanent failure");
                    outcome.aborted = true;
                    abort.cancel();
                }
            }
            Ok((index, Err(e))) => {
                error!(index, error = %e, "Job-fatal segment error");
                abort.cancel();
                fatal.get_or_insert(e);
            }
            Err(join_err) => {
                error!(error = ?join_err, "Segment task panicked");
                abort.cancel();
                fatal.get_or_insert(JobError::Internal {
                    reason: format!("segment task failed: {join_err}"),
                });
            }
        }
    }

    #[instrument(skip_all, fields(index = segment.index))]
    async fn process_segment(
        &self,
        segment: Segment,
        abort: &CancellationToken,
    ) -> Result<PathBuf, JobError> {
        // Spawned but not started before the pool stopped scheduling.
        if abort.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let index = segment.index;
        self.state
            .set_status(index, SegmentStatus::Downloading, None)
            .await?;

        match self.download_and_store(&segment).await {
            Ok(path) => {
                self.state.set_completed(index, path.clone()).await?;
                debug!(path = %path.display(), "Segment stored");
                Ok(path)
            }
            Err(JobError::Cancelled) => {
                self.state
                    .set_status(index, SegmentStatus::Pending, None)
                    .await?;
                Err(JobError::Cancelled)
            }
            Err(e) => {
                warn!(error = %e, "Segment failed");
                self.state
                    .set_status(index, SegmentStatus::Failed, Some(e.to_string()))
                    .await?;
                if self.config.abort_on_error || e.is_job_fatal() {
                    abort.cancel();
                }
                Err(e)
            }
        }
    }

    async fn download_and_store(&self, segment: &Segment) -> Result<PathBuf, JobError> {
        let pool = self;
        let data = retry_with_delay(&self.retry, &self.token, move |attempt| {
            pool.fetch_attempt(segment, attempt)
        })
        .await?;

        let data = match self.keys.for_segment(segment) {
            Some(key) => {
                let iv = key.iv_for(segment, self.config.iv_source);
                self.decryptor
                    .decrypt(segment.index, data, &key.key, &iv)
                    .await?
            }
            None => data,
        };

        let path = self.work_dir.join(segment_file_name(segment));
        tokio::fs::write(&path, &data).await?;
        Ok(path)
    }

    async fn fetch_attempt(&self, segment: &Segment, attempt: u32) -> RetryAction<Bytes> {
        let result = self.fetch_bytes(segment).await;
        if let Err(e) = &result
            && e.is_retryable()
            && attempt < self.retry.max_retries
            && let Err(state_err) = self.state.record_retry(segment.index, e.to_string()).await
        {
            return RetryAction::Fail(state_err);
        }
        RetryAction::from(result)
    }

    async fn fetch_bytes(&self, segment: &Segment) -> Result<Bytes, JobError> {
        let index = segment.index;
        if let Some(faults) = &self.config.fault_injection
            && faults.applies_to(index)
            && self.injected.lock().insert(index)
        {
            return Err(JobError::SegmentFetch {
                index,
                reason: "injected failure".to_string(),
                retryable: true,
            });
        }

        let mut request = self
            .profile
            .apply(self.client.get(segment.uri.clone()))
            .timeout(self.config.http.segment_timeout);
        if let Some(range) = segment.byte_range {
            request = request.header(RANGE, range.header_value());
        }

        let response = request
            .send()
            .await
            .map_err(|e| JobError::segment_transport(index, &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(JobError::segment_status(index, status, segment.uri.as_str()));
        }
        response
            .bytes()
            .await
            .map_err(|e| JobError::segment_transport(index, &e))
    }
}

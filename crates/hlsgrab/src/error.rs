use reqwest::StatusCode;

/// Everything that can end a job, a segment or a whole batch.
///
/// Segment-level variants are contained by the segment pool; job-level
/// variants are turned into a failed job result by the orchestrator. Only
/// [`JobError::BatchManifest`] aborts a run before any job starts.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("failed to fetch manifest {url}: {reason}")]
    ManifestFetch { url: String, reason: String },

    #[error("failed to parse manifest {url}: {reason}")]
    ManifestParse { url: String, reason: String },

    #[error("failed to fetch decryption key {url}: {reason}")]
    KeyFetch { url: String, reason: String },

    #[error("decryption failed for segment {index}: {reason}")]
    Decryption { index: usize, reason: String },

    #[error("segment {index} fetch failed: {reason}")]
    SegmentFetch {
        index: usize,
        reason: String,
        retryable: bool,
    },

    #[error("{failed} of {total} segments failed")]
    SegmentsFailed { failed: usize, total: usize },

    #[error("no segment was downloaded successfully ({total} in playlist)")]
    NoSegments { total: usize },

    #[error("merge failed: {reason}")]
    Merge { reason: String },

    #[error("invalid batch manifest {path}: {reason}")]
    BatchManifest { path: String, reason: String },

    #[error("state file error at {path}: {reason}")]
    State { path: String, reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl JobError {
    pub fn invalid_url(input: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    pub fn manifest_fetch(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::ManifestFetch {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn manifest_parse(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::ManifestParse {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn key_fetch(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::KeyFetch {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn decryption(index: usize, reason: impl ToString) -> Self {
        Self::Decryption {
            index,
            reason: reason.to_string(),
        }
    }

    /// Non-success status while fetching a segment.
    ///
    /// Every status is retried, client errors included.
    pub fn segment_status(index: usize, status: StatusCode, url: &str) -> Self {
        Self::SegmentFetch {
            index,
            reason: format!("HTTP {status} for {url}"),
            retryable: true,
        }
    }

    pub fn segment_transport(index: usize, source: &reqwest::Error) -> Self {
        Self::SegmentFetch {
            index,
            reason: source.to_string(),
            retryable: is_retryable_reqwest_error(source),
        }
    }

    pub fn merge(reason: impl ToString) -> Self {
        Self::Merge {
            reason: reason.to_string(),
        }
    }

    pub fn batch_manifest(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::BatchManifest {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn state(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::State {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SegmentFetch { retryable, .. } => *retryable,
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::ManifestFetch { .. }
            | Self::ManifestParse { .. }
            | Self::KeyFetch { .. }
            | Self::Decryption { .. }
            | Self::SegmentsFailed { .. }
            | Self::NoSegments { .. }
            | Self::Merge { .. }
            | Self::BatchManifest { .. }
            | Self::State { .. }
            | Self::Io { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Errors that end the whole job rather than a single segment.
    pub fn is_job_fatal(&self) -> bool {
        !matches!(self, Self::SegmentFetch { .. })
    }
}

/// Classify a reqwest error as retryable or non-retryable.
///
/// Every transport failure is retried; only a request that could not be
/// built is not.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    !e.is_builder()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let err = JobError::segment_status(3, StatusCode::BAD_GATEWAY, "http://x/3.ts");
        assert!(err.is_retryable());
        assert!(!err.is_job_fatal());

        let err = JobError::segment_status(3, StatusCode::TOO_MANY_REQUESTS, "http://x/3.ts");
        assert!(err.is_retryable());
    }

    #[test]
    fn client_errors_are_retryable_too() {
        for status in [StatusCode::NOT_FOUND, StatusCode::FORBIDDEN, StatusCode::GONE] {
            let err = JobError::segment_status(0, status, "http://x/0.ts");
            assert!(err.is_retryable(), "{status}");
            assert!(!err.is_job_fatal());
        }
        let err = JobError::segment_status(0, StatusCode::NOT_FOUND, "http://x/0.ts");
        assert!(err.to_string().contains("HTTP 404"));
    }

    #[test]
    fn job_level_errors_are_fatal() {
        assert!(JobError::manifest_fetch("http://x/a.m3u8", "HTTP 404").is_job_fatal());
        assert!(JobError::decryption(1, "bad padding").is_job_fatal());
        assert!(JobError::merge("exit status 1").is_job_fatal());
    }
}

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";
pub const DEFAULT_ACCEPT: &str = "*/*";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "zh-CN,zh;q=0.9";
pub const DEFAULT_SEC_FETCH_SITE: &str = "same-origin";
pub const DEFAULT_SEC_FETCH_MODE: &str = "cors";
pub const DEFAULT_SEC_FETCH_DEST: &str = "empty";

/// Name of the per-job progress snapshot inside the working directory.
pub const STATE_FILE_NAME: &str = "download_state.json";
/// Name of the ordered input list handed to the concatenation tool.
pub const FILE_LIST_NAME: &str = "file_list.txt";

/// Proxy configuration types
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ProxyType {
    /// HTTP proxy
    Http,
    /// HTTPS proxy
    Https,
    /// SOCKS5 proxy
    Socks5,
}

/// Proxy authentication
#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

/// HTTP transport options shared by every request a job makes.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Timeout for a single segment request
    pub segment_timeout: Duration,

    /// Timeout for manifest and key requests
    pub manifest_timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,

    pub danger_accept_invalid_certs: bool,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing
    pub pool_idle_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            segment_timeout: Duration::from_secs(60),
            manifest_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            follow_redirects: true,
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Fallback values for request headers a capture record did not provide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderDefaults {
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    /// Sent when the capture has none; otherwise the playlist directory URL is used
    pub referer: Option<String>,
    pub sec_fetch_site: String,
    pub sec_fetch_mode: String,
    pub sec_fetch_dest: String,
}

impl Default for HeaderDefaults {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            accept: DEFAULT_ACCEPT.to_owned(),
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_owned(),
            referer: None,
            sec_fetch_site: DEFAULT_SEC_FETCH_SITE.to_owned(),
            sec_fetch_mode: DEFAULT_SEC_FETCH_MODE.to_owned(),
            sec_fetch_dest: DEFAULT_SEC_FETCH_DEST.to_owned(),
        }
    }
}

/// How the completed segments are joined into the final file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeTool {
    /// Run the external concat tool; the first usable candidate wins.
    /// Bare program names are looked up on `PATH`.
    External { candidates: Vec<PathBuf> },
    /// Append segment bytes in order. Only meaningful for MPEG-TS segments.
    Binary,
}

impl Default for MergeTool {
    fn default() -> Self {
        Self::External {
            candidates: vec![PathBuf::from("ffmpeg")],
        }
    }
}

/// Deterministic segment failures for exercising retry and abort paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultInjection {
    /// Indices with `index % 5` equal to 2 or 4 fail their first attempt.
    EveryFifth,
    /// The listed indices fail their first attempt.
    Indices(Vec<usize>),
}

impl FaultInjection {
    pub fn applies_to(&self, index: usize) -> bool {
        match self {
            Self::EveryFifth => matches!(index % 5, 2 | 4),
            Self::Indices(indices) => indices.contains(&index),
        }
    }
}

/// Where the IV comes from when a key tag carries no `IV` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum IvSource {
    /// Zero-based position of the segment in the playlist
    #[default]
    SegmentIndex,
    /// `EXT-X-MEDIA-SEQUENCE` plus the segment position (RFC 8216)
    MediaSequence,
}

/// Per-job knobs. Built once before any job starts and shared read-only.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Width of the per-job segment worker pool
    pub segment_concurrency: usize,
    /// Retries after the first failed attempt of a segment
    pub max_retries: u32,
    /// Wait between attempts
    pub retry_delay: Duration,
    /// Add up to half of `retry_delay` of random jitter to each wait
    pub retry_jitter: bool,
    /// Keep segment files and the state file after a successful merge
    pub keep_segments: bool,
    /// Stop scheduling segments once one has failed permanently
    pub abort_on_error: bool,
    pub fault_injection: Option<FaultInjection>,
    pub merge_tool: MergeTool,
    /// Run decryption on the blocking thread pool
    pub offload_decryption: bool,
    pub iv_source: IvSource,
    pub headers: HeaderDefaults,
    pub http: HttpConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            segment_concurrency: 10,
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            retry_jitter: false,
            keep_segments: false,
            abort_on_error: false,
            fault_injection: None,
            merge_tool: MergeTool::default(),
            offload_decryption: true,
            iv_source: IvSource::default(),
            headers: HeaderDefaults::default(),
            http: HttpConfig::default(),
        }
    }
}

/// Batch-wide knobs.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Width of the outer job pool
    pub job_concurrency: usize,
    /// Root for per-job working directories and the batch report
    pub output_dir: PathBuf,
    pub job: JobConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            job_concurrency: 3,
            output_dir: PathBuf::from("downloads"),
            job: JobConfig::default(),
        }
    }
}

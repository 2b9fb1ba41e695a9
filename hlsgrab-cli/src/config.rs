//! Optional TOML configuration file.
//!
//! Precedence: command line flags, then the file, then engine defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hlsgrab_engine::{
    BatchConfig, FaultInjection, IvSource, MergeTool, ProxyAuth, ProxyConfig, ProxyType,
};
use serde::Deserialize;
use tracing::debug;

use crate::cli::Args;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub output_dir: Option<PathBuf>,
    pub max_concurrent: Option<usize>,
    pub max_workers: Option<usize>,
    pub retries: Option<u32>,
    /// Seconds
    pub retry_delay: Option<f64>,
    pub retry_jitter: Option<bool>,
    pub keep_segments: Option<bool>,
    pub abort_on_error: Option<bool>,
    /// Concat tool candidates, tried in order
    pub ffmpeg: Option<Vec<PathBuf>>,
    pub binary_merge: Option<bool>,
    pub iv_source: Option<IvSource>,
    pub http: HttpSection,
    pub headers: HeadersSection,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSection {
    /// Segment request timeout, seconds
    pub timeout: Option<u64>,
    /// Manifest and key request timeout, seconds
    pub manifest_timeout: Option<u64>,
    pub connect_timeout: Option<u64>,
    pub follow_redirects: Option<bool>,
    pub proxy: Option<String>,
    pub proxy_user: Option<String>,
    pub proxy_pass: Option<String>,
    pub use_system_proxy: Option<bool>,
    pub accept_invalid_certs: Option<bool>,
}

/// Fallbacks for headers a capture record does not carry.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeadersSection {
    pub user_agent: Option<String>,
    pub accept: Option<String>,
    pub accept_language: Option<String>,
    pub referer: Option<String>,
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hlsgrab").join("config.toml"))
    }

    /// Load `path`, or the default location when `path` is `None`.
    ///
    /// An explicit path must exist; a missing default file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !explicit && !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|source| AppError::ConfigRead {
            path: path.clone(),
            source,
        })?;
        let config = Self::parse(&content, &path)?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|source| AppError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Merge with the command line into the engine configuration.
    pub fn into_batch_config(self, args: &Args) -> Result<BatchConfig> {
        let mut config = BatchConfig::default();

        if let Some(dir) = args.output_dir.clone().or(self.output_dir) {
            config.output_dir = dir;
        }
        if let Some(n) = args.max_concurrent.or(self.max_concurrent) {
            config.job_concurrency = positive("max_concurrent", n)?;
        }

        let job = &mut config.job;
        if let Some(n) = args.max_workers.or(self.max_workers) {
            job.segment_concurrency = positive("max_workers", n)?;
        }
        if let Some(n) = args.retries.or(self.retries) {
            job.max_retries = n;
        }
        if let Some(secs) = args.retry_delay.or(self.retry_delay) {
            job.retry_delay = Duration::try_from_secs_f64(secs).map_err(|e| {
                AppError::InvalidConfig(format!("retry_delay {secs}: {e}"))
            })?;
        }
        if let Some(jitter) = self.retry_jitter {
            job.retry_jitter = jitter;
        }
        job.keep_segments = args.keep_segments || self.keep_segments.unwrap_or(false);
        job.abort_on_error = args.abort_on_error || self.abort_on_error.unwrap_or(false);
        if args.test_mode {
            job.fault_injection = Some(FaultInjection::EveryFifth);
        }

        let binary = args.binary_merge || (args.ffmpeg.is_empty() && self.binary_merge.unwrap_or(false));
        if binary {
            job.merge_tool = MergeTool::Binary;
        } else if !args.ffmpeg.is_empty() {
            job.merge_tool = MergeTool::External {
                candidates: args.ffmpeg.clone(),
            };
        } else if let Some(candidates) = self.ffmpeg.filter(|c| !c.is_empty()) {
            job.merge_tool = MergeTool::External { candidates };
        }
        if let Some(source) = args.iv_source.or(self.iv_source) {
            job.iv_source = source;
        }

        let http = &mut job.http;
        let file_http = self.http;
        if let Some(secs) = file_http.timeout {
            http.segment_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file_http.manifest_timeout {
            http.manifest_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file_http.connect_timeout {
            http.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(follow) = file_http.follow_redirects {
            http.follow_redirects = follow;
        }
        if let Some(system) = file_http.use_system_proxy {
            http.use_system_proxy = system;
        }
        if let Some(accept) = file_http.accept_invalid_certs {
            http.danger_accept_invalid_certs = accept;
        }

        let (proxy_url, proxy_user, proxy_pass) = if args.proxy.is_some() {
            (args.proxy.clone(), args.proxy_user.clone(), args.proxy_pass.clone())
        } else {
            (file_http.proxy, file_http.proxy_user, file_http.proxy_pass)
        };
        if let Some(url) = proxy_url {
            let proxy_type = args.proxy_type.unwrap_or_else(|| proxy_type_for(&url));
            http.proxy = Some(ProxyConfig {
                url,
                proxy_type,
                auth: proxy_user.map(|username| ProxyAuth {
                    username,
                    password: proxy_pass.unwrap_or_default(),
                }),
            });
        }

        let headers = &mut job.headers;
        if let Some(ua) = args.user_agent.clone().or(self.headers.user_agent) {
            headers.user_agent = ua;
        }
        if let Some(referer) = args.referer.clone().or(self.headers.referer) {
            headers.referer = Some(referer);
        }
        if let Some(accept) = self.headers.accept {
            headers.accept = accept;
        }
        if let Some(lang) = self.headers.accept_language {
            headers.accept_language = lang;
        }

        Ok(config)
    }
}

fn positive(name: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(AppError::InvalidConfig(format!("{name} must be at least 1")));
    }
    Ok(value)
}

fn proxy_type_for(url: &str) -> ProxyType {
    let scheme = url.split_once("://").map(|(s, _)| s.to_ascii_lowercase());
    match scheme.as_deref() {
        Some("socks5" | "socks5h") => ProxyType::Socks5,
        Some("https") => ProxyType::Https,
        _ => ProxyType::Http,
    }
}

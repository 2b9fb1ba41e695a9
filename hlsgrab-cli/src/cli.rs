use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use hlsgrab_engine::{IvSource, ProxyType};

/// Download HLS streams listed in a capture file, or a single playlist URL.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "hlsgrab", author, version, about, long_about = None)]
#[command(group(ArgGroup::new("input").required(true).args(["url", "batch"])))]
pub struct Args {
    /// Media playlist URL to download
    pub url: Option<String>,

    /// Batch manifest (JSON capture file) listing the streams to download
    #[arg(short, long, value_name = "FILE")]
    pub batch: Option<PathBuf>,

    /// Root directory for job working directories and the report
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Number of streams downloaded at the same time
    #[arg(long, value_name = "N")]
    pub max_concurrent: Option<usize>,

    /// Number of concurrent segment downloads per stream
    #[arg(long, value_name = "N")]
    pub max_workers: Option<usize>,

    /// Retries per segment after the first failed attempt
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Seconds to wait between segment attempts
    #[arg(long, value_name = "SECS")]
    pub retry_delay: Option<f64>,

    /// Keep segment files and the state file after merging
    #[arg(long)]
    pub keep_segments: bool,

    /// Stop a stream as soon as one of its segments fails permanently
    #[arg(long)]
    pub abort_on_error: bool,

    /// Fail the first attempt of some segments on purpose
    #[arg(long)]
    pub test_mode: bool,

    /// Concat tool to use instead of `ffmpeg` on PATH (repeatable, tried in order)
    #[arg(long, value_name = "PATH", conflicts_with = "binary_merge")]
    pub ffmpeg: Vec<PathBuf>,

    /// Join segments by appending bytes instead of running ffmpeg
    #[arg(long)]
    pub binary_merge: bool,

    /// IV for AES-128 keys without an explicit one
    #[arg(long, value_enum, value_name = "SOURCE")]
    pub iv_source: Option<IvSource>,

    /// User-Agent for entries whose capture has none
    #[arg(long, value_name = "UA")]
    pub user_agent: Option<String>,

    /// Referer for entries whose capture has none (default: playlist directory URL)
    #[arg(long, value_name = "URL")]
    pub referer: Option<String>,

    /// Proxy server URL
    #[arg(long, env = "HLSGRAB_PROXY")]
    pub proxy: Option<String>,

    /// Proxy type; inferred from the proxy URL scheme when omitted
    #[arg(long, value_enum, requires = "proxy")]
    pub proxy_type: Option<ProxyType>,

    /// Proxy username
    #[arg(long, requires = "proxy")]
    pub proxy_user: Option<String>,

    /// Proxy password
    #[arg(long, requires = "proxy_user")]
    pub proxy_pass: Option<String>,

    /// Configuration file (default: <config dir>/hlsgrab/config.toml)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}
